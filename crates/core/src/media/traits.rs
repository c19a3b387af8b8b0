//! Trait definitions for the platform media stack.
//!
//! Decoders, encoders, demuxers and muxers are opaque platform capabilities.
//! The reencoder only drives them through these traits.

use std::path::Path;
use std::time::Duration;

use super::types::{
    BufferInfo, CodecRef, CodecSetup, MediaFormat, OutputEvent, SampleFlags, SnapshotRequest,
    SurfaceHandle,
};
use crate::error::Result;

/// Reads samples of selected tracks from a container.
pub trait Extractor: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Result<MediaFormat>;

    /// Selects a track for reading, starting from its first sample.
    fn select_track(&mut self, index: usize) -> Result<()>;

    fn unselect_track(&mut self, index: usize) -> Result<()>;

    /// Copies the current sample into `buf`. Returns `None` when no sample
    /// is available.
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Presentation time of the current sample.
    fn sample_time_us(&self) -> i64;

    fn sample_flags(&self) -> SampleFlags;

    /// Moves to the next sample. Returns false once the source is exhausted.
    fn advance(&mut self) -> bool;

    fn release(&mut self) -> Result<()>;
}

/// Container-level metadata of a source.
pub trait MetadataReader: Send {
    /// Total duration, if the container declares one.
    fn duration_ms(&self) -> Result<Option<u64>>;

    /// Clockwise rotation of the video in degrees.
    fn video_rotation(&self) -> Result<u32>;

    fn release(&mut self) -> Result<()>;
}

/// Writes encoded samples into a new container.
///
/// Every track must be added before `start`.
pub trait Muxer: Send {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize>;

    fn start(&mut self) -> Result<()>;

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);
}

/// A hardware decoder or encoder driven by non-blocking buffer exchange.
pub trait Codec: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);

    /// Index of a free input slot, or `None` when none frees up in time.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>>;

    /// Input slot memory. Its length is the slot capacity.
    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: SampleFlags,
    ) -> Result<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent>;

    fn output_buffer(&self, index: usize) -> Result<&[u8]>;

    /// Returns an output slot. With `render`, a surface-configured decoder
    /// sends the frame to its surface.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<()>;

    fn output_format(&self) -> Result<MediaFormat>;

    /// Tells a surface-input encoder no more frames are coming.
    fn signal_end_of_input_stream(&mut self) -> Result<()>;

    /// Surface feeding a surface-input encoder. Call before `start`.
    fn create_input_surface(&mut self) -> Result<Box<dyn InputSurface>>;
}

/// Encoder input surface frames are drawn on.
pub trait InputSurface: Send {
    fn handle(&self) -> SurfaceHandle;

    fn set_presentation_time_ns(&mut self, time_ns: i64) -> Result<()>;

    /// Submits the drawn frame to the encoder.
    fn swap_buffers(&mut self) -> Result<()>;

    fn release(&mut self);
}

/// GPU hand-off between a decoder's output surface and an encoder's input
/// surface.
///
/// Must be driven from the thread that created it, and that thread must not
/// be the one delivering frame-available notifications, or
/// `draw_next_frame` never returns.
pub trait FrameRenderer: Send {
    /// Surface the decoder renders into.
    fn surface(&self) -> SurfaceHandle;

    /// Blocks until the pending decoded frame is available, then draws it
    /// rotation-corrected onto `target`. Optionally also writes a snapshot.
    fn draw_next_frame(
        &mut self,
        target: &mut dyn InputSurface,
        snapshot: Option<&SnapshotRequest>,
    ) -> Result<()>;

    fn release(&mut self);
}

/// Looks up codec capabilities and instantiates codecs.
pub trait CodecResolver: Send + Sync {
    fn find_decoder(&self, mime: &str) -> Option<CodecRef>;

    fn find_encoder(&self, mime: &str) -> Option<CodecRef>;

    /// Instantiates and configures `codec`. Errors are creation failures.
    fn create(
        &self,
        codec: &CodecRef,
        format: &MediaFormat,
        setup: CodecSetup,
    ) -> Result<Box<dyn Codec>>;
}

/// Entry point to a platform media stack.
pub trait MediaBackend: Send + Sync {
    fn open_extractor(&self, source: &str) -> Result<Box<dyn Extractor>>;

    fn open_metadata(&self, source: &str) -> Result<Box<dyn MetadataReader>>;

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn Muxer>>;

    fn codecs(&self) -> &dyn CodecResolver;

    /// Creates a renderer whose output undoes `rotation` degrees.
    fn create_frame_renderer(&self, rotation: f32) -> Result<Box<dyn FrameRenderer>>;
}
