//! Video track reencoder.
//!
//! Decoded frames never pass through process memory: the decoder renders
//! into the [`FrameRenderer`]'s surface and the renderer draws onto the
//! encoder's input surface. Frames arriving faster than the nominal frame
//! rate allows are dropped before they reach the encoder.
//!
//! The thread calling [`VideoReencoder::shrink`] must be the one that created
//! the backend's frame renderer, and must not be the thread delivering frame
//! notifications.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::pump::{self, PumpEnv, PumpOutcome, PumpState, Sink, TrackStrategy};
use super::types::{
    ProgressListener, PumpConfig, PumpHooks, ReencodeTarget, SnapshotConfig, VIDEO_ENCODE_MIME,
    VIDEO_FRAME_RATE, VIDEO_I_FRAME_INTERVAL,
};
use super::TrackReencoder;
use crate::error::{CodecRole, Result, ShrinkError};
use crate::media::{
    Codec, CodecSetup, Extractor, FrameRenderer, InputSurface, MediaBackend, MediaFormat,
    MediaKind, Muxer, SnapshotRequest,
};

/// Frames closer together than this (by decoder time) are dropped.
pub const MAX_FRAME_INTERVAL_MS: f64 = 1000.0 / (VIDEO_FRAME_RATE as f64 * 1.1);

const SNAPSHOT_FILE_PREFIX: &str = "mediashrink-snapshot";

/// Reencodes one video track to H.264 at a smaller width.
pub struct VideoReencoder {
    backend: Arc<dyn MediaBackend>,
    target: ReencodeTarget,
    rotation: u32,
    config: PumpConfig,
    hooks: PumpHooks,
    progress: Option<ProgressListener>,
}

impl VideoReencoder {
    /// `rotation` is the clockwise display rotation of the source in degrees.
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        target: ReencodeTarget,
        rotation: u32,
        config: PumpConfig,
        hooks: PumpHooks,
    ) -> Result<Self> {
        if target.width.is_none() {
            return Err(ShrinkError::invalid_config("video target requires a width"));
        }
        Ok(Self {
            backend,
            target,
            rotation,
            config,
            hooks,
            progress: None,
        })
    }

    fn run(
        &mut self,
        extractor: &mut dyn Extractor,
        track: usize,
        sink: Sink<'_>,
    ) -> Result<PumpOutcome> {
        let env = PumpEnv {
            backend: self.backend.as_ref(),
            config: &self.config,
            hooks: &self.hooks,
            progress: self.progress.as_ref(),
        };
        let mut strategy = VideoStrategy::new(self.target, self.rotation, self.config.snapshots.clone());
        pump::run(&mut strategy, &env, extractor, track, sink)
    }
}

impl TrackReencoder for VideoReencoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn set_progress_listener(&mut self, listener: Option<ProgressListener>) {
        self.progress = listener;
    }

    fn probe_output_format(
        &mut self,
        extractor: &mut dyn Extractor,
        track: usize,
    ) -> Result<MediaFormat> {
        match self.run(extractor, track, Sink::Probe)? {
            PumpOutcome::FormatProbed(format) => Ok(format),
            PumpOutcome::Finished(_) => Err(ShrinkError::Aborted),
        }
    }

    fn shrink(
        &mut self,
        extractor: &mut dyn Extractor,
        track: usize,
        muxer: &mut dyn Muxer,
        output_track: usize,
    ) -> Result<()> {
        self.run(
            extractor,
            track,
            Sink::Mux {
                muxer,
                track: output_track,
            },
        )
        .map(|_| ())
    }
}

/// Rounds to the nearest multiple of 16. Never returns less than 16.
pub fn nearest_multiple_of_16(value: f64) -> u32 {
    let rounded = value.round().max(0.0) as u32;
    let rem = rounded % 16;
    let result = if rem < 8 {
        rounded - rem
    } else {
        rounded + 16 - rem
    };
    result.max(16)
}

/// Encoder configuration for `source` scaled to `target`.
///
/// Only usable to configure the encoder; the muxer needs the format the
/// encoder reports back.
pub fn encoder_configuration_format(
    source: &MediaFormat,
    rotation: u32,
    target: &ReencodeTarget,
) -> Result<MediaFormat> {
    let width = target
        .width
        .ok_or_else(|| ShrinkError::invalid_config("video target requires a width"))?;
    let (origin_width, origin_height) = match rotation {
        90 | 270 => (source.require_height()?, source.require_width()?),
        _ => (source.require_width()?, source.require_height()?),
    };
    if origin_width == 0 {
        return Err(ShrinkError::source_unreadable("video track has zero width"));
    }
    let ratio = width as f64 / origin_width as f64;
    let height = nearest_multiple_of_16(origin_height as f64 * ratio);

    let mut format = MediaFormat::video(VIDEO_ENCODE_MIME, width, height).with_bit_rate(target.bit_rate);
    format.surface_input = true;
    format.i_frame_interval = Some(VIDEO_I_FRAME_INTERVAL);
    format.frame_rate = Some(VIDEO_FRAME_RATE);
    debug!(
        "video encoder configuration format: {:?}, rotation: {}",
        format, rotation
    );
    Ok(format)
}

/// Whether a frame at `pts_ms` is kept after the last kept frame.
fn keep_frame(last_kept_ms: i64, pts_ms: i64) -> bool {
    // A non-positive last timestamp is an edge case that is never thinned.
    last_kept_ms <= 0 || (pts_ms - last_kept_ms) as f64 >= MAX_FRAME_INTERVAL_MS
}

struct SnapshotPlan {
    dir: PathBuf,
    count: u32,
    spacing_us: i64,
    width: u32,
    height: u32,
    next_index: u32,
}

impl SnapshotPlan {
    fn request_for(&mut self, pts_us: i64) -> Option<SnapshotRequest> {
        if self.next_index >= self.count || (self.next_index as i64) * self.spacing_us > pts_us {
            return None;
        }
        let file = self.dir.join(format!(
            "{}{}_{}.jpg",
            SNAPSHOT_FILE_PREFIX,
            self.next_index,
            pts_us / 1000
        ));
        self.next_index += 1;
        Some(SnapshotRequest {
            file,
            width: self.width,
            height: self.height,
        })
    }
}

struct VideoStrategy {
    target: ReencodeTarget,
    rotation: u32,
    snapshot_config: Option<SnapshotConfig>,
    snapshots: Option<SnapshotPlan>,
    renderer: Option<Box<dyn FrameRenderer>>,
    input_surface: Option<Box<dyn InputSurface>>,
    frames_decoded: u64,
    last_kept_ms: i64,
}

impl VideoStrategy {
    fn new(target: ReencodeTarget, rotation: u32, snapshot_config: Option<SnapshotConfig>) -> Self {
        Self {
            target,
            rotation,
            snapshot_config,
            snapshots: None,
            renderer: None,
            input_surface: None,
            frames_decoded: 0,
            last_kept_ms: 0,
        }
    }
}

impl TrackStrategy for VideoStrategy {
    const KIND: MediaKind = MediaKind::Video;

    fn create_decoder(
        &mut self,
        env: &PumpEnv<'_>,
        source_format: &MediaFormat,
    ) -> Result<Box<dyn Codec>> {
        let renderer = self
            .renderer
            .insert(env.backend.create_frame_renderer(self.rotation as f32)?);
        let surface = renderer.surface();
        pump::create_codec(
            env.backend.codecs(),
            Self::KIND,
            CodecRole::Decoder,
            source_format,
            CodecSetup::Decoder {
                surface: Some(surface),
            },
        )
    }

    fn create_encoder(
        &mut self,
        env: &PumpEnv<'_>,
        source_format: &MediaFormat,
        _decoder_output_format: &MediaFormat,
    ) -> Result<Box<dyn Codec>> {
        let format = encoder_configuration_format(source_format, self.rotation, &self.target)?;
        let mut encoder = pump::create_codec(
            env.backend.codecs(),
            Self::KIND,
            CodecRole::Encoder,
            &format,
            CodecSetup::Encoder,
        )?;
        self.input_surface = Some(encoder.create_input_surface()?);
        encoder.start()?;

        if let (Some(config), Some(duration_us)) = (&self.snapshot_config, source_format.duration_us) {
            if config.count > 0 {
                self.snapshots = Some(SnapshotPlan {
                    dir: config.dir.clone(),
                    count: config.count,
                    spacing_us: duration_us / config.count as i64,
                    width: format.require_width()?,
                    height: format.require_height()?,
                    next_index: 0,
                });
            }
        }
        Ok(encoder)
    }

    fn feed_encoder(
        &mut self,
        _env: &PumpEnv<'_>,
        state: &mut PumpState,
        decoder: &mut dyn Codec,
        encoder: &mut dyn Codec,
    ) -> Result<()> {
        let Some(staged) = state.staged.take() else {
            return Ok(());
        };
        let info = staged.info;
        let render = info.size != 0;
        decoder.release_output_buffer(staged.index, render)?;

        if render {
            self.frames_decoded += 1;
            let snapshot = self
                .snapshots
                .as_mut()
                .and_then(|plan| plan.request_for(info.presentation_time_us));
            let (Some(renderer), Some(surface)) = (self.renderer.as_mut(), self.input_surface.as_mut())
            else {
                return Err(ShrinkError::codec("video surfaces are not set up"));
            };
            renderer.draw_next_frame(surface.as_mut(), snapshot.as_ref())?;

            let pts_ms = info.presentation_time_us / 1000;
            if keep_frame(self.last_kept_ms, pts_ms) {
                surface.set_presentation_time_ns(info.presentation_time_us * 1000)?;
                surface.swap_buffers()?;
                self.last_kept_ms = pts_ms;
                state.stats.samples_submitted += 1;
            } else {
                info!(
                    "Frame removed because frame interval is too short. current: {}, last: {}",
                    pts_ms, self.last_kept_ms
                );
            }
        }

        if info.flags.is_end_of_stream() {
            if self.frames_decoded == 0 {
                return Err(ShrinkError::NoSamples { kind: Self::KIND });
            }
            debug!("video decoder: EOS, frames: {}", self.frames_decoded);
            state.decoder_done = true;
            encoder.signal_end_of_input_stream()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut surface) = self.input_surface.take() {
            surface.release();
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.release();
        }
    }
}
