//! Track reencoding.
//!
//! A [`TrackReencoder`] drives one track through
//! extractor → decoder → encoder → muxer. Two operations share the same pump:
//!
//! - [`TrackReencoder::probe_output_format`] runs until the encoder reports
//!   the format it negotiated, so the track can be added to a muxer that has
//!   not started yet.
//! - [`TrackReencoder::shrink`] runs to end of stream, writing every encoded
//!   sample.
//!
//! Each call opens fresh codecs and releases them before returning.

mod audio;
mod pump;
mod types;
mod video;
mod watchdog;

pub use audio::AudioReencoder;
pub use pump::PumpStats;
pub use types::{
    ProgressListener, PumpConfig, PumpHooks, ReencodeTarget, SnapshotConfig,
    UnrecoverableErrorCallback, AUDIO_ENCODE_MIME, VIDEO_ENCODE_MIME, VIDEO_FRAME_RATE,
    VIDEO_I_FRAME_INTERVAL,
};
pub use video::{
    encoder_configuration_format, nearest_multiple_of_16, VideoReencoder, MAX_FRAME_INTERVAL_MS,
};
pub use watchdog::{stop_with_timeout, ProcessTerminator, Terminator, TERMINATED_EXIT_CODE};

use crate::error::Result;
use crate::media::{Extractor, MediaFormat, MediaKind, Muxer};

/// Reencodes one track of a source.
///
/// Recoverable failures are returned as is. Any other failure is reported
/// through the [`UnrecoverableErrorCallback`] and returned as
/// [`ShrinkError::Aborted`](crate::error::ShrinkError::Aborted).
pub trait TrackReencoder: Send {
    fn kind(&self) -> MediaKind;

    /// Receives percent progress while `shrink` runs.
    fn set_progress_listener(&mut self, listener: Option<ProgressListener>);

    /// Learns the encoder output format without writing anything.
    fn probe_output_format(
        &mut self,
        extractor: &mut dyn Extractor,
        track: usize,
    ) -> Result<MediaFormat>;

    /// Reencodes `track` into `output_track` of a started muxer.
    fn shrink(
        &mut self,
        extractor: &mut dyn Extractor,
        track: usize,
        muxer: &mut dyn Muxer,
        output_track: usize,
    ) -> Result<()>;
}
