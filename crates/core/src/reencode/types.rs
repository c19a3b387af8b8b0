//! Configuration and callback types for track reencoding.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::watchdog::Terminator;
use crate::error::{Result, ShrinkError};

/// Mime type of the audio encoder output (AAC).
pub const AUDIO_ENCODE_MIME: &str = "audio/mp4a-latm";

/// Mime type of the video encoder output (H.264).
pub const VIDEO_ENCODE_MIME: &str = "video/avc";

/// Nominal output frame rate used for bitrate accounting.
pub const VIDEO_FRAME_RATE: u32 = 30;

/// Seconds between key frames in the output.
pub const VIDEO_I_FRAME_INTERVAL: u32 = 5;

/// Receives track progress as a percentage.
pub type ProgressListener = Arc<dyn Fn(u32) + Send + Sync>;

/// Receives errors that happen after output may already be half written.
///
/// The implementation is expected to bring the hosting process down.
pub trait UnrecoverableErrorCallback: Send + Sync {
    fn on_unrecoverable_error(&self, error: &ShrinkError);
}

/// Encoding parameters applied to a track reencoder before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencodeTarget {
    /// Output bit rate in bits per second.
    pub bit_rate: u32,
    /// Output width for video. Always a multiple of 16.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
}

impl ReencodeTarget {
    /// Audio target. Sample rate and channel count follow the decoder output.
    pub fn audio(bit_rate: u32) -> Result<Self> {
        if bit_rate == 0 {
            return Err(ShrinkError::invalid_config("audio bit rate must be positive"));
        }
        Ok(Self {
            bit_rate,
            width: None,
        })
    }

    /// Video target scaled to `width`, keeping the aspect ratio.
    pub fn video(width: u32, bit_rate: u32) -> Result<Self> {
        if width == 0 || width % 16 != 0 {
            return Err(ShrinkError::invalid_config(format!(
                "only multiples of 16 are supported as width, got {}",
                width
            )));
        }
        if bit_rate == 0 {
            return Err(ShrinkError::invalid_config("video bit rate must be positive"));
        }
        Ok(Self {
            bit_rate,
            width: Some(width),
        })
    }
}

/// Writes evenly spaced diagnostic frames while reencoding video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub dir: PathBuf,
    #[serde(default = "default_snapshot_count")]
    pub count: u32,
}

fn default_snapshot_count() -> u32 {
    10
}

/// Timing knobs of the pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Bounded wait of every codec dequeue.
    pub dequeue_timeout: Duration,
    /// Minimum wall-clock time between progress reports.
    pub progress_interval: Duration,
    /// How long a codec stop may take before the process is killed.
    pub stop_timeout: Duration,
    pub snapshots: Option<SnapshotConfig>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_micros(250),
            progress_interval: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(10),
            snapshots: None,
        }
    }
}

/// Collaborators every pump reports to.
#[derive(Clone)]
pub struct PumpHooks {
    pub error_callback: Arc<dyn UnrecoverableErrorCallback>,
    pub terminator: Arc<dyn Terminator>,
}

impl PumpHooks {
    pub fn new(
        error_callback: Arc<dyn UnrecoverableErrorCallback>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            error_callback,
            terminator,
        }
    }
}
