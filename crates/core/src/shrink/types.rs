//! Shrink parameters and track selection.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{Result, ShrinkError};
use crate::media::{Extractor, MediaKind};
use crate::reencode::ReencodeTarget;

/// Progress weight of registering one track with the muxer.
pub const PROGRESS_ADD_TRACK: u32 = 10;

/// Progress weight of writing one track's content.
pub const PROGRESS_WRITE_CONTENT: u32 = 40;

/// What a shrink produces. Applies to every job of a worker binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShrinkParams {
    /// Output video width. Must be a multiple of 16.
    pub width: u32,
    /// Output video bit rate in bits per second.
    pub video_bitrate: u32,
    /// Output audio bit rate in bits per second.
    pub audio_bitrate: u32,
    /// Longest accepted source in seconds. Zero disables the check.
    #[serde(default)]
    pub duration_limit_secs: u64,
}

impl ShrinkParams {
    pub fn new(width: u32, video_bitrate: u32, audio_bitrate: u32) -> Self {
        Self {
            width,
            video_bitrate,
            audio_bitrate,
            duration_limit_secs: 0,
        }
    }

    pub fn with_duration_limit_secs(mut self, limit: u64) -> Self {
        self.duration_limit_secs = limit;
        self
    }

    pub fn video_target(&self) -> Result<ReencodeTarget> {
        ReencodeTarget::video(self.width, self.video_bitrate)
    }

    pub fn audio_target(&self) -> Result<ReencodeTarget> {
        ReencodeTarget::audio(self.audio_bitrate)
    }

    /// Checks every parameter without building anything.
    pub fn validate(&self) -> Result<()> {
        self.video_target()?;
        self.audio_target()?;
        Ok(())
    }
}

/// Tracks of a source that will be reencoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSelection {
    pub video: Option<usize>,
    pub audio: Option<usize>,
}

impl TrackSelection {
    /// Selected tracks in processing order: video first.
    pub fn tracks(&self) -> Vec<(MediaKind, usize)> {
        let video = self.video.map(|t| (MediaKind::Video, t));
        let audio = self.audio.map(|t| (MediaKind::Audio, t));
        video.into_iter().chain(audio).collect()
    }

    pub fn len(&self) -> usize {
        self.video.is_some() as usize + self.audio.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total progress budget of the selection.
    pub fn max_progress(&self) -> u32 {
        self.len() as u32 * (PROGRESS_ADD_TRACK + PROGRESS_WRITE_CONTENT)
    }
}

/// Keeps the first video and the first audio track. Later tracks of the same
/// kind and tracks of other kinds are dropped.
pub fn select_tracks(extractor: &dyn Extractor) -> Result<TrackSelection> {
    let mut selection = TrackSelection::default();
    for index in 0..extractor.track_count() {
        let format = extractor.track_format(index)?;
        debug!("track[{}] format: {:?}", index, format);
        let slot = match format.kind() {
            Some(MediaKind::Video) => &mut selection.video,
            Some(MediaKind::Audio) => &mut selection.audio,
            None => {
                error!(
                    "drop track. unsupported format. track: {}, mime: {}",
                    index, format.mime
                );
                continue;
            }
        };
        if slot.is_some() {
            warn!(
                "drop track. only one {} track is supported. track: {}",
                format.mime, index
            );
            continue;
        }
        *slot = Some(index);
    }

    if selection.is_empty() {
        return Err(ShrinkError::source_unreadable("no audio or video track found"));
    }
    Ok(selection)
}
