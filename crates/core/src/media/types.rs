//! Value types exchanged with the platform media stack.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShrinkError};

/// Elementary stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Classifies a mime type by its prefix.
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.starts_with("video/") {
            Some(Self::Video)
        } else if mime.starts_with("audio/") {
            Some(Self::Audio)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Describes a track or a codec configuration.
///
/// Mirrors the key/value formats platform codecs use: only the mime type is
/// always present, everything else depends on who produced the format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Clockwise display rotation in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    /// Seconds between key frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i_frame_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aac_profile: Option<AacProfile>,
    /// Encoder takes its input from a surface instead of byte buffers.
    #[serde(default)]
    pub surface_input: bool,
}

impl MediaFormat {
    /// Creates an audio format.
    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Default::default()
        }
    }

    /// Creates a video format.
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_rotation(mut self, rotation: u32) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    /// Kind derived from the mime prefix.
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime(&self.mime)
    }

    pub fn require_width(&self) -> Result<u32> {
        self.width.ok_or_else(|| self.missing("width"))
    }

    pub fn require_height(&self) -> Result<u32> {
        self.height.ok_or_else(|| self.missing("height"))
    }

    pub fn require_sample_rate(&self) -> Result<u32> {
        self.sample_rate
            .filter(|rate| *rate > 0)
            .ok_or_else(|| self.missing("sample-rate"))
    }

    pub fn require_channel_count(&self) -> Result<u32> {
        self.channel_count
            .filter(|count| *count > 0)
            .ok_or_else(|| self.missing("channel-count"))
    }

    pub fn require_duration_us(&self) -> Result<i64> {
        self.duration_us.ok_or_else(|| self.missing("durationUs"))
    }

    fn missing(&self, key: &'static str) -> ShrinkError {
        ShrinkError::MissingFormatKey {
            mime: self.mime.clone(),
            key,
        }
    }
}

/// AAC encoder profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AacProfile {
    /// Low complexity.
    Lc,
    /// High efficiency. Some encoders mishandle it (wrong channel count,
    /// broken time base), so the shrinker never requests it.
    He,
}

/// Per-buffer flags as reported by extractors and codecs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(2);
    pub const END_OF_STREAM: Self = Self(4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }

    pub const fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }
}

impl std::ops::BitOr for SampleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Metadata for one dequeued codec buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: SampleFlags,
}

impl BufferInfo {
    pub fn new(offset: usize, size: usize, presentation_time_us: i64, flags: SampleFlags) -> Self {
        Self {
            offset,
            size,
            presentation_time_us,
            flags,
        }
    }
}

/// Result of polling a codec for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// A buffer is ready at `index`.
    Buffer { index: usize, info: BufferInfo },
    /// The output format changed; read it with `Codec::output_format`.
    FormatChanged,
    /// Nothing available within the timeout.
    TryAgainLater,
}

/// Opaque identity of a platform surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Reference to a codec implementation found by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecRef {
    pub name: String,
    pub mime: String,
    pub is_encoder: bool,
}

/// How a codec is being configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSetup {
    /// Decoder, optionally rendering into a surface.
    Decoder { surface: Option<SurfaceHandle> },
    Encoder,
}

/// Request to capture the next rendered frame to disk for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub file: std::path::PathBuf,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("video/avc"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime("audio/mp4a-latm"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_mime("text/vtt"), None);
    }

    #[test]
    fn test_sample_flags() {
        let mut flags = SampleFlags::KEY_FRAME | SampleFlags::END_OF_STREAM;
        assert!(flags.is_end_of_stream());
        assert!(!flags.is_codec_config());
        flags.remove(SampleFlags::END_OF_STREAM);
        assert!(!flags.is_end_of_stream());
        assert!(flags.contains(SampleFlags::KEY_FRAME));
        flags.insert(SampleFlags::CODEC_CONFIG);
        assert_eq!(flags.bits(), 3);
    }

    #[test]
    fn test_require_reports_missing_key() {
        let format = MediaFormat::audio("audio/raw", 44_100, 0);
        let err = format.require_channel_count().unwrap_err();
        assert!(matches!(
            err,
            ShrinkError::MissingFormatKey {
                key: "channel-count",
                ..
            }
        ));
        assert_eq!(format.require_sample_rate().unwrap(), 44_100);
    }

    #[test]
    fn test_require_rejects_zero_sample_rate() {
        let format = MediaFormat::audio("audio/raw", 0, 2);
        assert!(matches!(
            format.require_sample_rate(),
            Err(ShrinkError::MissingFormatKey {
                key: "sample-rate",
                ..
            })
        ));
        assert_eq!(format.require_channel_count().unwrap(), 2);
    }
}
