//! Testing utilities and mock implementations.
//!
//! This module provides a scriptable in-memory media platform, so the pump,
//! orchestrator, worker and queue can be exercised without real codecs, and
//! a scripted worker binding for queue tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediashrink_core::testing::{fixtures, MockBackend, MockCodec, MockExtractor, MockMetadata};
//!
//! let mut extractor = MockExtractor::new();
//! let track = extractor.add_track(fixtures::audio_source_format(44_100, 2, 1_000_000));
//! extractor.push_sample(track, vec![0; 256], 0, SampleFlags::NONE);
//!
//! let backend = MockBackend::new();
//! backend.set_decoder("audio/mp4a-latm", MockCodec::builder("c2.aac.decoder"));
//! backend.add_source("content://clip", extractor, MockMetadata::new(Some(1_000), 0));
//! ```

mod mock_backend;
mod mock_binder;
mod mock_codec;
mod mock_media;
mod mock_renderer;
mod recording;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use mock_backend::MockBackend;
pub use mock_binder::MockBinder;
pub use mock_codec::{MockCodec, MockCodecBuilder, MockCodecState, MockInputSurface};
pub use mock_media::{MockExtractor, MockMetadata, MockMuxer, MuxedSample, MuxerState};
pub use mock_renderer::{MockFrameRenderer, RendererState};
pub use recording::{RecordingErrorCallback, RecordingTerminator};

pub use fixtures::{
    aac_output_format, audio_source_format, avc_output_format, pcm_format, video_source_format,
};

/// Mocks stay usable after a panicking test thread poisoned a lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::sync::Arc;

    use super::{MockBackend, MockCodec, MockExtractor, MockMetadata};
    use crate::media::{MediaFormat, SampleFlags};
    use crate::reencode::{AUDIO_ENCODE_MIME, VIDEO_ENCODE_MIME};

    /// AAC source track.
    pub fn audio_source_format(sample_rate: u32, channels: u32, duration_us: i64) -> MediaFormat {
        MediaFormat::audio(AUDIO_ENCODE_MIME, sample_rate, channels).with_duration_us(duration_us)
    }

    /// Decoded PCM as reported by an audio decoder.
    pub fn pcm_format(sample_rate: u32, channels: u32) -> MediaFormat {
        MediaFormat::audio("audio/raw", sample_rate, channels)
    }

    /// Format an AAC encoder reports once configured.
    pub fn aac_output_format(sample_rate: u32, channels: u32) -> MediaFormat {
        MediaFormat::audio(AUDIO_ENCODE_MIME, sample_rate, channels).with_bit_rate(128_000)
    }

    /// H.264 source track.
    pub fn video_source_format(width: u32, height: u32, duration_us: i64) -> MediaFormat {
        MediaFormat::video(VIDEO_ENCODE_MIME, width, height).with_duration_us(duration_us)
    }

    /// Format an H.264 encoder reports once configured.
    pub fn avc_output_format(width: u32, height: u32) -> MediaFormat {
        MediaFormat::video(VIDEO_ENCODE_MIME, width, height)
    }

    /// Backend with working AAC and H.264 codecs.
    pub fn working_backend() -> MockBackend {
        let backend = MockBackend::new();
        backend.set_decoder(
            AUDIO_ENCODE_MIME,
            MockCodec::builder("c2.aac.decoder").output_format(pcm_format(44_100, 2)),
        );
        backend.set_encoder(
            AUDIO_ENCODE_MIME,
            MockCodec::builder("c2.aac.encoder")
                .output_format(aac_output_format(44_100, 2))
                .codec_config_output(true),
        );
        backend.set_decoder(VIDEO_ENCODE_MIME, MockCodec::builder("c2.avc.decoder"));
        backend.set_encoder(
            VIDEO_ENCODE_MIME,
            MockCodec::builder("c2.avc.encoder")
                .output_format(avc_output_format(640, 368))
                .codec_config_output(true),
        );
        backend
    }

    /// Source with one video track of `frames` frames at 30 fps and one audio
    /// track of the same duration.
    pub fn clip(frames: usize) -> MockExtractor {
        let duration_us = frames as i64 * 33_333;
        let mut extractor = MockExtractor::new();
        let video = extractor.add_track(video_source_format(1280, 720, duration_us));
        for i in 0..frames {
            let flags = if i == 0 {
                SampleFlags::KEY_FRAME
            } else {
                SampleFlags::NONE
            };
            extractor.push_sample(video, vec![0x65; 512], i as i64 * 33_333, flags);
        }
        let audio = extractor.add_track(audio_source_format(44_100, 2, duration_us));
        for i in 0..frames {
            extractor.push_sample(audio, vec![0x21; 256], i as i64 * 33_333, SampleFlags::NONE);
        }
        extractor
    }

    /// [`working_backend`] with `source` registered as a [`clip`].
    pub fn backend_with_clip(source: &str, frames: usize, duration_ms: u64) -> Arc<MockBackend> {
        let backend = working_backend();
        backend.add_source(source, clip(frames), MockMetadata::new(Some(duration_ms), 0));
        Arc::new(backend)
    }
}
