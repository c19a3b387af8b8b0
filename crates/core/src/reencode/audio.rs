//! Audio track reencoder.
//!
//! Decoded PCM is copied byte for byte into AAC encoder input buffers. When
//! an encoder slot is smaller than the decoded chunk, the chunk is submitted
//! in several parts, each with a synthesized presentation time.

use std::sync::Arc;

use tracing::{debug, trace};

use super::pump::{self, PumpEnv, PumpOutcome, PumpState, Sink, TrackStrategy};
use super::types::{
    ProgressListener, PumpConfig, PumpHooks, ReencodeTarget, AUDIO_ENCODE_MIME,
};
use super::TrackReencoder;
use crate::error::{CodecRole, Result, ShrinkError};
use crate::media::{
    AacProfile, Codec, CodecSetup, Extractor, MediaBackend, MediaFormat, MediaKind, Muxer,
    SampleFlags,
};

/// Bytes per PCM sample of decoder output.
const PCM_SAMPLE_BYTES: u64 = 2;

/// Reencodes one audio track to AAC.
pub struct AudioReencoder {
    backend: Arc<dyn MediaBackend>,
    target: ReencodeTarget,
    config: PumpConfig,
    hooks: PumpHooks,
    progress: Option<ProgressListener>,
}

impl AudioReencoder {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        target: ReencodeTarget,
        config: PumpConfig,
        hooks: PumpHooks,
    ) -> Self {
        Self {
            backend,
            target,
            config,
            hooks,
            progress: None,
        }
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
        let mut strategy = AudioStrategy {
            bit_rate: self.target.bit_rate,
        };
        pump::run(&mut strategy, &env, extractor, track, sink)
    }
}

impl TrackReencoder for AudioReencoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
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

struct AudioStrategy {
    bit_rate: u32,
}

/// Encoder configuration derived from what the decoder actually produces.
/// Device decoders may change sample rate or channel count.
fn encoder_configuration_format(decoder_output: &MediaFormat, bit_rate: u32) -> Result<MediaFormat> {
    let mut format = MediaFormat::audio(
        AUDIO_ENCODE_MIME,
        decoder_output.require_sample_rate()?,
        decoder_output.require_channel_count()?,
    )
    .with_bit_rate(bit_rate);
    format.aac_profile = Some(AacProfile::Lc);
    Ok(format)
}

/// Duration in µs of `bytes` of 16-bit PCM.
fn pcm_duration_us(bytes: usize, channel_count: u32, sample_rate: u32) -> i64 {
    let frames = bytes as u64 / PCM_SAMPLE_BYTES / channel_count as u64;
    (frames * 1_000_000 / sample_rate as u64) as i64
}

impl TrackStrategy for AudioStrategy {
    const KIND: MediaKind = MediaKind::Audio;

    fn create_decoder(
        &mut self,
        env: &PumpEnv<'_>,
        source_format: &MediaFormat,
    ) -> Result<Box<dyn Codec>> {
        pump::create_codec(
            env.backend.codecs(),
            Self::KIND,
            CodecRole::Decoder,
            source_format,
            CodecSetup::Decoder { surface: None },
        )
    }

    fn create_encoder(
        &mut self,
        env: &PumpEnv<'_>,
        _source_format: &MediaFormat,
        decoder_output_format: &MediaFormat,
    ) -> Result<Box<dyn Codec>> {
        let format = encoder_configuration_format(decoder_output_format, self.bit_rate)?;
        debug!("audio encoder configuration format: {:?}", format);
        let mut encoder = pump::create_codec(
            env.backend.codecs(),
            Self::KIND,
            CodecRole::Encoder,
            &format,
            CodecSetup::Encoder,
        )?;
        encoder.start()?;
        Ok(encoder)
    }

    fn feed_encoder(
        &mut self,
        env: &PumpEnv<'_>,
        state: &mut PumpState,
        decoder: &mut dyn Codec,
        encoder: &mut dyn Codec,
    ) -> Result<()> {
        while let Some(mut staged) = state.staged.take() {
            let Some(index) = encoder.dequeue_input_buffer(env.config.dequeue_timeout)? else {
                state.staged = Some(staged);
                break;
            };

            let info = staged.info;
            let capacity = {
                let src = decoder.output_buffer(staged.index)?;
                let dst = encoder.input_buffer(index)?;
                let consumed = info.size.min(dst.len());
                let chunk = src
                    .get(info.offset..info.offset + consumed)
                    .ok_or_else(|| ShrinkError::codec("decoder output buffer is smaller than reported"))?;
                dst[..consumed].copy_from_slice(chunk);
                dst.len()
            };

            if capacity >= info.size {
                trace!("audio encoder input. index: {}, info: {:?}", index, info);
                encoder.queue_input_buffer(
                    index,
                    0,
                    info.size,
                    info.presentation_time_us,
                    info.flags,
                )?;
                decoder.release_output_buffer(staged.index, false)?;
                if info.size != 0 {
                    state.stats.samples_submitted += 1;
                }
                if info.flags.is_end_of_stream() {
                    debug!("audio decoder: EOS");
                    state.decoder_done = true;
                }
                continue;
            }

            if capacity == 0 {
                return Err(ShrinkError::codec("audio encoder input buffer has no capacity"));
            }

            // End of stream goes out with the last part only.
            let flags = info.flags.without(SampleFlags::END_OF_STREAM);
            trace!(
                "multi-phase audio encoder input. index: {}, time: {}, size: {}",
                index,
                info.presentation_time_us,
                capacity
            );
            encoder.queue_input_buffer(index, 0, capacity, info.presentation_time_us, flags)?;
            state.stats.samples_submitted += 1;

            let output_format = decoder.output_format()?;
            let advance = pcm_duration_us(
                capacity,
                output_format.require_channel_count()?,
                output_format.require_sample_rate()?,
            );
            staged.info.offset += capacity;
            staged.info.size -= capacity;
            staged.info.presentation_time_us += advance;
            state.staged = Some(staged);
        }
        Ok(())
    }

    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferInfo;
    use crate::testing::{
        aac_output_format, audio_source_format, pcm_format, MockBackend, MockCodec, MockCodecBuilder,
        MockExtractor, MockMuxer, RecordingErrorCallback, RecordingTerminator,
    };
    use std::sync::Mutex;

    fn hooks() -> (PumpHooks, Arc<RecordingErrorCallback>) {
        let callback = Arc::new(RecordingErrorCallback::default());
        let hooks = PumpHooks::new(callback.clone(), Arc::new(RecordingTerminator::default()));
        (hooks, callback)
    }

    fn fast_config() -> PumpConfig {
        PumpConfig {
            progress_interval: std::time::Duration::ZERO,
            ..PumpConfig::default()
        }
    }

    fn extractor_with_samples(count: usize) -> MockExtractor {
        let mut extractor = MockExtractor::new();
        let track = extractor.add_track(audio_source_format(44_100, 2, 1_000_000));
        for i in 0..count {
            extractor.push_sample(track, vec![i as u8; 256], i as i64 * 23_220, SampleFlags::NONE);
        }
        extractor
    }

    fn backend(decoder: MockCodecBuilder, encoder: MockCodecBuilder) -> Arc<MockBackend> {
        let backend = MockBackend::new();
        backend.set_decoder("audio/mp4a-latm", decoder);
        backend.set_encoder("audio/mp4a-latm", encoder);
        Arc::new(backend)
    }

    #[test]
    fn test_pcm_duration() {
        // 4096 bytes of stereo 16-bit at 44.1 kHz is 1024 frames.
        assert_eq!(pcm_duration_us(4096, 2, 44_100), 23_219);
        assert_eq!(pcm_duration_us(0, 1, 48_000), 0);
    }

    #[test]
    fn test_encoder_format_follows_decoder_output() {
        let format = encoder_configuration_format(&pcm_format(48_000, 1), 64_000).unwrap();
        assert_eq!(format.mime, AUDIO_ENCODE_MIME);
        assert_eq!(format.sample_rate, Some(48_000));
        assert_eq!(format.channel_count, Some(1));
        assert_eq!(format.bit_rate, Some(64_000));
        assert_eq!(format.aac_profile, Some(AacProfile::Lc));
    }

    #[test]
    fn test_probe_returns_encoder_output_format() {
        let decoder = MockCodec::builder("c2.audio.decoder")
            .output_format(pcm_format(44_100, 2));
        let encoder = MockCodec::builder("c2.aac.encoder")
            .output_format(aac_output_format(44_100, 2));
        let backend = backend(decoder, encoder);
        let (hooks, callback) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend.clone(), ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let mut extractor = extractor_with_samples(4);

        let format = reencoder.probe_output_format(&mut extractor, 0).unwrap();

        assert_eq!(format, aac_output_format(44_100, 2));
        assert!(callback.errors().is_empty());
        assert!(extractor.selected_tracks().is_empty());
        assert!(backend.all_codecs_released());
    }

    #[test]
    fn test_shrink_muxes_every_encoded_sample() {
        let decoder = MockCodec::builder("c2.audio.decoder")
            .output_format(pcm_format(44_100, 2));
        let encoder = MockCodec::builder("c2.aac.encoder")
            .output_format(aac_output_format(44_100, 2))
            .codec_config_output(true);
        let backend = backend(decoder, encoder);
        let (hooks, callback) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend.clone(), ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        reencoder.set_progress_listener(Some(Arc::new(move |p| sink.lock().unwrap().push(p))));

        let mut extractor = extractor_with_samples(5);
        let mut muxer = MockMuxer::new();
        let track = muxer.add_track(&aac_output_format(44_100, 2)).unwrap();
        muxer.start().unwrap();

        reencoder.shrink(&mut extractor, 0, &mut muxer, track).unwrap();

        assert!(callback.errors().is_empty());
        let encoder_outputs = backend.encoder_state("audio/mp4a-latm").unwrap().data_outputs;
        assert_eq!(muxer.samples(track).len() as u64, encoder_outputs);
        assert_eq!(muxer.samples(track).len(), 5);
        let progress = progress.lock().unwrap();
        assert!(!progress.is_empty());
        assert!(progress.iter().all(|p| *p <= 100));
        assert!(backend.all_codecs_released());
    }

    #[test]
    fn test_encoder_output_not_after_last_muxed_is_dropped() {
        let decoder = MockCodec::builder("c2.audio.decoder")
            .output_format(pcm_format(44_100, 2));
        let encoder = MockCodec::builder("c2.aac.encoder")
            .output_format(aac_output_format(44_100, 2));
        let backend = backend(decoder, encoder);
        let (hooks, callback) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend.clone(), ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let mut extractor = MockExtractor::new();
        let track = extractor.add_track(audio_source_format(44_100, 2, 1_000_000));
        for pts in [0, 20_000, 10_000, 20_000, 30_000] {
            extractor.push_sample(track, vec![1; 256], pts, SampleFlags::NONE);
        }
        let mut muxer = MockMuxer::new();
        let out = muxer.add_track(&aac_output_format(44_100, 2)).unwrap();
        muxer.start().unwrap();

        reencoder.shrink(&mut extractor, track, &mut muxer, out).unwrap();

        let muxed: Vec<i64> = muxer
            .samples(out)
            .iter()
            .map(|s| s.info.presentation_time_us)
            .collect();
        assert_eq!(muxed, vec![0, 20_000, 30_000]);
        assert!(callback.errors().is_empty());
        assert!(backend.all_codecs_released());
    }

    #[test]
    fn test_large_chunk_is_split_across_encoder_inputs() {
        let decoder = MockCodec::builder("c2.audio.decoder")
            .output_format(pcm_format(44_100, 2));
        let encoder = MockCodec::builder("c2.aac.encoder")
            .output_format(aac_output_format(44_100, 2))
            .input_capacity(100);
        let backend = backend(decoder, encoder);
        let (hooks, _) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend.clone(), ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let mut extractor = MockExtractor::new();
        let track = extractor.add_track(audio_source_format(44_100, 2, 1_000_000));
        extractor.push_sample(track, vec![7; 256], 0, SampleFlags::NONE);
        let mut muxer = MockMuxer::new();
        let out = muxer.add_track(&aac_output_format(44_100, 2)).unwrap();
        muxer.start().unwrap();

        reencoder.shrink(&mut extractor, track, &mut muxer, out).unwrap();

        let inputs: Vec<BufferInfo> = backend
            .encoder_state("audio/mp4a-latm")
            .unwrap()
            .queued_inputs
            .into_iter()
            .filter(|info| info.size > 0)
            .collect();
        // ceil(256 / 100)
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs.iter().map(|i| i.size).sum::<usize>(), 256);
        assert!(inputs
            .windows(2)
            .all(|w| w[0].presentation_time_us <= w[1].presentation_time_us));
        assert_eq!(inputs[1].presentation_time_us, pcm_duration_us(100, 2, 44_100));
        assert!(inputs[..2].iter().all(|i| !i.flags.is_end_of_stream()));
        assert!(inputs[2].flags.is_end_of_stream());
    }

    #[test]
    fn test_empty_track_is_recoverable() {
        let backend = backend(
            MockCodec::builder("c2.audio.decoder"),
            MockCodec::builder("c2.aac.encoder"),
        );
        let (hooks, callback) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend.clone(), ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let mut extractor = extractor_with_samples(0);

        let err = reencoder.probe_output_format(&mut extractor, 0).unwrap_err();

        assert!(matches!(err, ShrinkError::NoSamples { kind: MediaKind::Audio }));
        assert!(callback.errors().is_empty());
        assert!(extractor.selected_tracks().is_empty());
        assert!(backend.all_codecs_released());
    }

    #[test]
    fn test_missing_decoder_is_recoverable() {
        let backend = Arc::new(MockBackend::new());
        let (hooks, callback) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend, ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let mut extractor = extractor_with_samples(3);

        let err = reencoder.probe_output_format(&mut extractor, 0).unwrap_err();

        assert!(matches!(
            err,
            ShrinkError::CodecNotFound {
                role: CodecRole::Decoder,
                ..
            }
        ));
        assert!(callback.errors().is_empty());
    }

    #[test]
    fn test_codec_failure_is_reported_once_and_aborts() {
        let decoder = MockCodec::builder("c2.audio.decoder")
            .output_format(pcm_format(44_100, 2))
            .fail_output_after(2);
        let encoder = MockCodec::builder("c2.aac.encoder")
            .output_format(aac_output_format(44_100, 2));
        let backend = backend(decoder, encoder);
        let (hooks, callback) = hooks();
        let mut reencoder =
            AudioReencoder::new(backend.clone(), ReencodeTarget::audio(128_000).unwrap(), fast_config(), hooks);
        let mut extractor = extractor_with_samples(6);
        let mut muxer = MockMuxer::new();
        let out = muxer.add_track(&aac_output_format(44_100, 2)).unwrap();
        muxer.start().unwrap();

        let err = reencoder.shrink(&mut extractor, 0, &mut muxer, out).unwrap_err();

        assert!(matches!(err, ShrinkError::Aborted));
        assert_eq!(callback.errors().len(), 1);
        assert!(extractor.selected_tracks().is_empty());
        assert!(backend.all_codecs_released());
    }
}
