//! The decode → transform → encode → mux pump shared by audio and video.
//!
//! One call drives a single track from a fresh decoder/encoder pair until the
//! encoder reports end of stream (shrink) or its output format (probe). The
//! loop never blocks beyond the bounded dequeue timeout, so a stage with no
//! data simply yields to the next one and is revisited on the next pass.

use std::time::Instant;

use tracing::{debug, error, trace, warn};

use super::types::{ProgressListener, PumpConfig, PumpHooks};
use super::watchdog::stop_with_timeout;
use crate::error::{CodecRole, Result, ShrinkError};
use crate::media::{
    BufferInfo, Codec, CodecResolver, CodecSetup, Extractor, MediaBackend, MediaFormat, MediaKind,
    Muxer, OutputEvent, SampleFlags,
};

/// Where encoder output goes.
pub(crate) enum Sink<'a> {
    /// Stop as soon as the encoder reports its output format.
    Probe,
    /// Write every encoded sample into `track` of `muxer`.
    Mux { muxer: &'a mut dyn Muxer, track: usize },
}

/// How a pump run ended.
#[derive(Debug)]
pub(crate) enum PumpOutcome {
    FormatProbed(MediaFormat),
    Finished(PumpStats),
}

/// Counters of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub samples_extracted: u64,
    pub samples_submitted: u64,
    pub samples_muxed: u64,
}

/// A decoder output buffer waiting to be handed to the encoder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StagedOutput {
    pub index: usize,
    pub info: BufferInfo,
}

/// Live state of one pump invocation. Never outlives the call.
pub(crate) struct PumpState {
    pub extractor_done: bool,
    pub decoder_done: bool,
    pub last_extractor_pts: Option<i64>,
    pub last_decoder_pts: Option<i64>,
    pub last_muxed_pts: Option<i64>,
    pub staged: Option<StagedOutput>,
    pub stats: PumpStats,
    encoder_format_changes: u32,
    last_progress: Instant,
}

impl PumpState {
    fn new() -> Self {
        Self {
            extractor_done: false,
            decoder_done: false,
            last_extractor_pts: None,
            last_decoder_pts: None,
            last_muxed_pts: None,
            staged: None,
            stats: PumpStats::default(),
            encoder_format_changes: 0,
            last_progress: Instant::now(),
        }
    }
}

/// The encoder cannot be configured until the decoder's real output format
/// is known.
enum EncoderSlot {
    Pending,
    Encoding(Box<dyn Codec>),
}

/// Read-only environment of a pump run.
pub(crate) struct PumpEnv<'a> {
    pub backend: &'a dyn MediaBackend,
    pub config: &'a PumpConfig,
    pub hooks: &'a PumpHooks,
    pub progress: Option<&'a ProgressListener>,
}

/// Kind-specific parts of the pump.
pub(crate) trait TrackStrategy {
    const KIND: MediaKind;

    fn create_decoder(
        &mut self,
        env: &PumpEnv<'_>,
        source_format: &MediaFormat,
    ) -> Result<Box<dyn Codec>>;

    /// Builds and starts the encoder once the decoder output format is known.
    fn create_encoder(
        &mut self,
        env: &PumpEnv<'_>,
        source_format: &MediaFormat,
        decoder_output_format: &MediaFormat,
    ) -> Result<Box<dyn Codec>>;

    /// Moves the staged decoder output into the encoder.
    fn feed_encoder(
        &mut self,
        env: &PumpEnv<'_>,
        state: &mut PumpState,
        decoder: &mut dyn Codec,
        encoder: &mut dyn Codec,
    ) -> Result<()>;

    /// Releases kind-specific resources such as surfaces.
    fn release(&mut self);
}

/// Looks up and instantiates a codec, classifying failures as recoverable.
pub(crate) fn create_codec(
    codecs: &dyn CodecResolver,
    kind: MediaKind,
    role: CodecRole,
    format: &MediaFormat,
    setup: CodecSetup,
) -> Result<Box<dyn Codec>> {
    let found = match role {
        CodecRole::Decoder => codecs.find_decoder(&format.mime),
        CodecRole::Encoder => codecs.find_encoder(&format.mime),
    };
    let codec_ref = found.ok_or_else(|| {
        error!("{} {} codec is not found. mime-type: {}", kind, role, format.mime);
        ShrinkError::CodecNotFound {
            kind,
            role,
            mime: format.mime.clone(),
        }
    })?;

    let codec = codecs.create(&codec_ref, format, setup).map_err(|e| {
        error!("{} {} cannot be created. codec-name: {}: {}", kind, role, codec_ref.name, e);
        ShrinkError::CodecCreation {
            kind,
            role,
            codec: codec_ref.name.clone(),
            reason: e.to_string(),
        }
    })?;
    debug!("{} {}: {}", kind, role, codec.name());
    Ok(codec)
}

/// Runs the pump for `track` and guarantees teardown.
///
/// Recoverable errors propagate. Anything else is reported once through the
/// error callback and surfaces as [`ShrinkError::Aborted`].
pub(crate) fn run<S: TrackStrategy>(
    strategy: &mut S,
    env: &PumpEnv<'_>,
    extractor: &mut dyn Extractor,
    track: usize,
    mut sink: Sink<'_>,
) -> Result<PumpOutcome> {
    let mut decoder: Option<Box<dyn Codec>> = None;
    let mut encoder = EncoderSlot::Pending;
    let mut selected = false;

    let result = pump(
        strategy,
        env,
        extractor,
        track,
        &mut sink,
        &mut decoder,
        &mut encoder,
        &mut selected,
    );

    let teardown = teardown(strategy, env, extractor, track, decoder, encoder, selected);
    let result = result.and_then(|outcome| teardown.map(|_| outcome));

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_recoverable() => {
            error!("Recoverable error occurred on {} reencode: {}", S::KIND, e);
            Err(e)
        }
        Err(ShrinkError::Aborted) => Err(ShrinkError::Aborted),
        Err(e) => {
            error!("Unrecoverable error occurred on {} reencode: {}", S::KIND, e);
            env.hooks.error_callback.on_unrecoverable_error(&e);
            Err(ShrinkError::Aborted)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn pump<S: TrackStrategy>(
    strategy: &mut S,
    env: &PumpEnv<'_>,
    extractor: &mut dyn Extractor,
    track: usize,
    sink: &mut Sink<'_>,
    decoder_slot: &mut Option<Box<dyn Codec>>,
    encoder: &mut EncoderSlot,
    selected: &mut bool,
) -> Result<PumpOutcome> {
    let source_format = extractor.track_format(track)?;
    let duration_us = source_format.duration_us.filter(|d| *d > 0);
    debug!(
        "{} reencode. track: {}, probe: {}, format: {:?}",
        S::KIND,
        track,
        matches!(sink, Sink::Probe),
        source_format
    );

    let decoder = decoder_slot.insert(strategy.create_decoder(env, &source_format)?);
    decoder.start()?;
    extractor.select_track(track)?;
    *selected = true;

    let mut state = PumpState::new();
    loop {
        feed_decoder::<S>(env, &mut state, extractor, decoder.as_mut())?;
        drain_decoder::<S>(env, &mut state, decoder.as_mut())?;

        if state.staged.is_some() {
            if let EncoderSlot::Pending = encoder {
                let output_format = decoder.output_format()?;
                debug!("{} decoder output format: {:?}", S::KIND, output_format);
                *encoder = EncoderSlot::Encoding(strategy.create_encoder(
                    env,
                    &source_format,
                    &output_format,
                )?);
            }
            if let EncoderSlot::Encoding(enc) = encoder {
                strategy.feed_encoder(env, &mut state, decoder.as_mut(), enc.as_mut())?;
            }
        }

        if let EncoderSlot::Encoding(enc) = encoder {
            if let Some(outcome) =
                drain_encoder::<S>(env, &mut state, enc.as_mut(), sink, duration_us)?
            {
                return Ok(outcome);
            }
        }
    }
}

/// Stage 1: extractor → decoder input.
fn feed_decoder<S: TrackStrategy>(
    env: &PumpEnv<'_>,
    state: &mut PumpState,
    extractor: &mut dyn Extractor,
    decoder: &mut dyn Codec,
) -> Result<()> {
    while !state.extractor_done {
        let Some(index) = decoder.dequeue_input_buffer(env.config.dequeue_timeout)? else {
            break;
        };
        let size = {
            let buf = decoder.input_buffer(index)?;
            extractor.read_sample(buf)?
        };
        // Read before advance, which moves to the next sample.
        let pts = extractor.sample_time_us();
        let mut flags = extractor.sample_flags();
        trace!(
            "{} extractor output. size: {:?}, time: {}, flags: {:?}",
            S::KIND,
            size,
            pts,
            flags
        );

        if size.is_some() {
            state.stats.samples_extracted += 1;
        }
        state.extractor_done = size.is_none() || !extractor.advance();

        if state.extractor_done {
            debug!(
                "{} extractor: EOS, samples: {}",
                S::KIND,
                state.stats.samples_extracted
            );
            flags.insert(SampleFlags::END_OF_STREAM);
            if state.stats.samples_extracted == 0 {
                error!("no {} sample found", S::KIND);
                return Err(ShrinkError::NoSamples { kind: S::KIND });
            }
        }

        match size {
            Some(size) => {
                match state.last_extractor_pts {
                    Some(last) if last >= pts => warn!(
                        "{} extractor output pts ({}) is not after last pts ({})",
                        S::KIND,
                        pts,
                        last
                    ),
                    _ => state.last_extractor_pts = Some(pts),
                }
                decoder.queue_input_buffer(index, 0, size, pts, flags)?;
            }
            None => decoder.queue_input_buffer(index, 0, 0, 0, flags)?,
        }
    }
    Ok(())
}

/// Stage 2: decoder output → staging.
fn drain_decoder<S: TrackStrategy>(
    env: &PumpEnv<'_>,
    state: &mut PumpState,
    decoder: &mut dyn Codec,
) -> Result<()> {
    while !state.decoder_done && state.staged.is_none() {
        match decoder.dequeue_output_buffer(env.config.dequeue_timeout)? {
            OutputEvent::TryAgainLater => break,
            OutputEvent::FormatChanged => {
                debug!(
                    "{} decoder: output format changed. {:?}",
                    S::KIND,
                    decoder.output_format()?
                );
            }
            OutputEvent::Buffer { index, mut info } => {
                trace!("{} decoder output. index: {}, info: {:?}", S::KIND, index, info);
                // Config buffers can also carry the end-of-stream flag.
                if info.flags.is_codec_config() {
                    if !info.flags.is_end_of_stream() {
                        decoder.release_output_buffer(index, false)?;
                        continue;
                    }
                    info.size = 0;
                    info.flags.remove(SampleFlags::CODEC_CONFIG);
                }
                match state.last_decoder_pts {
                    Some(last) if last >= info.presentation_time_us && info.size > 0 => warn!(
                        "{} decoder output pts ({}) is not after last pts ({})",
                        S::KIND,
                        info.presentation_time_us,
                        last
                    ),
                    _ => state.last_decoder_pts = Some(info.presentation_time_us),
                }
                state.staged = Some(StagedOutput { index, info });
            }
        }
    }
    Ok(())
}

/// Stage 4: encoder output → muxer.
fn drain_encoder<S: TrackStrategy>(
    env: &PumpEnv<'_>,
    state: &mut PumpState,
    encoder: &mut dyn Codec,
    sink: &mut Sink<'_>,
    duration_us: Option<i64>,
) -> Result<Option<PumpOutcome>> {
    loop {
        match encoder.dequeue_output_buffer(env.config.dequeue_timeout)? {
            OutputEvent::TryAgainLater => return Ok(None),
            OutputEvent::FormatChanged => {
                state.encoder_format_changes += 1;
                let format = encoder.output_format()?;
                if let Sink::Probe = sink {
                    debug!("{} encoder: output format probed. {:?}", S::KIND, format);
                    return Ok(Some(PumpOutcome::FormatProbed(format)));
                }
                if state.encoder_format_changes > 1 {
                    warn!("{} encoder: output format changed again, ignored", S::KIND);
                } else {
                    debug!("{} encoder: output format {:?}", S::KIND, format);
                }
            }
            OutputEvent::Buffer { index, info } => {
                trace!("{} encoder output. index: {}, info: {:?}", S::KIND, index, info);
                if !info.flags.is_codec_config() && info.size > 0 {
                    if let Sink::Mux { muxer, track } = sink {
                        write_sample::<S>(
                            env,
                            state,
                            encoder,
                            &mut **muxer,
                            *track,
                            index,
                            info,
                            duration_us,
                        )?;
                    }
                }
                encoder.release_output_buffer(index, false)?;
                if info.flags.is_end_of_stream() {
                    debug!(
                        "{} encoder: EOS, muxed samples: {}",
                        S::KIND,
                        state.stats.samples_muxed
                    );
                    return match sink {
                        Sink::Probe => Err(ShrinkError::codec(format!(
                            "{} encoder reached end of stream without reporting its format",
                            S::KIND
                        ))),
                        Sink::Mux { .. } => Ok(Some(PumpOutcome::Finished(state.stats))),
                    };
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_sample<S: TrackStrategy>(
    env: &PumpEnv<'_>,
    state: &mut PumpState,
    encoder: &dyn Codec,
    muxer: &mut dyn Muxer,
    track: usize,
    index: usize,
    info: BufferInfo,
    duration_us: Option<i64>,
) -> Result<()> {
    let pts = info.presentation_time_us;
    if let Some(last) = state.last_muxed_pts {
        if last >= pts {
            warn!(
                "{} encoder output pts ({}) is not after last muxed pts ({}), dropped",
                S::KIND,
                pts,
                last
            );
            return Ok(());
        }
    }

    let data = encoder.output_buffer(index)?;
    let sample = data
        .get(info.offset..info.offset + info.size)
        .ok_or_else(|| ShrinkError::codec("encoder output buffer is smaller than reported"))?;
    muxer.write_sample(track, sample, &BufferInfo { offset: 0, ..info })?;
    state.last_muxed_pts = Some(pts);
    state.stats.samples_muxed += 1;

    if let (Some(listener), Some(duration_us)) = (env.progress, duration_us) {
        if state.last_progress.elapsed() >= env.config.progress_interval {
            state.last_progress = Instant::now();
            let percent = (pts.max(0) as i128 * 100 / duration_us as i128).clamp(0, 100) as u32;
            listener(percent);
        }
    }
    Ok(())
}

/// Stops and releases both codecs and unselects the track, whatever happened.
fn teardown<S: TrackStrategy>(
    strategy: &mut S,
    env: &PumpEnv<'_>,
    extractor: &mut dyn Extractor,
    track: usize,
    decoder: Option<Box<dyn Codec>>,
    encoder: EncoderSlot,
    selected: bool,
) -> Result<()> {
    let mut first_error = None;
    let mut keep = |result: Result<()>| {
        if let Err(e) = result {
            error!("Failed to tear down {} reencode: {}", S::KIND, e);
            first_error.get_or_insert(e);
        }
    };

    if let EncoderSlot::Encoding(mut encoder) = encoder {
        keep(stop_with_timeout(
            encoder.as_mut(),
            env.config.stop_timeout,
            &env.hooks.terminator,
        ));
        encoder.release();
    }
    if let Some(mut decoder) = decoder {
        keep(stop_with_timeout(
            decoder.as_mut(),
            env.config.stop_timeout,
            &env.hooks.terminator,
        ));
        decoder.release();
    }
    strategy.release();
    if selected {
        keep(extractor.unselect_track(track));
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
