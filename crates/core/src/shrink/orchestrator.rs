//! The shrink orchestrator.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::progress::ProgressTracker;
use super::types::{
    select_tracks, ShrinkParams, TrackSelection, PROGRESS_ADD_TRACK, PROGRESS_WRITE_CONTENT,
};
use crate::error::{Result, ShrinkError};
use crate::media::{Extractor, MediaBackend, MediaKind, MetadataReader, Muxer};
use crate::reencode::{
    AudioReencoder, ProcessTerminator, ProgressListener, PumpConfig, PumpHooks, ReencodeTarget,
    Terminator, TrackReencoder, UnrecoverableErrorCallback, VideoReencoder,
};

/// Shrinks whole sources: one video and one audio track into a new
/// container.
///
/// `shrink` blocks and must run on a thread allowed to drive the backend's
/// frame renderer (see [`VideoReencoder`]).
pub struct MediaShrink {
    backend: Arc<dyn MediaBackend>,
    params: ShrinkParams,
    video_target: ReencodeTarget,
    audio_target: ReencodeTarget,
    pump_config: PumpConfig,
    terminator: Arc<dyn Terminator>,
    progress: Option<ProgressListener>,
}

impl MediaShrink {
    pub fn new(backend: Arc<dyn MediaBackend>, params: ShrinkParams) -> Result<Self> {
        Ok(Self {
            backend,
            video_target: params.video_target()?,
            audio_target: params.audio_target()?,
            params,
            pump_config: PumpConfig::default(),
            terminator: Arc::new(ProcessTerminator),
            progress: None,
        })
    }

    pub fn with_pump_config(mut self, config: PumpConfig) -> Self {
        self.pump_config = config;
        self
    }

    /// Replaces what ends the process when a codec hangs on stop.
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Receives overall progress, 0 to 100, never decreasing.
    pub fn set_progress_listener(&mut self, listener: Option<ProgressListener>) {
        self.progress = listener;
    }

    pub fn params(&self) -> &ShrinkParams {
        &self.params
    }

    /// Shrinks `source` into `output`.
    ///
    /// Recoverable failures are returned. Failures after the output was
    /// opened go to `error_callback` and come back as
    /// [`ShrinkError::Aborted`].
    pub fn shrink(
        &self,
        source: &str,
        output: &Path,
        error_callback: Arc<dyn UnrecoverableErrorCallback>,
    ) -> Result<()> {
        info!("Shrinking {} into {}", source, output.display());
        let mut extractor = self.backend.open_extractor(source).map_err(read_failure)?;
        let mut metadata = match self.backend.open_metadata(source) {
            Ok(metadata) => metadata,
            Err(e) => {
                if let Err(release_error) = extractor.release() {
                    error!("Failed to release extractor: {}", release_error);
                }
                return Err(read_failure(e));
            }
        };

        let result = self.shrink_opened(
            extractor.as_mut(),
            metadata.as_mut(),
            output,
            &error_callback,
        );

        let extractor_released = extractor.release();
        let metadata_released = metadata.release();
        if let Err(e) = extractor_released.and(metadata_released) {
            error!("Failed to finalize shrink: {}", e);
            error_callback.on_unrecoverable_error(&e);
            return Err(ShrinkError::Aborted);
        }

        if result.is_ok() {
            info!("Shrink of {} finished", source);
        }
        result
    }

    fn shrink_opened(
        &self,
        extractor: &mut dyn Extractor,
        metadata: &mut dyn MetadataReader,
        output: &Path,
        error_callback: &Arc<dyn UnrecoverableErrorCallback>,
    ) -> Result<()> {
        self.check_duration(metadata)?;
        let selection = select_tracks(extractor)?;
        let mut reencoders = self.create_reencoders(&selection, metadata, error_callback)?;
        let tracker = ProgressTracker::new(selection.max_progress(), self.progress.clone());

        let mut muxer = self.backend.create_muxer(output).map_err(|e| {
            error!("Failed to open output {}: {}", output.display(), e);
            ShrinkError::Io(std::io::Error::other(format!(
                "failed to write output: {}",
                e
            )))
        })?;

        // Once the muxer exists, every failure may leave a corrupt container.
        let mut started = false;
        let result = write_tracks(
            extractor,
            muxer.as_mut(),
            &mut reencoders,
            &tracker,
            &mut started,
        );
        let stopped = if started { muxer.stop() } else { Ok(()) };
        muxer.release();

        let result = result.and(stopped);
        match result {
            Ok(()) => Ok(()),
            Err(ShrinkError::Aborted) => Err(ShrinkError::Aborted),
            Err(e) => {
                error!("Unrecoverable error occurred on media shrink: {}", e);
                error_callback.on_unrecoverable_error(&e);
                Err(ShrinkError::Aborted)
            }
        }
    }

    fn check_duration(&self, metadata: &dyn MetadataReader) -> Result<()> {
        let limit_secs = self.params.duration_limit_secs;
        if limit_secs == 0 {
            return Ok(());
        }
        let duration_ms = metadata
            .duration_ms()?
            .ok_or_else(|| ShrinkError::source_unreadable("source duration is unknown"))?;
        let duration_secs = duration_ms / 1000;
        if duration_secs > limit_secs {
            error!(
                "Movie duration ({} sec) is longer than duration limit ({} sec)",
                duration_secs, limit_secs
            );
            return Err(ShrinkError::TooLong {
                duration_secs,
                limit_secs,
            });
        }
        Ok(())
    }

    fn create_reencoders(
        &self,
        selection: &TrackSelection,
        metadata: &dyn MetadataReader,
        error_callback: &Arc<dyn UnrecoverableErrorCallback>,
    ) -> Result<Vec<(usize, Box<dyn TrackReencoder>)>> {
        let hooks = PumpHooks::new(Arc::clone(error_callback), Arc::clone(&self.terminator));
        let mut reencoders: Vec<(usize, Box<dyn TrackReencoder>)> = Vec::new();
        for (kind, track) in selection.tracks() {
            let reencoder: Box<dyn TrackReencoder> = match kind {
                MediaKind::Video => {
                    let rotation = metadata.video_rotation()?;
                    debug!("video track: {}, rotation: {}", track, rotation);
                    Box::new(VideoReencoder::new(
                        Arc::clone(&self.backend),
                        self.video_target,
                        rotation,
                        self.pump_config.clone(),
                        hooks.clone(),
                    )?)
                }
                MediaKind::Audio => Box::new(AudioReencoder::new(
                    Arc::clone(&self.backend),
                    self.audio_target,
                    self.pump_config.clone(),
                    hooks.clone(),
                )),
            };
            reencoders.push((track, reencoder));
        }
        Ok(reencoders)
    }
}

fn read_failure(e: ShrinkError) -> ShrinkError {
    error!("Failed to read input: {}", e);
    match e {
        ShrinkError::SourceUnreadable { .. } => e,
        other => ShrinkError::source_unreadable(other.to_string()),
    }
}

/// Registers every track, starts the muxer, then writes every track.
fn write_tracks(
    extractor: &mut dyn Extractor,
    muxer: &mut dyn Muxer,
    reencoders: &mut [(usize, Box<dyn TrackReencoder>)],
    tracker: &ProgressTracker,
    started: &mut bool,
) -> Result<()> {
    let mut output_tracks = Vec::with_capacity(reencoders.len());
    for (track, reencoder) in reencoders.iter_mut() {
        let format = reencoder.probe_output_format(extractor, *track)?;
        debug!("{} output format: {:?}", reencoder.kind(), format);
        output_tracks.push(muxer.add_track(&format)?);
        tracker.advance(PROGRESS_ADD_TRACK);
    }

    muxer.start()?;
    *started = true;

    for ((track, reencoder), output_track) in reencoders.iter_mut().zip(output_tracks) {
        reencoder.set_progress_listener(Some(
            tracker.track_listener(tracker.current(), PROGRESS_WRITE_CONTENT),
        ));
        let result = reencoder.shrink(extractor, *track, muxer, output_track);
        reencoder.set_progress_listener(None);
        result?;
        tracker.advance(PROGRESS_WRITE_CONTENT);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SampleFlags;
    use crate::testing::{
        audio_source_format, fixtures, video_source_format, MockBackend, MockExtractor,
        MockMetadata, RecordingErrorCallback, RecordingTerminator,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    const SOURCE: &str = "content://media/clip.mp4";

    fn pump_config() -> PumpConfig {
        PumpConfig {
            progress_interval: Duration::ZERO,
            ..PumpConfig::default()
        }
    }

    fn shrinker(backend: Arc<MockBackend>, params: ShrinkParams) -> MediaShrink {
        MediaShrink::new(backend, params)
            .unwrap()
            .with_pump_config(pump_config())
            .with_terminator(Arc::new(RecordingTerminator::default()))
    }

    fn params() -> ShrinkParams {
        ShrinkParams::new(640, 1_000_000, 128_000)
    }

    #[test]
    fn test_shrink_writes_video_and_audio() {
        let backend = fixtures::backend_with_clip(SOURCE, 10, 333);
        let mut shrinker = shrinker(backend.clone(), params());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        shrinker.set_progress_listener(Some(Arc::new(move |p| sink.lock().unwrap().push(p))));
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let callback = Arc::new(RecordingErrorCallback::default());

        shrinker.shrink(SOURCE, &output, callback.clone()).unwrap();

        assert!(callback.errors().is_empty());
        let muxer = backend.last_muxer().unwrap();
        let state = muxer.state();
        assert_eq!(state.tracks.len(), 2);
        assert_eq!(state.tracks[0].kind(), Some(MediaKind::Video));
        assert_eq!(state.tracks[1].kind(), Some(MediaKind::Audio));
        assert!(state.stopped && state.released);
        assert_eq!(muxer.samples(1).len(), 10);
        assert!(!muxer.samples(0).is_empty());
        assert!(output.exists());

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| *p <= 100));
        assert_eq!(seen.first(), Some(&10));
        assert_eq!(seen.last(), Some(&100));

        let (extractor, metadata) = backend.source(SOURCE).unwrap();
        assert!(extractor.is_released());
        assert!(metadata.is_released());
        assert!(backend.all_codecs_released());
    }

    #[test]
    fn test_too_long_fails_before_any_codec() {
        let backend = fixtures::backend_with_clip(SOURCE, 10, 90_000);
        let shrinker = shrinker(backend.clone(), params().with_duration_limit_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let callback = Arc::new(RecordingErrorCallback::default());

        let err = shrinker
            .shrink(SOURCE, &dir.path().join("out.mp4"), callback.clone())
            .unwrap_err();

        assert!(matches!(
            err,
            ShrinkError::TooLong {
                duration_secs: 90,
                limit_secs: 60
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(backend.created_codec_count(), 0);
        assert!(backend.last_muxer().is_none());
        assert!(callback.errors().is_empty());
        assert!(backend.source(SOURCE).unwrap().0.is_released());
    }

    #[test]
    fn test_duration_within_limit_passes() {
        let backend = fixtures::backend_with_clip(SOURCE, 4, 60_999);
        let shrinker = shrinker(backend, params().with_duration_limit_secs(60));
        let dir = tempfile::tempdir().unwrap();

        shrinker
            .shrink(
                SOURCE,
                &dir.path().join("out.mp4"),
                Arc::new(RecordingErrorCallback::default()),
            )
            .unwrap();
    }

    #[test]
    fn test_extra_tracks_are_dropped() {
        let backend = fixtures::working_backend();
        let mut extractor = MockExtractor::new();
        let first = extractor.add_track(video_source_format(1280, 720, 100_000));
        let second = extractor.add_track(video_source_format(640, 360, 100_000));
        let audio = extractor.add_track(audio_source_format(44_100, 2, 100_000));
        for i in 0..3 {
            extractor.push_sample(first, vec![1; 64], i * 40_000, SampleFlags::NONE);
            extractor.push_sample(second, vec![2; 64], i * 40_000, SampleFlags::NONE);
            extractor.push_sample(audio, vec![3; 64], i * 40_000, SampleFlags::NONE);
        }
        backend.add_source(SOURCE, extractor, MockMetadata::new(Some(100), 0));
        let backend = Arc::new(backend);
        let shrinker = shrinker(backend.clone(), params());
        let dir = tempfile::tempdir().unwrap();

        shrinker
            .shrink(
                SOURCE,
                &dir.path().join("out.mp4"),
                Arc::new(RecordingErrorCallback::default()),
            )
            .unwrap();

        let muxer = backend.last_muxer().unwrap();
        let tracks = muxer.tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(
            tracks.iter().filter(|t| t.kind() == Some(MediaKind::Video)).count(),
            1
        );
        // Only the first video track's frames were drawn.
        assert_eq!(backend.renderer_state().unwrap().frames_drawn, 3);
        assert_eq!(muxer.samples(1).len(), 3);
    }

    #[test]
    fn test_unreadable_source_is_recoverable() {
        let backend = Arc::new(fixtures::working_backend());
        let shrinker = shrinker(backend, params());
        let dir = tempfile::tempdir().unwrap();

        let err = shrinker
            .shrink(
                "content://missing",
                &dir.path().join("out.mp4"),
                Arc::new(RecordingErrorCallback::default()),
            )
            .unwrap_err();

        assert!(matches!(err, ShrinkError::SourceUnreadable { .. }));
    }

    #[test]
    fn test_failure_after_muxer_opened_is_unrecoverable() {
        let backend = fixtures::working_backend();
        backend.add_source(SOURCE, fixtures::clip(5), MockMetadata::new(Some(166), 0));
        backend.fail_muxer_writes();
        let backend = Arc::new(backend);
        let shrinker = shrinker(backend.clone(), params());
        let dir = tempfile::tempdir().unwrap();
        let callback = Arc::new(RecordingErrorCallback::default());

        let err = shrinker
            .shrink(SOURCE, &dir.path().join("out.mp4"), callback.clone())
            .unwrap_err();

        assert!(matches!(err, ShrinkError::Aborted));
        assert_eq!(callback.errors().len(), 1);
        let state = backend.last_muxer().unwrap().state();
        assert!(state.stopped && state.released);
        assert!(backend.all_codecs_released());
        assert!(backend.source(SOURCE).unwrap().0.is_released());
    }

    #[test]
    fn test_missing_codec_after_muxer_opened_is_unrecoverable() {
        let backend = MockBackend::new();
        backend.add_source(SOURCE, fixtures::clip(3), MockMetadata::new(Some(100), 0));
        let backend = Arc::new(backend);
        let shrinker = shrinker(backend.clone(), params());
        let dir = tempfile::tempdir().unwrap();
        let callback = Arc::new(RecordingErrorCallback::default());

        let err = shrinker
            .shrink(SOURCE, &dir.path().join("out.mp4"), callback.clone())
            .unwrap_err();

        assert!(matches!(err, ShrinkError::Aborted));
        assert_eq!(callback.errors().len(), 1);
        assert!(callback.errors()[0].contains("not found"));
        let state = backend.last_muxer().unwrap().state();
        assert!(!state.started && state.released);
    }

    #[test]
    fn test_release_failure_is_unrecoverable() {
        let backend = fixtures::working_backend();
        let extractor = fixtures::clip(3);
        extractor.fail_release();
        backend.add_source(SOURCE, extractor, MockMetadata::new(Some(100), 0));
        let backend = Arc::new(backend);
        let shrinker = shrinker(backend, params());
        let dir = tempfile::tempdir().unwrap();
        let callback = Arc::new(RecordingErrorCallback::default());

        let err = shrinker
            .shrink(SOURCE, &dir.path().join("out.mp4"), callback.clone())
            .unwrap_err();

        assert!(matches!(err, ShrinkError::Aborted));
        assert_eq!(callback.errors().len(), 1);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let backend = Arc::new(MockBackend::new());
        assert!(MediaShrink::new(backend, ShrinkParams::new(100, 1, 1)).is_err());
    }
}
