//! Mock extractor, metadata reader and muxer for testing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::lock;
use crate::error::{Result, ShrinkError};
use crate::media::{BufferInfo, Extractor, MediaFormat, MetadataReader, Muxer, SampleFlags};

#[derive(Debug, Clone)]
struct MockSample {
    data: Vec<u8>,
    presentation_time_us: i64,
    flags: SampleFlags,
}

#[derive(Debug, Clone)]
struct MockTrack {
    format: MediaFormat,
    samples: Vec<MockSample>,
}

#[derive(Debug, Default)]
struct ExtractorShared {
    selected: BTreeSet<usize>,
    released: bool,
    fail_release: bool,
}

/// In-memory extractor.
///
/// Clones share selection and release state, so a test can keep a clone to
/// inspect after handing another one to the code under test.
#[derive(Debug, Clone, Default)]
pub struct MockExtractor {
    tracks: Vec<MockTrack>,
    cursor: Option<(usize, usize)>,
    shared: Arc<Mutex<ExtractorShared>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a track and returns its index.
    pub fn add_track(&mut self, format: MediaFormat) -> usize {
        self.tracks.push(MockTrack {
            format,
            samples: Vec::new(),
        });
        self.tracks.len() - 1
    }

    pub fn push_sample(
        &mut self,
        track: usize,
        data: Vec<u8>,
        presentation_time_us: i64,
        flags: SampleFlags,
    ) {
        if let Some(track) = self.tracks.get_mut(track) {
            track.samples.push(MockSample {
                data,
                presentation_time_us,
                flags,
            });
        }
    }

    /// Makes `release` fail.
    pub fn fail_release(&self) {
        lock(&self.shared).fail_release = true;
    }

    pub fn selected_tracks(&self) -> Vec<usize> {
        lock(&self.shared).selected.iter().copied().collect()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.shared).released
    }

    fn current(&self) -> Option<&MockSample> {
        let (track, position) = self.cursor?;
        self.tracks.get(track)?.samples.get(position)
    }
}

impl Extractor for MockExtractor {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Result<MediaFormat> {
        self.tracks
            .get(index)
            .map(|t| t.format.clone())
            .ok_or_else(|| ShrinkError::source_unreadable(format!("no track {}", index)))
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index >= self.tracks.len() {
            return Err(ShrinkError::source_unreadable(format!("no track {}", index)));
        }
        lock(&self.shared).selected.insert(index);
        self.cursor = Some((index, 0));
        Ok(())
    }

    fn unselect_track(&mut self, index: usize) -> Result<()> {
        lock(&self.shared).selected.remove(&index);
        if matches!(self.cursor, Some((track, _)) if track == index) {
            self.cursor = None;
        }
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(sample) = self.current() else {
            return Ok(None);
        };
        let size = sample.data.len();
        let dst = buf
            .get_mut(..size)
            .ok_or_else(|| ShrinkError::codec("decoder input buffer is too small"))?;
        dst.copy_from_slice(&sample.data);
        Ok(Some(size))
    }

    fn sample_time_us(&self) -> i64 {
        self.current().map_or(-1, |s| s.presentation_time_us)
    }

    fn sample_flags(&self) -> SampleFlags {
        self.current().map_or(SampleFlags::NONE, |s| s.flags)
    }

    fn advance(&mut self) -> bool {
        if let Some((_, position)) = self.cursor.as_mut() {
            *position += 1;
        }
        self.current().is_some()
    }

    fn release(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.released = true;
        if shared.fail_release {
            return Err(ShrinkError::source_unreadable("extractor release failed"));
        }
        Ok(())
    }
}

/// Metadata reader with fixed values.
#[derive(Debug, Clone, Default)]
pub struct MockMetadata {
    pub duration_ms: Option<u64>,
    pub rotation: u32,
    released: Arc<Mutex<bool>>,
}

impl MockMetadata {
    pub fn new(duration_ms: Option<u64>, rotation: u32) -> Self {
        Self {
            duration_ms,
            rotation,
            released: Arc::default(),
        }
    }

    pub fn is_released(&self) -> bool {
        *lock(&self.released)
    }
}

impl MetadataReader for MockMetadata {
    fn duration_ms(&self) -> Result<Option<u64>> {
        Ok(self.duration_ms)
    }

    fn video_rotation(&self) -> Result<u32> {
        Ok(self.rotation)
    }

    fn release(&mut self) -> Result<()> {
        *lock(&self.released) = true;
        Ok(())
    }
}

/// A sample written to a [`MockMuxer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedSample {
    pub track: usize,
    pub data: Vec<u8>,
    pub info: BufferInfo,
}

/// Observable state of a [`MockMuxer`].
#[derive(Debug, Clone, Default)]
pub struct MuxerState {
    pub tracks: Vec<MediaFormat>,
    pub samples: Vec<MuxedSample>,
    pub started: bool,
    pub stopped: bool,
    pub released: bool,
}

#[derive(Debug, Default)]
struct MuxerShared {
    state: MuxerState,
    fail_writes: bool,
}

/// Muxer recording everything written to it.
///
/// When created with a path, `stop` writes the concatenated sample bytes
/// there. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockMuxer {
    path: Option<PathBuf>,
    shared: Arc<Mutex<MuxerShared>>,
}

impl MockMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_file(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            shared: Arc::default(),
        }
    }

    /// Makes every following `write_sample` fail.
    pub fn fail_writes(&self) {
        lock(&self.shared).fail_writes = true;
    }

    pub fn state(&self) -> MuxerState {
        lock(&self.shared).state.clone()
    }

    pub fn tracks(&self) -> Vec<MediaFormat> {
        lock(&self.shared).state.tracks.clone()
    }

    /// Samples written to `track`, in order.
    pub fn samples(&self, track: usize) -> Vec<MuxedSample> {
        lock(&self.shared)
            .state
            .samples
            .iter()
            .filter(|s| s.track == track)
            .cloned()
            .collect()
    }
}

impl Muxer for MockMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize> {
        let mut shared = lock(&self.shared);
        if shared.state.started {
            return Err(ShrinkError::muxer("track added after start"));
        }
        shared.state.tracks.push(format.clone());
        Ok(shared.state.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.state.tracks.is_empty() {
            return Err(ShrinkError::muxer("no tracks added"));
        }
        shared.state.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> Result<()> {
        let mut shared = lock(&self.shared);
        if !shared.state.started {
            return Err(ShrinkError::muxer("muxer is not started"));
        }
        if shared.fail_writes {
            return Err(ShrinkError::muxer("write failed"));
        }
        if track >= shared.state.tracks.len() {
            return Err(ShrinkError::muxer(format!("unknown track {}", track)));
        }
        shared.state.samples.push(MuxedSample {
            track,
            data: data.to_vec(),
            info: *info,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        if !shared.state.started {
            return Err(ShrinkError::muxer("muxer stopped before start"));
        }
        shared.state.stopped = true;
        if let Some(path) = &self.path {
            let bytes: Vec<u8> = shared
                .state
                .samples
                .iter()
                .flat_map(|s| s.data.iter().copied())
                .collect();
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.shared).state.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_reads_selected_track_from_start() {
        let mut extractor = MockExtractor::new();
        let track = extractor.add_track(MediaFormat::audio("audio/mp4a-latm", 44_100, 2));
        extractor.push_sample(track, vec![1, 2], 0, SampleFlags::NONE);
        extractor.push_sample(track, vec![3], 10, SampleFlags::NONE);

        let mut buf = [0u8; 8];
        assert_eq!(extractor.read_sample(&mut buf).unwrap(), None);

        extractor.select_track(track).unwrap();
        assert_eq!(extractor.read_sample(&mut buf).unwrap(), Some(2));
        assert!(extractor.advance());
        assert_eq!(extractor.sample_time_us(), 10);
        assert!(!extractor.advance());

        extractor.select_track(track).unwrap();
        assert_eq!(extractor.sample_time_us(), 0);
        assert_eq!(extractor.selected_tracks(), vec![track]);
    }

    #[test]
    fn test_muxer_rejects_late_tracks_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut muxer = MockMuxer::to_file(&path);
        let track = muxer.add_track(&MediaFormat::default()).unwrap();
        muxer.start().unwrap();
        assert!(muxer.add_track(&MediaFormat::default()).is_err());

        muxer
            .write_sample(track, &[1, 2, 3], &BufferInfo::new(0, 3, 0, SampleFlags::NONE))
            .unwrap();
        muxer.stop().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }
}
