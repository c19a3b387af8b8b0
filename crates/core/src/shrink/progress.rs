//! Weighted progress across the tracks of one shrink.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::reencode::ProgressListener;

struct ProgressState {
    current: u32,
    last_reported: Option<u32>,
}

/// Turns weighted steps into a non-decreasing percentage.
#[derive(Clone)]
pub(crate) struct ProgressTracker {
    max: u32,
    listener: Option<ProgressListener>,
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressTracker {
    pub fn new(max: u32, listener: Option<ProgressListener>) -> Self {
        Self {
            max: max.max(1),
            listener,
            state: Arc::new(Mutex::new(ProgressState {
                current: 0,
                last_reported: None,
            })),
        }
    }

    /// Completed weight so far.
    pub fn current(&self) -> u32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current
    }

    /// Completes `weight` more and reports.
    pub fn advance(&self, weight: u32) {
        let progress = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.current = (state.current + weight).min(self.max);
            state.current
        };
        self.deliver(progress);
    }

    /// Listener for a track whose content step is worth `weight`, starting
    /// at `base`.
    pub fn track_listener(&self, base: u32, weight: u32) -> ProgressListener {
        let tracker = self.clone();
        Arc::new(move |percent: u32| {
            tracker.deliver(base + percent.min(100) * weight / 100);
        })
    }

    fn deliver(&self, progress: u32) {
        let percent = (progress.min(self.max) * 100 / self.max).min(100);
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.last_reported.is_some_and(|last| percent <= last) {
                return;
            }
            state.last_reported = Some(percent);
        }
        trace!("shrink progress: {}%", percent);
        if let Some(listener) = &self.listener {
            listener(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (ProgressListener, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |p| sink.lock().unwrap().push(p)), seen)
    }

    #[test]
    fn test_weighted_progress_is_normalized() {
        let (listener, seen) = recording();
        let tracker = ProgressTracker::new(100, Some(listener));

        tracker.advance(10);
        tracker.advance(10);
        let video = tracker.track_listener(tracker.current(), 40);
        video(50);
        tracker.advance(40);

        assert_eq!(*seen.lock().unwrap(), vec![10, 20, 40, 60]);
    }

    #[test]
    fn test_progress_never_decreases_or_exceeds_100() {
        let (listener, seen) = recording();
        let tracker = ProgressTracker::new(50, Some(listener));

        tracker.advance(10);
        let track = tracker.track_listener(tracker.current(), 40);
        for percent in [80, 20, 150, 0, 100] {
            track(percent);
        }
        tracker.advance(40);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| *p <= 100));
        assert_eq!(seen.last(), Some(&100));
    }
}
