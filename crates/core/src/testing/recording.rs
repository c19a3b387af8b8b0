//! Recording terminator and error callback for testing.

use std::sync::Mutex;

use super::lock;
use crate::error::ShrinkError;
use crate::reencode::{Terminator, UnrecoverableErrorCallback};

/// Terminator that records requests instead of exiting.
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    reasons: Mutex<Vec<String>>,
}

impl RecordingTerminator {
    pub fn count(&self) -> usize {
        lock(&self.reasons).len()
    }

    pub fn reasons(&self) -> Vec<String> {
        lock(&self.reasons).clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, reason: &str) {
        lock(&self.reasons).push(reason.to_string());
    }
}

/// Error callback that records every reported error message.
#[derive(Debug, Default)]
pub struct RecordingErrorCallback {
    errors: Mutex<Vec<String>>,
}

impl RecordingErrorCallback {
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

impl UnrecoverableErrorCallback for RecordingErrorCallback {
    fn on_unrecoverable_error(&self, error: &ShrinkError) {
        lock(&self.errors).push(error.to_string());
    }
}
