//! Messages exchanged between the job queue and a shrink worker.
//!
//! Parameters are sent once per binding. Requests carry no id: replies are
//! matched to requests by order alone, so the transport must preserve it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorPayload, ShrinkError};

/// Parameters a worker is bound with. They apply to every request of the
/// binding.
pub type BindParams = crate::shrink::ShrinkParams;

/// Request sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Shrink `source` into `output_path`, a working file owned by the queue.
    Shrink { source: String, output_path: PathBuf },
}

/// Reply sent by a worker for the request it is currently processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Overall progress in percent.
    Progress { percent: u32 },
    /// The output file is complete.
    Complete,
    /// The job failed without harming the worker.
    RecoverableError { error: ErrorPayload },
    /// The job failed and the worker is terminating.
    UnrecoverableError { error: ErrorPayload },
}

impl WorkerReply {
    pub fn recoverable(error: &ShrinkError) -> Self {
        Self::RecoverableError {
            error: error.to_payload(),
        }
    }

    pub fn unrecoverable(error: &ShrinkError) -> Self {
        Self::UnrecoverableError {
            error: error.to_payload(),
        }
    }

    /// Whether this reply ends the current request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}
