//! Error types shared by the reencoder, orchestrator, worker and queue.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::media::MediaKind;

/// Message used when a failure carries no text of its own.
pub const GENERIC_FAILURE_MESSAGE: &str = "failed to shrink";

/// Which side of a track pipeline a codec was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecRole {
    Decoder,
    Encoder,
}

impl std::fmt::Display for CodecRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decoder => write!(f, "decoder"),
            Self::Encoder => write!(f, "encoder"),
        }
    }
}

/// Errors that can occur while shrinking a video.
#[derive(Debug, Error)]
pub enum ShrinkError {
    /// No codec on this device handles the mime type.
    #[error("{kind} {role} codec is not found. mime-type: {mime}")]
    CodecNotFound {
        kind: MediaKind,
        role: CodecRole,
        mime: String,
    },

    /// A codec exists but could not be instantiated or configured.
    #[error("{kind} {role} cannot be created. codec-name: {codec}: {reason}")]
    CodecCreation {
        kind: MediaKind,
        role: CodecRole,
        codec: String,
        reason: String,
    },

    /// A selected track produced no samples.
    #[error("no {kind} sample found")]
    NoSamples { kind: MediaKind },

    /// The source is longer than the configured limit.
    #[error("movie duration ({duration_secs} sec) is longer than duration limit ({limit_secs} sec)")]
    TooLong { duration_secs: u64, limit_secs: u64 },

    /// The source could not be opened or read.
    #[error("failed to read input: {reason}")]
    SourceUnreadable { reason: String },

    /// A format lacks an attribute the pipeline needs.
    #[error("format {mime} is missing key: {key}")]
    MissingFormatKey { mime: String, key: &'static str },

    /// Shrink parameters are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Platform codec failure while data is flowing.
    #[error("codec error: {0}")]
    Codec(String),

    /// Container writer failure.
    #[error("muxer error: {0}")]
    Muxer(String),

    /// Work stopped after an unrecoverable error was already reported.
    #[error("shrink aborted after an unrecoverable error")]
    Aborted,

    /// The workspace directory is unusable.
    #[error("workspace error at {path}: {reason}")]
    Workspace { path: PathBuf, reason: String },

    /// Connecting to the worker failed.
    #[error("failed to connect to shrink worker: {0}")]
    Bind(String),

    /// Delivering a request to the worker failed.
    #[error("failed to send request to shrink worker: {0}")]
    Send(String),

    /// The worker went away while a job was running.
    #[error("process killed")]
    ProcessKilled,

    /// The queue actor is gone.
    #[error("shrink queue is closed")]
    QueueClosed,

    /// Failure reported by the worker over the wire.
    #[error("{message}")]
    Remote { recoverable: bool, message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShrinkError {
    /// Creates a codec failure.
    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec(reason.into())
    }

    /// Creates a muxer failure.
    pub fn muxer(reason: impl Into<String>) -> Self {
        Self::Muxer(reason.into())
    }

    /// Creates a source read failure.
    pub fn source_unreadable(reason: impl Into<String>) -> Self {
        Self::SourceUnreadable {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Whether this error leaves no corrupted state behind.
    ///
    /// Unrecoverable errors mean a container may be half written and the
    /// worker hosting it must terminate.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Codec(_) | Self::Muxer(_) | Self::Aborted => false,
            Self::Remote { recoverable, .. } => *recoverable,
            _ => true,
        }
    }

    /// Converts to the serializable form sent across the worker boundary.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: ErrorKind::of(self),
            message: self.to_string(),
        }
    }
}

/// Coarse classification carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CodecNotFound,
    CodecCreation,
    NoSamples,
    TooLong,
    SourceUnreadable,
    InvalidConfig,
    Io,
    Internal,
}

impl ErrorKind {
    fn of(error: &ShrinkError) -> Self {
        match error {
            ShrinkError::CodecNotFound { .. } => Self::CodecNotFound,
            ShrinkError::CodecCreation { .. } => Self::CodecCreation,
            ShrinkError::NoSamples { .. } => Self::NoSamples,
            ShrinkError::TooLong { .. } => Self::TooLong,
            ShrinkError::SourceUnreadable { .. } => Self::SourceUnreadable,
            ShrinkError::InvalidConfig(_) | ShrinkError::MissingFormatKey { .. } => {
                Self::InvalidConfig
            }
            ShrinkError::Io(_) => Self::Io,
            _ => Self::Internal,
        }
    }
}

/// Error as transported in a worker reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    /// Rebuilds the caller-facing error.
    pub fn into_error(self, recoverable: bool) -> ShrinkError {
        let message = if self.message.trim().is_empty() {
            GENERIC_FAILURE_MESSAGE.to_string()
        } else {
            self.message
        };
        ShrinkError::Remote {
            recoverable,
            message,
        }
    }
}

pub type Result<T, E = ShrinkError> = std::result::Result<T, E>;
