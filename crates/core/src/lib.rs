pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod queue;
pub mod reencode;
pub mod shrink;
pub mod testing;
pub mod worker;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, ShrinkConfig,
    WorkerProcessConfig,
};
pub use error::{ErrorKind, ErrorPayload, Result, ShrinkError};
pub use media::{MediaBackend, MediaFormat, MediaKind};
pub use protocol::{BindParams, WorkerReply, WorkerRequest};
pub use queue::{
    ConnectionEvent, ConnectionEvents, LocalBinder, QueueConfig, ShrinkQueue, WorkerBinder,
    WORKING_FILE_PREFIX,
};
pub use reencode::{
    AudioReencoder, ProgressListener, PumpConfig, SnapshotConfig, Terminator, TrackReencoder,
    UnrecoverableErrorCallback, VideoReencoder,
};
pub use shrink::{MediaShrink, ShrinkParams};
pub use worker::{ReplySink, WorkerService};
