//! Job queue.
//!
//! Serializes shrink jobs onto one worker at a time. The worker is bound
//! lazily on the first job, reused while jobs keep coming, and released
//! after an idle delay.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► ShrinkQueue ──mailbox──► QueueActor ──WorkerBinder──► worker
//!                                          ▲                           │
//!                                          └──── ConnectionEvents ◄────┘
//! ```
//!
//! Replies carry no job id. The actor matches each reply to the head of its
//! FIFO, so the binding must deliver replies in request order.
//!
//! Jobs write into a working file under the workspace. On `Complete` the
//! working file is copied to the destination; the working file is deleted
//! on every outcome.

mod actor;
mod binder;
mod config;
mod handle;
mod local;
mod workspace;

pub use actor::QueueActor;
pub use binder::{ConnectionEvent, ConnectionEvents, WorkerBinder};
pub use config::QueueConfig;
pub use handle::ShrinkQueue;
pub use local::LocalBinder;
pub use workspace::WORKING_FILE_PREFIX;
