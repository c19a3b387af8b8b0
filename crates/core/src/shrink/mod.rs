//! Shrink orchestration.
//!
//! [`MediaShrink`] opens a source, keeps its first video and first audio
//! track, registers both with the muxer using probed output formats, then
//! reencodes them one after the other while reporting weighted progress:
//!
//! | Step                      | Weight per track |
//! |---------------------------|------------------|
//! | Track added to the muxer  | 10               |
//! | Track content written     | 40               |
//!
//! Failures before the output is opened are recoverable. Once the muxer
//! exists, every failure is reported as unrecoverable.

mod orchestrator;
mod progress;
mod types;

pub use orchestrator::MediaShrink;
pub use types::{
    select_tracks, ShrinkParams, TrackSelection, PROGRESS_ADD_TRACK, PROGRESS_WRITE_CONTENT,
};
