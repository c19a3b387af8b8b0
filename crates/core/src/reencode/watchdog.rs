//! Codec stop watchdog.
//!
//! A hung hardware codec cannot be freed from inside the process, so a stop
//! that does not return in time brings the whole process down.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::error::Result;
use crate::media::Codec;

/// Exit code used when the process terminates itself.
pub const TERMINATED_EXIT_CODE: i32 = 70;

/// Ends the hosting process.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// Exits the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, reason: &str) {
        error!("Terminating process: {}", reason);
        std::process::exit(TERMINATED_EXIT_CODE);
    }
}

/// Stops `codec`, terminating the process if the stop takes longer than
/// `timeout`.
pub fn stop_with_timeout(
    codec: &mut dyn Codec,
    timeout: Duration,
    terminator: &Arc<dyn Terminator>,
) -> Result<()> {
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let terminator = Arc::clone(terminator);
    let name = codec.name().to_string();

    std::thread::Builder::new()
        .name("codec-stop-watchdog".to_string())
        .spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                error!("Codec {} did not stop within {:?}", name, timeout);
                terminator.terminate(&format!("codec {} stop timeout", name));
            }
        })?;

    let result = codec.stop();
    let _ = done_tx.send(());
    result
}
