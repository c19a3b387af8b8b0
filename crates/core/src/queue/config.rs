//! Job queue configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the shrink job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory holding working files. Swept when the queue starts.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Wait before binding again while the previous worker is still
    /// shutting down (milliseconds).
    #[serde(default = "default_bind_retry_delay")]
    pub bind_retry_delay_ms: u64,

    /// How long an idle worker stays bound after its last job (milliseconds).
    /// A job arriving in this window reuses the binding.
    #[serde(default = "default_idle_unbind_delay")]
    pub idle_unbind_delay_ms: u64,
}

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir().join("mediashrink")
}

fn default_bind_retry_delay() -> u64 {
    1000
}

fn default_idle_unbind_delay() -> u64 {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            bind_retry_delay_ms: default_bind_retry_delay(),
            idle_unbind_delay_ms: default_idle_unbind_delay(),
        }
    }
}

impl QueueConfig {
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_bind_retry_delay_ms(mut self, ms: u64) -> Self {
        self.bind_retry_delay_ms = ms;
        self
    }

    pub fn with_idle_unbind_delay_ms(mut self, ms: u64) -> Self {
        self.idle_unbind_delay_ms = ms;
        self
    }

    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }

    pub fn idle_unbind_delay(&self) -> Duration {
        Duration::from_millis(self.idle_unbind_delay_ms)
    }
}
