use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::BindParams;
use crate::queue::QueueConfig;
use crate::reencode::{PumpConfig, SnapshotConfig};

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub shrink: ShrinkConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerProcessConfig,
}

/// Output parameters and pump tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShrinkConfig {
    /// Output width, a multiple of 16
    pub width: u32,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    /// Longest accepted source in seconds (default: 0, no limit)
    #[serde(default)]
    pub duration_limit_secs: u64,
    /// Minimum time between progress reports of one track
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    /// Codec stop watchdog
    #[serde(default = "default_codec_stop_timeout")]
    pub codec_stop_timeout_ms: u64,
    /// Diagnostic frame snapshots, off unless configured
    #[serde(default)]
    pub snapshots: Option<SnapshotConfig>,
}

fn default_progress_interval() -> u64 {
    3000
}

fn default_codec_stop_timeout() -> u64 {
    10_000
}

impl ShrinkConfig {
    pub fn new(width: u32, video_bitrate: u32, audio_bitrate: u32) -> Self {
        Self::from(&BindParams::new(width, video_bitrate, audio_bitrate))
    }

    pub fn with_duration_limit_secs(mut self, limit: u64) -> Self {
        self.duration_limit_secs = limit;
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotConfig) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Parameters a worker is bound with.
    pub fn bind_params(&self) -> BindParams {
        BindParams::new(self.width, self.video_bitrate, self.audio_bitrate)
            .with_duration_limit_secs(self.duration_limit_secs)
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            stop_timeout: Duration::from_millis(self.codec_stop_timeout_ms),
            snapshots: self.snapshots.clone(),
            ..PumpConfig::default()
        }
    }
}

impl From<&BindParams> for ShrinkConfig {
    fn from(params: &BindParams) -> Self {
        Self {
            width: params.width,
            video_bitrate: params.video_bitrate,
            audio_bitrate: params.audio_bitrate,
            duration_limit_secs: params.duration_limit_secs,
            progress_interval_ms: default_progress_interval(),
            codec_stop_timeout_ms: default_codec_stop_timeout(),
            snapshots: None,
        }
    }
}

/// How worker processes are launched
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerProcessConfig {
    /// Worker executable (default: `mediashrink-worker` from PATH)
    #[serde(default = "default_worker_executable")]
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Log filter passed to the worker as `MEDIASHRINK_LOG`
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl Default for WorkerProcessConfig {
    fn default() -> Self {
        Self {
            executable: default_worker_executable(),
            args: Vec::new(),
            log_filter: None,
        }
    }
}

fn default_worker_executable() -> PathBuf {
    PathBuf::from("mediashrink-worker")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let toml = r#"
[shrink]
width = 640
video_bitrate = 1000000
audio_bitrate = 128000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.shrink.width, 640);
        assert_eq!(config.shrink.duration_limit_secs, 0);
        assert_eq!(config.shrink.progress_interval_ms, 3000);
        assert!(config.shrink.snapshots.is_none());
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.worker.executable, PathBuf::from("mediashrink-worker"));
    }

    #[test]
    fn test_deserialize_missing_shrink_fails() {
        let toml = r#"
[queue]
workspace_dir = "/tmp/work"
"#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_snapshots() {
        let toml = r#"
[shrink]
width = 320
video_bitrate = 500000
audio_bitrate = 64000

[shrink.snapshots]
dir = "/tmp/snapshots"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let snapshots = config.shrink.snapshots.unwrap();
        assert_eq!(snapshots.dir, PathBuf::from("/tmp/snapshots"));
        assert_eq!(snapshots.count, 10);
    }

    #[test]
    fn test_bind_params_round_trip() {
        let config = ShrinkConfig::new(640, 1_000_000, 128_000).with_duration_limit_secs(60);
        let params = config.bind_params();
        assert_eq!(params.duration_limit_secs, 60);
        assert_eq!(ShrinkConfig::from(&params), config);
    }

    #[test]
    fn test_pump_config_from_shrink_config() {
        let mut config = ShrinkConfig::new(640, 1_000_000, 128_000);
        config.progress_interval_ms = 500;
        let pump = config.pump_config();
        assert_eq!(pump.progress_interval, Duration::from_millis(500));
        assert_eq!(pump.stop_timeout, Duration::from_secs(10));
        assert_eq!(pump.dequeue_timeout, Duration::from_micros(250));
    }
}
