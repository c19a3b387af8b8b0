//! Queue lifecycle integration tests.
//!
//! These run jobs end to end: queue -> in-process worker -> orchestrator ->
//! reencoders -> mock platform, and check what the caller ends up with.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use mediashrink_core::{
    testing::{fixtures, MockBackend, MockMetadata},
    BindParams, LocalBinder, PumpConfig, QueueConfig, ShrinkError, ShrinkQueue,
    WORKING_FILE_PREFIX,
};

const SOURCE: &str = "content://media/clip.mp4";

/// Test helper holding a queue over an in-process worker.
struct TestHarness {
    queue: ShrinkQueue,
    temp_dir: TempDir,
}

impl TestHarness {
    fn new(backend: Arc<MockBackend>, params: BindParams) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let pump_config = PumpConfig {
            progress_interval: Duration::ZERO,
            ..PumpConfig::default()
        };
        let binder = Arc::new(LocalBinder::new(backend).with_pump_config(pump_config));
        let config = QueueConfig::default()
            .with_workspace_dir(temp_dir.path().join("work"))
            .with_bind_retry_delay_ms(20)
            .with_idle_unbind_delay_ms(100);
        let queue = ShrinkQueue::spawn(config, params, binder).expect("Failed to start queue");
        Self { queue, temp_dir }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.temp_dir.path().join(name)
    }

    fn working_files(&self) -> usize {
        std::fs::read_dir(self.path("work"))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.file_name()
                            .to_str()
                            .is_some_and(|n| n.starts_with(WORKING_FILE_PREFIX))
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

fn params() -> BindParams {
    BindParams::new(640, 1_000_000, 128_000)
}

async fn with_timeout<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("Job did not finish in time")
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).expect("destination missing").len()
}

#[tokio::test]
async fn test_shrink_job_lifecycle() {
    let harness = TestHarness::new(fixtures::backend_with_clip(SOURCE, 12, 400), params());
    let dest = harness.path("shrunk.mp4");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let size = with_timeout(harness.queue.submit(
        SOURCE,
        &dest,
        Some(Arc::new(move |p| sink.lock().unwrap().push(p))),
    ))
    .await
    .expect("Job failed");

    assert!(size > 0);
    assert_eq!(file_len(&dest), size);
    assert_eq!(harness.working_files(), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&10));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_concurrent_submissions_both_complete() {
    let harness = TestHarness::new(fixtures::backend_with_clip(SOURCE, 6, 200), params());
    let first = harness.path("first.mp4");
    let second = harness.path("second.mp4");

    let (a, b) = with_timeout(async {
        tokio::join!(
            harness.queue.submit(SOURCE, &first, None),
            harness.queue.submit(SOURCE, &second, None)
        )
    })
    .await;

    assert_eq!(file_len(&first), a.unwrap());
    assert_eq!(file_len(&second), b.unwrap());
    assert_eq!(harness.working_files(), 0);
}

#[tokio::test]
async fn test_too_long_source_is_reported() {
    let harness = TestHarness::new(
        fixtures::backend_with_clip(SOURCE, 4, 90_000),
        params().with_duration_limit_secs(60),
    );
    let dest = harness.path("shrunk.mp4");

    let result = with_timeout(harness.queue.submit(SOURCE, &dest, None)).await;

    match result {
        Err(ShrinkError::Remote {
            recoverable,
            message,
        }) => {
            assert!(recoverable);
            assert!(message.contains("90 sec"));
        }
        other => panic!("expected a recoverable remote error, got {:?}", other),
    }
    assert!(!dest.exists());
    assert_eq!(harness.working_files(), 0);
}

#[tokio::test]
async fn test_unknown_source_is_reported() {
    let harness = TestHarness::new(fixtures::backend_with_clip(SOURCE, 4, 133), params());

    let result = with_timeout(harness.queue.submit(
        "content://media/missing.mp4",
        harness.path("out.mp4"),
        None,
    ))
    .await;

    assert!(matches!(
        result,
        Err(ShrinkError::Remote {
            recoverable: true,
            ..
        })
    ));
}

#[tokio::test]
async fn test_write_failure_is_unrecoverable_and_leaves_no_output() {
    let backend = fixtures::working_backend();
    backend.add_source(SOURCE, fixtures::clip(5), MockMetadata::new(Some(166), 0));
    backend.fail_muxer_writes();
    let harness = TestHarness::new(Arc::new(backend), params());
    let dest = harness.path("shrunk.mp4");

    let result = with_timeout(harness.queue.submit(SOURCE, &dest, None)).await;

    assert!(matches!(
        result,
        Err(ShrinkError::Remote {
            recoverable: false,
            ..
        })
    ));
    assert!(!dest.exists());
    assert_eq!(harness.working_files(), 0);
}
