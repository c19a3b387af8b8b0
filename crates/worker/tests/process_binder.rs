//! ProcessBinder tests against scripted stand-in workers.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediashrink_core::{
    BindParams, QueueConfig, ShrinkError, ShrinkQueue, WorkerBinder, WorkerProcessConfig,
};
use mediashrink_worker::ProcessBinder;

/// Worker that answers every request with progress and success.
const ECHO_WORKER: &str = r#"
read -r params
while read -r line; do
  echo '{"type":"progress","percent":50}'
  echo '{"type":"complete"}'
done
"#;

/// Worker that dies while processing its first request.
const CRASHING_WORKER: &str = r#"
read -r params
read -r line
exit 3
"#;

fn shell(script: &str) -> WorkerProcessConfig {
    WorkerProcessConfig {
        executable: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string()],
        log_filter: None,
    }
}

fn queue(dir: &Path, binder: Arc<ProcessBinder>) -> ShrinkQueue {
    let config = QueueConfig::default()
        .with_workspace_dir(dir.join("work"))
        .with_bind_retry_delay_ms(20)
        .with_idle_unbind_delay_ms(50);
    ShrinkQueue::spawn(config, BindParams::new(640, 1_000_000, 128_000), binder).unwrap()
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_job_completes_through_worker_process() {
    let dir = tempfile::tempdir().unwrap();
    let binder = Arc::new(ProcessBinder::new(shell(ECHO_WORKER)));
    let queue = queue(dir.path(), binder.clone());
    let dest = dir.path().join("out.mp4");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let size = tokio::time::timeout(
        Duration::from_secs(10),
        queue.submit(
            "content://media/1",
            &dest,
            Some(Arc::new(move |p| sink.lock().unwrap().push(p))),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(size, 0);
    assert!(dest.exists());
    assert_eq!(*seen.lock().unwrap(), vec![50]);
    // The idle worker is released and its process exits.
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_until(|| !binder.is_unbinding()).await;
}

#[tokio::test]
async fn test_worker_crash_fails_job_as_killed() {
    let dir = tempfile::tempdir().unwrap();
    let binder = Arc::new(ProcessBinder::new(shell(CRASHING_WORKER)));
    let queue = queue(dir.path(), binder);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        queue.submit("content://media/1", dir.path().join("out.mp4"), None),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(ShrinkError::ProcessKilled)));
}

#[tokio::test]
async fn test_missing_executable_fails_bind() {
    let dir = tempfile::tempdir().unwrap();
    let binder = Arc::new(ProcessBinder::new(WorkerProcessConfig {
        executable: dir.path().join("no-such-worker"),
        ..WorkerProcessConfig::default()
    }));
    let queue = queue(dir.path(), binder);

    let result = queue
        .submit("content://media/1", dir.path().join("out.mp4"), None)
        .await;

    assert!(matches!(result, Err(ShrinkError::Bind(_))));
}
