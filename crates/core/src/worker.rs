//! Worker service: runs shrink requests one at a time.
//!
//! Requests arrive on a dedicated message thread (`request-queue-thread`).
//! Each one is handed to a single executor thread, and the message thread
//! waits until the executor signals it is done before taking the next
//! request, so replies of consecutive requests never interleave.
//!
//! The reencode itself runs on the executor rather than the message thread
//! because the video frame renderer must not be driven from the thread that
//! receives its frame notifications.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::error::{Result, ShrinkError};
use crate::media::MediaBackend;
use crate::protocol::{BindParams, WorkerReply, WorkerRequest};
use crate::reencode::{PumpConfig, Terminator, UnrecoverableErrorCallback};
use crate::shrink::MediaShrink;

/// Where a worker's replies go.
pub trait ReplySink: Send + Sync {
    fn send(&self, reply: WorkerReply) -> Result<()>;
}

impl ReplySink for UnboundedSender<WorkerReply> {
    fn send(&self, reply: WorkerReply) -> Result<()> {
        UnboundedSender::send(self, reply)
            .map_err(|_| ShrinkError::Send("reply channel is closed".to_string()))
    }
}

fn respond_safely(replies: &dyn ReplySink, reply: WorkerReply) {
    debug!("respond: {:?}", reply);
    if let Err(e) = replies.send(reply) {
        error!("Failed to respond: {}", e);
    }
}

/// Reports an unrecoverable error once per request, then ends the process.
struct RequestErrorCallback {
    replies: Arc<dyn ReplySink>,
    terminator: Arc<dyn Terminator>,
    fired: AtomicBool,
}

impl RequestErrorCallback {
    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl UnrecoverableErrorCallback for RequestErrorCallback {
    fn on_unrecoverable_error(&self, error: &ShrinkError) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Unrecoverable error occurred: {}", error);
        respond_safely(self.replies.as_ref(), WorkerReply::unrecoverable(error));
        self.terminator
            .terminate(&format!("unrecoverable error: {}", error));
    }
}

#[derive(Default)]
struct Handshake {
    busy: Mutex<bool>,
    done: Condvar,
}

impl Handshake {
    fn begin(&self) {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn finish(&self) {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.done.notify_all();
    }

    /// Marks the current request done when dropped, unwinding included.
    fn finish_on_drop(&self) -> FinishOnDrop<'_> {
        FinishOnDrop(self)
    }

    fn wait(&self) {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while *busy {
            busy = self
                .done
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct FinishOnDrop<'a>(&'a Handshake);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Runs requests on the executor thread.
struct Executor {
    shrink: MediaShrink,
    replies: Arc<dyn ReplySink>,
    terminator: Arc<dyn Terminator>,
}

impl Executor {
    fn run(&self, request: WorkerRequest) {
        let WorkerRequest::Shrink {
            source,
            output_path,
        } = request;
        let callback = Arc::new(RequestErrorCallback {
            replies: Arc::clone(&self.replies),
            terminator: Arc::clone(&self.terminator),
            fired: AtomicBool::new(false),
        });

        // A panic mid-shrink may have left a partial container behind.
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.shrink.shrink(&source, &output_path, callback.clone())
        }))
        .unwrap_or_else(|panic| {
            Err(ShrinkError::codec(format!(
                "shrink panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
        match result {
            Ok(()) if !callback.fired() => {
                respond_safely(self.replies.as_ref(), WorkerReply::Complete);
            }
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                error!("Failed to media shrink {}: {}", source, e);
                respond_safely(self.replies.as_ref(), WorkerReply::recoverable(&e));
            }
            // Reported through the callback unless something skipped it.
            Err(e) => callback.on_unrecoverable_error(&e),
        }
    }
}

/// A running worker bound to one set of [`BindParams`].
pub struct WorkerService {
    requests: Option<mpsc::Sender<WorkerRequest>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerService {
    /// Starts the message and executor threads.
    ///
    /// Fails when `params` are unusable, so a bind with bad parameters is
    /// rejected before any request arrives.
    pub fn start(
        backend: Arc<dyn MediaBackend>,
        params: BindParams,
        pump_config: PumpConfig,
        replies: Arc<dyn ReplySink>,
        terminator: Arc<dyn Terminator>,
    ) -> Result<Self> {
        let mut shrink = MediaShrink::new(backend, params)?
            .with_pump_config(pump_config)
            .with_terminator(Arc::clone(&terminator));
        let progress_replies = Arc::clone(&replies);
        shrink.set_progress_listener(Some(Arc::new(move |percent| {
            respond_safely(progress_replies.as_ref(), WorkerReply::Progress { percent });
        })));
        info!("Worker bound with {:?}", shrink.params());

        let executor = Executor {
            shrink,
            replies,
            terminator,
        };
        let handshake = Arc::new(Handshake::default());
        let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>();
        let (job_tx, job_rx) = mpsc::channel::<WorkerRequest>();

        let executor_handshake = Arc::clone(&handshake);
        let executor_thread = std::thread::Builder::new()
            .name("shrink-executor".to_string())
            .spawn(move || {
                while let Ok(request) = job_rx.recv() {
                    let _done = executor_handshake.finish_on_drop();
                    executor.run(request);
                }
                debug!("shrink executor stopped");
            })?;

        let request_thread = std::thread::Builder::new()
            .name("request-queue-thread".to_string())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    debug!("handle request: {:?}", request);
                    handshake.begin();
                    if job_tx.send(request).is_err() {
                        error!("Shrink executor is gone");
                        break;
                    }
                    handshake.wait();
                }
                debug!("request queue thread stopped");
            })?;

        Ok(Self {
            requests: Some(request_tx),
            threads: vec![request_thread, executor_thread],
        })
    }

    /// Queues a request. Replies go to the sink given at start.
    pub fn submit(&self, request: WorkerRequest) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or(ShrinkError::QueueClosed)?
            .send(request)
            .map_err(|_| ShrinkError::Send("worker is stopped".to_string()))
    }

    /// Stops accepting requests and waits for the current one to finish.
    pub fn shutdown(mut self) {
        self.requests.take();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerService {
    fn drop(&mut self) {
        self.requests.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{fixtures, MockMetadata, RecordingTerminator};
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const SOURCE: &str = "content://media/clip.mp4";

    fn params() -> BindParams {
        BindParams::new(640, 1_000_000, 128_000)
    }

    fn pump_config() -> PumpConfig {
        PumpConfig {
            progress_interval: Duration::ZERO,
            ..PumpConfig::default()
        }
    }

    fn shrink_request(output: &Path) -> WorkerRequest {
        WorkerRequest::Shrink {
            source: SOURCE.to_string(),
            output_path: output.to_path_buf(),
        }
    }

    /// Collects replies up to and including the `count`th terminal one.
    async fn replies_until_terminal(
        rx: &mut UnboundedReceiver<WorkerReply>,
        count: usize,
    ) -> Vec<WorkerReply> {
        let mut replies = Vec::new();
        let mut terminal = 0;
        while terminal < count {
            let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("reply channel closed");
            if reply.is_terminal() {
                terminal += 1;
            }
            replies.push(reply);
        }
        replies
    }

    #[tokio::test]
    async fn test_request_completes_with_progress() {
        let backend = fixtures::backend_with_clip(SOURCE, 10, 333);
        let (tx, mut rx) = unbounded_channel();
        let terminator = Arc::new(RecordingTerminator::default());
        let worker = WorkerService::start(
            backend,
            params(),
            pump_config(),
            Arc::new(tx),
            terminator.clone(),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("working_1.mp4");

        worker.submit(shrink_request(&output)).unwrap();
        let replies = replies_until_terminal(&mut rx, 1).await;

        assert_eq!(replies.last(), Some(&WorkerReply::Complete));
        assert!(replies
            .iter()
            .any(|r| matches!(r, WorkerReply::Progress { .. })));
        assert!(output.exists());
        assert_eq!(terminator.count(), 0);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_recoverable_error_is_replied() {
        let backend = fixtures::backend_with_clip(SOURCE, 4, 90_000);
        let (tx, mut rx) = unbounded_channel();
        let terminator = Arc::new(RecordingTerminator::default());
        let worker = WorkerService::start(
            backend,
            params().with_duration_limit_secs(60),
            pump_config(),
            Arc::new(tx),
            terminator.clone(),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();

        worker
            .submit(shrink_request(&dir.path().join("working_1.mp4")))
            .unwrap();
        let replies = replies_until_terminal(&mut rx, 1).await;

        let Some(WorkerReply::RecoverableError { error }) = replies.last() else {
            panic!("expected a recoverable error, got {:?}", replies);
        };
        assert_eq!(error.kind, ErrorKind::TooLong);
        assert_eq!(terminator.count(), 0);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_unrecoverable_error_replies_once_and_terminates() {
        let backend = fixtures::working_backend();
        backend.add_source(SOURCE, fixtures::clip(5), MockMetadata::new(Some(166), 0));
        backend.fail_muxer_writes();
        let (tx, mut rx) = unbounded_channel();
        let terminator = Arc::new(RecordingTerminator::default());
        let worker = WorkerService::start(
            Arc::new(backend),
            params(),
            pump_config(),
            Arc::new(tx),
            terminator.clone(),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();

        worker
            .submit(shrink_request(&dir.path().join("working_1.mp4")))
            .unwrap();
        let replies = replies_until_terminal(&mut rx, 1).await;
        worker.shutdown();

        assert!(matches!(
            replies.last(),
            Some(WorkerReply::UnrecoverableError { .. })
        ));
        assert_eq!(terminator.count(), 1);
        // Nothing else follows the unrecoverable reply.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requests_are_processed_in_order() {
        let backend = fixtures::backend_with_clip(SOURCE, 6, 200);
        let (tx, mut rx) = unbounded_channel();
        let worker = WorkerService::start(
            backend,
            params(),
            pump_config(),
            Arc::new(tx),
            Arc::new(RecordingTerminator::default()),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("working_1.mp4");
        let second = dir.path().join("working_2.mp4");

        worker.submit(shrink_request(&first)).unwrap();
        worker.submit(shrink_request(&second)).unwrap();
        let replies = replies_until_terminal(&mut rx, 2).await;

        let terminals: Vec<_> = replies.iter().filter(|r| r.is_terminal()).collect();
        assert_eq!(terminals, vec![&WorkerReply::Complete, &WorkerReply::Complete]);
        // Progress restarts from the bottom only after the first request completed.
        let first_complete = replies
            .iter()
            .position(|r| *r == WorkerReply::Complete)
            .unwrap();
        assert_eq!(
            replies[first_complete - 1],
            WorkerReply::Progress { percent: 100 }
        );
        assert!(first.exists() && second.exists());
        worker.shutdown();
    }

    /// Sink whose progress delivery panics, forwarding everything else.
    struct PanickingProgressSink(UnboundedSender<WorkerReply>);

    impl ReplySink for PanickingProgressSink {
        fn send(&self, reply: WorkerReply) -> Result<()> {
            if matches!(reply, WorkerReply::Progress { .. }) {
                panic!("progress listener blew up");
            }
            ReplySink::send(&self.0, reply)
        }
    }

    #[tokio::test]
    async fn test_panic_during_shrink_is_unrecoverable_and_releases_next_request() {
        let backend = fixtures::backend_with_clip(SOURCE, 4, 133);
        let (tx, mut rx) = unbounded_channel();
        let terminator = Arc::new(RecordingTerminator::default());
        let worker = WorkerService::start(
            backend,
            params(),
            pump_config(),
            Arc::new(PanickingProgressSink(tx)),
            terminator.clone(),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();

        worker
            .submit(shrink_request(&dir.path().join("working_1.mp4")))
            .unwrap();
        worker
            .submit(shrink_request(&dir.path().join("working_2.mp4")))
            .unwrap();
        let replies = replies_until_terminal(&mut rx, 2).await;
        worker.shutdown();

        assert_eq!(replies.len(), 2);
        for reply in &replies {
            let WorkerReply::UnrecoverableError { error } = reply else {
                panic!("expected an unrecoverable error, got {:?}", reply);
            };
            assert!(error.message.contains("progress listener blew up"));
        }
        assert_eq!(terminator.count(), 2);
    }

    #[test]
    fn test_bad_params_fail_to_start() {
        let (tx, _rx) = unbounded_channel();
        let result = WorkerService::start(
            Arc::new(fixtures::working_backend()),
            BindParams::new(650, 1_000_000, 128_000),
            pump_config(),
            Arc::new(tx),
            Arc::new(RecordingTerminator::default()),
        );
        assert!(matches!(result, Err(ShrinkError::InvalidConfig(_))));
    }
}
