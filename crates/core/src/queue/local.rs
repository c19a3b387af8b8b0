//! Binder hosting the worker inside the current process.
//!
//! Useful where spawning a worker process is not possible. A crash of the
//! platform codecs takes the host down with it, and an unrecoverable error
//! only retires the in-process worker instead of killing the process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::binder::{ConnectionEvents, WorkerBinder};
use crate::error::{Result, ShrinkError};
use crate::media::MediaBackend;
use crate::protocol::{BindParams, WorkerReply, WorkerRequest};
use crate::reencode::{PumpConfig, Terminator};
use crate::worker::{ReplySink, WorkerService};

struct EventReplySink(ConnectionEvents);

impl ReplySink for EventReplySink {
    fn send(&self, reply: WorkerReply) -> Result<()> {
        self.0.reply(reply)
    }
}

/// Retires the in-process worker and reports the disconnect.
struct RetiringTerminator {
    events: ConnectionEvents,
    retired: Arc<AtomicBool>,
}

impl Terminator for RetiringTerminator {
    fn terminate(&self, reason: &str) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Retiring in-process worker: {}", reason);
        if let Err(e) = self.events.disconnected() {
            debug!("queue is gone: {}", e);
        }
    }
}

/// Runs a [`WorkerService`] on threads of the current process.
pub struct LocalBinder {
    backend: Arc<dyn MediaBackend>,
    pump_config: PumpConfig,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    /// Workers whose threads are still alive, the bound one included.
    running: Arc<AtomicUsize>,
}

impl LocalBinder {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            pump_config: PumpConfig::default(),
            stop: Mutex::new(None),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_pump_config(mut self, config: PumpConfig) -> Self {
        self.pump_config = config;
        self
    }
}

#[async_trait]
impl WorkerBinder for LocalBinder {
    async fn bind(&self, params: &BindParams, events: ConnectionEvents) -> Result<()> {
        let retired = Arc::new(AtomicBool::new(false));
        let worker = WorkerService::start(
            Arc::clone(&self.backend),
            params.clone(),
            self.pump_config.clone(),
            Arc::new(EventReplySink(events.clone())),
            Arc::new(RetiringTerminator {
                events: events.clone(),
                retired: Arc::clone(&retired),
            }),
        )
        .map_err(|e| ShrinkError::Bind(e.to_string()))?;

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        if let Some(previous) = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stop_tx)
        {
            warn!("Binding over a live in-process worker");
            let _ = previous.send(());
        }

        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok(()) = &mut stop_rx => break,
                    request = request_rx.recv() => {
                        let Some(request) = request else { break };
                        if retired.load(Ordering::SeqCst) {
                            warn!("Dropping request sent to a retired worker");
                            continue;
                        }
                        if let Err(e) = worker.submit(request) {
                            error!("Failed to hand request to worker: {}", e);
                        }
                    }
                }
            }
            // The current job runs to completion before the worker is gone.
            if tokio::task::spawn_blocking(move || worker.shutdown())
                .await
                .is_err()
            {
                error!("In-process worker shutdown panicked");
            }
            running.fetch_sub(1, Ordering::SeqCst);
            debug!("in-process worker stopped");
        });

        events.connected(request_tx)
    }

    async fn unbind(&self) {
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
    }

    fn is_unbinding(&self) -> bool {
        let bound = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        self.running.load(Ordering::SeqCst) > usize::from(bound)
    }
}
