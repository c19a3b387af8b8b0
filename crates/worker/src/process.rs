//! Parent side of the worker process boundary.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use mediashrink_core::{
    BindParams, ConnectionEvents, Result, ShrinkError, WorkerBinder, WorkerProcessConfig,
    WorkerReply, WorkerRequest,
};

use crate::logging::LOG_ENV;

/// Hosts each binding in a freshly spawned worker process.
///
/// The process reads requests on stdin and writes replies on stdout (see
/// [`crate::serve`]). Unbinding closes its stdin; the process finishes the
/// current request and exits. Until it has exited the binder reports
/// itself as unbinding.
pub struct ProcessBinder {
    config: WorkerProcessConfig,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    /// Worker processes that have not exited yet, the bound one included.
    running: Arc<AtomicUsize>,
}

impl ProcessBinder {
    pub fn new(config: WorkerProcessConfig) -> Self {
        Self {
            config,
            stop: Mutex::new(None),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut command = Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(filter) = &self.config.log_filter {
            command.env(LOG_ENV, filter);
        }
        command.spawn().map_err(|e| {
            ShrinkError::Bind(format!(
                "failed to spawn {}: {}",
                self.config.executable.display(),
                e
            ))
        })
    }
}

async fn write_line(stdin: &mut ChildStdin, json: String) -> std::io::Result<()> {
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Forwards requests to the child until unbound.
async fn forward_requests(
    mut stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            request = requests.recv() => {
                let Some(request) = request else { break };
                let json = match serde_json::to_string(&request) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to encode request: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut stdin, json).await {
                    // The reader sees the process go away.
                    error!("Failed to send request to worker: {}", e);
                    break;
                }
            }
        }
    }
    debug!("closing worker stdin");
}

/// Delivers replies until the child closes stdout, then reaps it.
async fn read_replies(
    mut child: Child,
    stdout: ChildStdout,
    events: ConnectionEvents,
    running: Arc<AtomicUsize>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerReply>(&line) {
                Ok(reply) => {
                    if events.reply(reply).is_err() {
                        debug!("queue is gone, dropping reply");
                    }
                }
                Err(e) => warn!("Ignoring malformed worker output {:?}: {}", line, e),
            },
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read worker output: {}", e);
                break;
            }
        }
    }

    match child.wait().await {
        Ok(status) => info!("Worker process exited: {}", status),
        Err(e) => error!("Failed to wait for worker process: {}", e),
    }
    running.fetch_sub(1, Ordering::SeqCst);
    if events.disconnected().is_err() {
        debug!("queue is gone, dropping disconnect");
    }
}

#[async_trait]
impl WorkerBinder for ProcessBinder {
    async fn bind(&self, params: &BindParams, events: ConnectionEvents) -> Result<()> {
        let mut child = self.spawn_child()?;
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ShrinkError::Bind("worker stdio is not piped".to_string()));
        };
        self.running.fetch_add(1, Ordering::SeqCst);
        info!(
            "Spawned worker process {} (pid {:?})",
            self.config.executable.display(),
            child.id()
        );
        tokio::spawn(read_replies(
            child,
            stdout,
            events.clone(),
            Arc::clone(&self.running),
        ));

        let json = serde_json::to_string(params)
            .map_err(|e| ShrinkError::Bind(format!("failed to encode bind parameters: {}", e)))?;
        write_line(&mut stdin, json)
            .await
            .map_err(|e| ShrinkError::Bind(format!("failed to send bind parameters: {}", e)))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        if let Some(previous) = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stop_tx)
        {
            warn!("Binding over a live worker process");
            let _ = previous.send(());
        }
        tokio::spawn(forward_requests(stdin, request_rx, stop_rx));

        events.connected(request_tx)
    }

    async fn unbind(&self) {
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            debug!("unbinding worker process");
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
