//! Child side of the worker process boundary.
//!
//! The parent talks JSON lines over stdin/stdout:
//!
//! ```text
//! parent ─► {"width":640,"video_bitrate":1000000,"audio_bitrate":128000,"duration_limit_secs":60}
//! parent ─► {"type":"shrink","source":"content://media/1","output_path":"/work/working_x.mp4"}
//! child  ─► {"type":"progress","percent":10}
//! child  ─► {"type":"complete"}
//! ```
//!
//! The first line binds the worker. Every following line is a request.
//! Closing stdin unbinds: the current request finishes and the worker exits.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use mediashrink_core::{
    BindParams, MediaBackend, PumpConfig, ReplySink, ShrinkError, Terminator, WorkerReply,
    WorkerRequest, WorkerService,
};

/// How long a terminating worker waits for its last replies to be written.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum Outgoing {
    Reply(WorkerReply),
    Terminate {
        reason: String,
        flushed: std_mpsc::Sender<()>,
    },
}

struct LineReplySink(mpsc::UnboundedSender<Outgoing>);

impl ReplySink for LineReplySink {
    fn send(&self, reply: WorkerReply) -> mediashrink_core::Result<()> {
        self.0
            .send(Outgoing::Reply(reply))
            .map_err(|_| ShrinkError::Send("reply writer is gone".to_string()))
    }
}

/// Writes pending replies before handing over to the real terminator, so
/// the parent sees the unrecoverable error before the disconnect.
struct FlushingTerminator(mpsc::UnboundedSender<Outgoing>);

impl Terminator for FlushingTerminator {
    fn terminate(&self, reason: &str) {
        let (flushed, wait) = std_mpsc::channel();
        let request = Outgoing::Terminate {
            reason: reason.to_string(),
            flushed,
        };
        if self.0.send(request).is_err() {
            error!("Reply writer is gone, cannot terminate cleanly");
            return;
        }
        if wait.recv_timeout(FLUSH_TIMEOUT).is_err() {
            warn!("Timed out flushing replies before termination");
        }
    }
}

async fn write_replies<W>(
    mut output: W,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    terminator: Arc<dyn Terminator>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        match message {
            Outgoing::Reply(reply) => {
                let mut line = serde_json::to_string(&reply)?;
                line.push('\n');
                output.write_all(line.as_bytes()).await?;
                output.flush().await?;
            }
            Outgoing::Terminate { reason, flushed } => {
                output.flush().await?;
                terminator.terminate(&reason);
                let _ = flushed.send(());
            }
        }
    }
    output.shutdown().await?;
    Ok(())
}

/// Serves one binding until `input` closes.
///
/// `terminator` ends the process on unrecoverable errors, after every reply
/// sent so far has reached `output`.
pub async fn serve<R, W>(
    backend: Arc<dyn MediaBackend>,
    pump_config: PumpConfig,
    input: R,
    output: W,
    terminator: Arc<dyn Terminator>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = input.lines();
    let bind_line = lines
        .next_line()
        .await
        .context("Failed to read bind parameters")?
        .context("Input closed before bind parameters")?;
    let params: BindParams =
        serde_json::from_str(&bind_line).context("Invalid bind parameters")?;
    info!("Binding worker: {:?}", params);

    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_replies(output, outgoing_rx, terminator));
    let worker = WorkerService::start(
        backend,
        params,
        pump_config,
        Arc::new(LineReplySink(outgoing_tx.clone())),
        Arc::new(FlushingTerminator(outgoing_tx)),
    )
    .context("Failed to start worker")?;

    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => {
                debug!("received request: {:?}", request);
                worker.submit(request).context("Worker stopped")?;
            }
            Err(e) => error!("Dropping malformed request {:?}: {}", line, e),
        }
    }

    info!("Input closed, unbinding worker");
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("Worker shutdown panicked")?;
    writer.await.context("Reply writer panicked")?
}

/// Serves one binding on the process's stdin and stdout.
pub async fn serve_stdio(backend: Arc<dyn MediaBackend>, pump_config: PumpConfig) -> Result<()> {
    serve(
        backend,
        pump_config,
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        Arc::new(mediashrink_core::reencode::ProcessTerminator),
    )
    .await
}
