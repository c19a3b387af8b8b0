use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{error, info};
use uuid::Uuid;

use super::actor::{Job, QueueActor, QueueMessage};
use super::binder::WorkerBinder;
use super::config::QueueConfig;
use super::workspace::{create_working_file, remove_working_file, sweep};
use crate::error::{Result, ShrinkError};
use crate::protocol::BindParams;
use crate::reencode::ProgressListener;

/// Handle for submitting shrink jobs.
///
/// Cheaply cloneable. The queue stops once every handle is dropped.
#[derive(Clone)]
pub struct ShrinkQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    workspace_dir: PathBuf,
}

impl ShrinkQueue {
    /// Creates a queue and the actor that drives it.
    ///
    /// Leftover files in the workspace are deleted. Spawn the actor with
    /// `tokio::spawn(actor.run())`.
    pub fn new(
        config: QueueConfig,
        params: BindParams,
        binder: Arc<dyn WorkerBinder>,
    ) -> Result<(Self, QueueActor)> {
        params.validate()?;
        let swept = sweep(&config.workspace_dir)?;
        if swept > 0 {
            info!(
                "Removed {} orphaned working files from {}",
                swept,
                config.workspace_dir.display()
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            workspace_dir: config.workspace_dir.clone(),
            tx: tx.clone(),
        };
        let actor = QueueActor::new(config, params, binder, rx, tx.downgrade());
        Ok((handle, actor))
    }

    /// Creates a queue and spawns its actor on the current runtime.
    pub fn spawn(
        config: QueueConfig,
        params: BindParams,
        binder: Arc<dyn WorkerBinder>,
    ) -> Result<Self> {
        let (handle, actor) = Self::new(config, params, binder)?;
        tokio::spawn(actor.run());
        Ok(handle)
    }

    /// Shrinks `source` into `destination` and returns the output size in
    /// bytes.
    ///
    /// Jobs run one at a time in submission order. `on_progress` receives
    /// percentages while this job is the one being processed.
    pub async fn submit(
        &self,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        on_progress: Option<ProgressListener>,
    ) -> Result<u64> {
        let working_file = create_working_file(&self.workspace_dir).map_err(|e| {
            error!("Failed to create working file: {}", e);
            e
        })?;
        let (outcome, result) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: destination.into(),
            working_file,
            submitted_at: Utc::now(),
            on_progress,
            outcome,
        };

        if let Err(mpsc::error::SendError(QueueMessage::Submit(job))) =
            self.tx.send(QueueMessage::Submit(job))
        {
            remove_working_file(&job.working_file).await;
            return Err(ShrinkError::QueueClosed);
        }
        result.await.unwrap_or(Err(ShrinkError::QueueClosed))
    }
}
