//! The queue's state machine.
//!
//! All queue state lives in [`QueueActor`] and is only touched from its
//! `run` loop. Callers, bindings and timers talk to it through the mailbox.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::binder::{ConnectionEvent, ConnectionEvents, WorkerBinder};
use super::config::QueueConfig;
use super::workspace::remove_working_file;
use crate::error::{Result, ShrinkError};
use crate::protocol::{BindParams, WorkerReply, WorkerRequest};
use crate::reencode::ProgressListener;

/// A submitted shrink waiting for its terminal reply.
pub(crate) struct Job {
    pub id: Uuid,
    pub source: String,
    pub destination: PathBuf,
    pub working_file: PathBuf,
    pub submitted_at: DateTime<Utc>,
    pub on_progress: Option<ProgressListener>,
    pub outcome: oneshot::Sender<Result<u64>>,
}

impl Job {
    fn request(&self) -> WorkerRequest {
        WorkerRequest::Shrink {
            source: self.source.clone(),
            output_path: self.working_file.clone(),
        }
    }

    async fn finish(self, result: Result<u64>) {
        remove_working_file(&self.working_file).await;
        let elapsed = Utc::now() - self.submitted_at;
        match &result {
            Ok(size) => info!(
                "Job {} finished: {} bytes in {}ms",
                self.id,
                size,
                elapsed.num_milliseconds()
            ),
            Err(e) => warn!(
                "Job {} failed after {}ms: {}",
                self.id,
                elapsed.num_milliseconds(),
                e
            ),
        }
        if self.outcome.send(result).is_err() {
            debug!("caller of job {} is gone", self.id);
        }
    }
}

pub(crate) enum QueueMessage {
    Submit(Job),
    Connection { binding: u64, event: ConnectionEvent },
    RetryRebind,
    IdleUnbind { epoch: u64 },
}

enum Connection {
    Unbound,
    Binding {
        binding: u64,
    },
    Connected {
        binding: u64,
        requests: UnboundedSender<WorkerRequest>,
    },
}

impl Connection {
    fn binding(&self) -> Option<u64> {
        match self {
            Self::Unbound => None,
            Self::Binding { binding } | Self::Connected { binding, .. } => Some(*binding),
        }
    }
}

/// Owns the FIFO of jobs and the worker binding.
pub struct QueueActor {
    config: QueueConfig,
    params: BindParams,
    binder: Arc<dyn WorkerBinder>,
    mailbox: UnboundedReceiver<QueueMessage>,
    mailbox_tx: WeakUnboundedSender<QueueMessage>,
    jobs: VecDeque<Job>,
    connection: Connection,
    next_binding: u64,
    idle_epoch: u64,
}

impl QueueActor {
    pub(crate) fn new(
        config: QueueConfig,
        params: BindParams,
        binder: Arc<dyn WorkerBinder>,
        mailbox: UnboundedReceiver<QueueMessage>,
        mailbox_tx: WeakUnboundedSender<QueueMessage>,
    ) -> Self {
        Self {
            config,
            params,
            binder,
            mailbox,
            mailbox_tx,
            jobs: VecDeque::new(),
            connection: Connection::Unbound,
            next_binding: 0,
            idle_epoch: 0,
        }
    }

    /// Processes messages until every queue handle is dropped.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!("Shrink queue started");

        while let Some(message) = self.mailbox.recv().await {
            match message {
                QueueMessage::Submit(job) => self.on_submit(job).await,
                QueueMessage::Connection { binding, event } => {
                    if self.connection.binding() != Some(binding) {
                        debug!("drop event of stale binding {}", binding);
                        continue;
                    }
                    match event {
                        ConnectionEvent::Connected(requests) => self.on_connected(binding, requests),
                        ConnectionEvent::Disconnected => self.on_disconnected().await,
                        ConnectionEvent::Reply(reply) => self.on_reply(reply).await,
                    }
                }
                QueueMessage::RetryRebind => self.rebind_if_queue_is_not_empty().await,
                QueueMessage::IdleUnbind { epoch } => {
                    if epoch == self.idle_epoch {
                        self.unbind_if_queue_is_empty().await;
                    }
                }
            }
        }

        for job in std::mem::take(&mut self.jobs) {
            job.finish(Err(ShrinkError::QueueClosed)).await;
        }
        if self.connection.binding().is_some() {
            self.binder.unbind().await;
        }
        info!("Shrink queue shutting down");
    }

    async fn on_submit(&mut self, job: Job) {
        if self.binder.is_unbinding() {
            debug!("worker is unbinding. retry job {} later", job.id);
            self.post_delayed(self.config.bind_retry_delay(), QueueMessage::Submit(job));
            return;
        }

        if let Err(e) = self.bind().await {
            error!("Failed to bind worker: {}", e);
            job.finish(Err(e)).await;
            return;
        }

        debug!("queued job {} ({})", job.id, job.source);
        if let Connection::Connected { requests, .. } = &self.connection {
            if requests.send(job.request()).is_err() {
                // The disconnect that follows recovers the queue.
                error!("Failed to send request for job {}", job.id);
            }
        }
        self.jobs.push_back(job);
    }

    fn on_connected(&mut self, binding: u64, requests: UnboundedSender<WorkerRequest>) {
        info!("Worker connected. sending {} requests", self.jobs.len());
        for job in &self.jobs {
            if requests.send(job.request()).is_err() {
                error!("Failed to send request for job {}", job.id);
                break;
            }
        }
        self.connection = Connection::Connected { binding, requests };
    }

    async fn on_disconnected(&mut self) {
        error!("Worker disconnected");
        self.connection = Connection::Unbound;
        if let Some(job) = self.jobs.pop_front() {
            job.finish(Err(ShrinkError::ProcessKilled)).await;
        }
        self.rebind_if_queue_is_not_empty().await;
    }

    async fn on_reply(&mut self, reply: WorkerReply) {
        if let WorkerReply::Progress { percent } = reply {
            match self.jobs.front() {
                Some(Job {
                    on_progress: Some(listener),
                    ..
                }) => listener(percent),
                Some(_) => {}
                None => warn!("progress without a queued job"),
            }
            return;
        }

        let Some(job) = self.jobs.pop_front() else {
            warn!("reply without a queued job: {:?}", reply);
            return;
        };
        match reply {
            WorkerReply::Complete => {
                let copied = tokio::fs::copy(&job.working_file, &job.destination)
                    .await
                    .map_err(|e| {
                        error!(
                            "Failed to copy {} to {}: {}",
                            job.working_file.display(),
                            job.destination.display(),
                            e
                        );
                        ShrinkError::Io(e)
                    });
                job.finish(copied).await;
                self.schedule_idle_unbind();
            }
            WorkerReply::RecoverableError { error } => {
                job.finish(Err(error.into_error(true))).await;
                self.schedule_idle_unbind();
            }
            WorkerReply::UnrecoverableError { error } => {
                job.finish(Err(error.into_error(false))).await;
                // The worker terminates itself.
                self.unbind_if_queue_is_empty().await;
            }
            WorkerReply::Progress { .. } => {}
        }
    }

    async fn bind(&mut self) -> Result<()> {
        if self.connection.binding().is_some() {
            return Ok(());
        }
        self.next_binding += 1;
        let binding = self.next_binding;
        debug!("bind worker. binding: {}", binding);
        let events = ConnectionEvents::new(binding, self.mailbox_tx.clone());
        self.binder.bind(&self.params, events).await?;
        self.connection = Connection::Binding { binding };
        Ok(())
    }

    async fn rebind_if_queue_is_not_empty(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        if self.binder.is_unbinding() {
            self.post_delayed(self.config.bind_retry_delay(), QueueMessage::RetryRebind);
            return;
        }
        if let Err(e) = self.bind().await {
            error!("Failed to rebind worker: {}", e);
            let message = match e {
                ShrinkError::Bind(message) => message,
                other => other.to_string(),
            };
            for job in std::mem::take(&mut self.jobs) {
                job.finish(Err(ShrinkError::Bind(message.clone()))).await;
            }
        }
    }

    async fn unbind_if_queue_is_empty(&mut self) {
        if self.connection.binding().is_some() && self.jobs.is_empty() {
            debug!("unbind worker");
            self.connection = Connection::Unbound;
            self.binder.unbind().await;
        }
    }

    /// Unbinds after the idle delay unless another job or reply comes first.
    fn schedule_idle_unbind(&mut self) {
        self.idle_epoch += 1;
        let epoch = self.idle_epoch;
        self.post_delayed(
            self.config.idle_unbind_delay(),
            QueueMessage::IdleUnbind { epoch },
        );
    }

    fn post_delayed(&self, delay: Duration, message: QueueMessage) {
        let mailbox = self.mailbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(mailbox) = mailbox.upgrade() {
                // A closed mailbox drops the message, failing any job in it.
                let _ = mailbox.send(message);
            }
        });
    }
}
