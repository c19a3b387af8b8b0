//! Seam between the queue and whatever hosts the worker.

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};

use super::actor::QueueMessage;
use crate::error::{Result, ShrinkError};
use crate::protocol::{BindParams, WorkerReply, WorkerRequest};

/// What a binding reports back to the queue.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The worker is ready. Requests go into the sender, in order.
    Connected(UnboundedSender<WorkerRequest>),
    /// The worker went away.
    Disconnected,
    /// Reply for the request the worker is processing.
    Reply(WorkerReply),
}

/// Delivers events of one binding to the queue.
///
/// Events of a binding the queue has since replaced are dropped.
#[derive(Clone)]
pub struct ConnectionEvents {
    binding: u64,
    mailbox: WeakUnboundedSender<QueueMessage>,
}

impl ConnectionEvents {
    pub(crate) fn new(binding: u64, mailbox: WeakUnboundedSender<QueueMessage>) -> Self {
        Self { binding, mailbox }
    }

    pub fn connected(&self, requests: UnboundedSender<WorkerRequest>) -> Result<()> {
        self.send(ConnectionEvent::Connected(requests))
    }

    pub fn disconnected(&self) -> Result<()> {
        self.send(ConnectionEvent::Disconnected)
    }

    pub fn reply(&self, reply: WorkerReply) -> Result<()> {
        self.send(ConnectionEvent::Reply(reply))
    }

    fn send(&self, event: ConnectionEvent) -> Result<()> {
        let mailbox = self.mailbox.upgrade().ok_or(ShrinkError::QueueClosed)?;
        mailbox
            .send(QueueMessage::Connection {
                binding: self.binding,
                event,
            })
            .map_err(|_| ShrinkError::QueueClosed)
    }
}

/// Starts and stops workers for the queue.
#[async_trait]
pub trait WorkerBinder: Send + Sync {
    /// Starts a worker bound with `params`.
    ///
    /// Returns once the attempt is under way. `Connected` follows on
    /// `events` when the worker can take requests, `Disconnected` when it
    /// dies. An error means no worker will come.
    async fn bind(&self, params: &BindParams, events: ConnectionEvents) -> Result<()>;

    /// Releases the current worker. It may keep shutting down afterwards.
    async fn unbind(&self);

    /// Whether a released worker is still shutting down.
    fn is_unbinding(&self) -> bool;
}
