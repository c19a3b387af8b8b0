//! Scripted worker binding for queue tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::lock;
use crate::error::{Result, ShrinkError};
use crate::protocol::{BindParams, WorkerReply, WorkerRequest};
use crate::queue::{ConnectionEvents, WorkerBinder};

#[derive(Default)]
struct BinderInner {
    binds: Vec<BindParams>,
    unbinds: usize,
    fail_binds: Option<String>,
    unbinding_checks: usize,
    events: Option<ConnectionEvents>,
}

/// Binder that connects at once and hands every request to the test.
///
/// Tests play the worker: they read requests from the receiver returned by
/// [`MockBinder::new`] and answer through [`MockBinder::reply`].
pub struct MockBinder {
    inner: Mutex<BinderInner>,
    requests: UnboundedSender<WorkerRequest>,
}

impl MockBinder {
    pub fn new() -> (Self, UnboundedReceiver<WorkerRequest>) {
        let (requests, rx) = unbounded_channel();
        let binder = Self {
            inner: Mutex::new(BinderInner::default()),
            requests,
        };
        (binder, rx)
    }

    /// Makes every following bind fail with `reason`.
    pub fn fail_binds(&self, reason: &str) {
        lock(&self.inner).fail_binds = Some(reason.to_string());
    }

    /// Reports a previous worker as still shutting down for the next
    /// `checks` calls of `is_unbinding`.
    pub fn set_unbinding_for(&self, checks: usize) {
        lock(&self.inner).unbinding_checks = checks;
    }

    pub fn bind_count(&self) -> usize {
        lock(&self.inner).binds.len()
    }

    pub fn bound_params(&self) -> Vec<BindParams> {
        lock(&self.inner).binds.clone()
    }

    pub fn unbind_count(&self) -> usize {
        lock(&self.inner).unbinds
    }

    /// Answers as the current worker.
    pub fn reply(&self, reply: WorkerReply) -> Result<()> {
        self.events()?.reply(reply)
    }

    /// Simulates the worker process dying.
    pub fn disconnect(&self) -> Result<()> {
        self.events()?.disconnected()
    }

    fn events(&self) -> Result<ConnectionEvents> {
        lock(&self.inner)
            .events
            .clone()
            .ok_or_else(|| ShrinkError::Bind("never bound".to_string()))
    }
}

#[async_trait]
impl WorkerBinder for MockBinder {
    async fn bind(&self, params: &BindParams, events: ConnectionEvents) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.binds.push(params.clone());
        if let Some(reason) = &inner.fail_binds {
            return Err(ShrinkError::Bind(reason.clone()));
        }
        events.connected(self.requests.clone())?;
        inner.events = Some(events);
        Ok(())
    }

    async fn unbind(&self) {
        lock(&self.inner).unbinds += 1;
    }

    fn is_unbinding(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.unbinding_checks > 0 {
            inner.unbinding_checks -= 1;
            return true;
        }
        false
    }
}
