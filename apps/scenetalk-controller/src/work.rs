//! Queues shared by the bridge, the resolver and the command surfaces.

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::{AdminReply, ResolveRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(PathBuf),
    Failed(String),
    /// The job was dropped before it produced a result (shutdown).
    Abandoned,
}

/// Fired exactly once by whoever finishes the job. Consuming `self` keeps a
/// second completion from compiling.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<ResolveOutcome>,
}

impl Completion {
    pub fn complete(self, outcome: ResolveOutcome) {
        // The submitter may not be waiting; that is fine.
        let _ = self.tx.send(outcome);
    }
}

#[derive(Debug)]
pub struct CompletionWaiter {
    rx: oneshot::Receiver<ResolveOutcome>,
}

impl CompletionWaiter {
    pub async fn wait(self) -> ResolveOutcome {
        self.rx.await.unwrap_or(ResolveOutcome::Abandoned)
    }
}

fn completion_pair() -> (Completion, CompletionWaiter) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, CompletionWaiter { rx })
}

#[derive(Debug)]
pub struct ResolveJob {
    pub request: ResolveRequest,
    pub completion: Completion,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} queue is closed")]
pub struct QueueClosed(&'static str);

#[derive(Debug, Clone)]
pub struct ResolveQueue {
    tx: mpsc::UnboundedSender<ResolveJob>,
}

#[derive(Debug)]
pub struct ResolveQueueReceiver {
    rx: mpsc::UnboundedReceiver<ResolveJob>,
}

pub fn resolve_queue() -> (ResolveQueue, ResolveQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResolveQueue { tx }, ResolveQueueReceiver { rx })
}

impl ResolveQueue {
    /// Enqueues a request. The returned waiter can be awaited or dropped.
    pub fn submit(&self, request: ResolveRequest) -> Result<CompletionWaiter, QueueClosed> {
        let (completion, waiter) = completion_pair();
        self.tx
            .send(ResolveJob {
                request,
                completion,
            })
            .map_err(|_| QueueClosed("resolve"))?;
        Ok(waiter)
    }
}

impl ResolveQueueReceiver {
    /// Next job, or `None` once shutdown is signalled or every sender is gone.
    pub async fn next(&mut self, shutdown: &CancellationToken) -> Option<ResolveJob> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            job = self.rx.recv() => job,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseQueue {
    tx: mpsc::UnboundedSender<AdminReply>,
}

#[derive(Debug)]
pub struct ResponseQueueReceiver {
    rx: mpsc::UnboundedReceiver<AdminReply>,
}

pub fn response_queue() -> (ResponseQueue, ResponseQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResponseQueue { tx }, ResponseQueueReceiver { rx })
}

impl ResponseQueue {
    pub fn send(&self, reply: AdminReply) -> Result<(), QueueClosed> {
        self.tx.send(reply).map_err(|_| QueueClosed("response"))
    }
}

impl ResponseQueueReceiver {
    pub async fn next(&mut self, shutdown: &CancellationToken) -> Option<AdminReply> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            reply = self.rx.recv() => reply,
        }
    }
}
