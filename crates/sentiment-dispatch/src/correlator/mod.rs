//! Submit-and-correlate over the message broker.
//!
//! [`AsyncCorrelator::submit`] registers a pending task, publishes its
//! [`TaskEnvelope`] to the task channel, and hands back a [`Completion`] the
//! caller can await. A single background consumer drains the result channel
//! and completes pending tasks by request id; tasks that see no result within
//! [`CorrelatorConfig::task_timeout`] are evicted and complete with
//! [`Error::Timeout`].
//!
//! ## Structure
//!
//! - `pending` - the mutex-guarded pending-task table.
//! - `consumer` - the result consumption and eviction loop.

mod consumer;
mod pending;

#[cfg(test)]
mod tests;

use crate::broker::{Broker, Channel};
use consumer::ResultConsumer;
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use parking_lot::Mutex;
use pending::{PendingTable, PendingTask};
use sentiment_core::{
    Error, Result,
    envelope::TaskEnvelope,
    types::{AnalysisResult, RequestId},
};
use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// How long a task may wait for its result before eviction.
    pub task_timeout: Duration,
    /// How often pending tasks are checked for expiry.
    pub eviction_interval: Duration,
    /// Delay before re-subscribing after the result subscription is lost.
    pub resubscribe_delay: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(5),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

/// Resolves to the result of one submitted task.
///
/// Yields [`Error::Cancelled`] if the correlator shuts down first.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<AnalysisResult>>,
}

impl Completion {
    pub(crate) fn new(rx: oneshot::Receiver<Result<AnalysisResult>>) -> Self {
        Self { rx }
    }
}

impl Future for Completion {
    type Output = Result<AnalysisResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::Cancelled)))
    }
}

/// An accepted asynchronous submission.
#[derive(Debug)]
pub struct Submission {
    pub request_id: RequestId,
    pub completion: Completion,
}

pub struct AsyncCorrelator {
    broker: Arc<dyn Broker>,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncCorrelator {
    /// Creates the correlator and spawns its result consumer. Must be called
    /// within a Tokio runtime.
    pub fn start(broker: Arc<dyn Broker>, config: CorrelatorConfig) -> Self {
        let pending = Arc::new(PendingTable::default());
        let shutdown = CancellationToken::new();
        let consumer = ResultConsumer {
            broker: Arc::clone(&broker),
            pending: Arc::clone(&pending),
            config,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(consumer.run());

        Self {
            broker,
            pending,
            shutdown,
            consumer: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues `text` for analysis and returns without waiting for the
    /// result.
    ///
    /// The completion is registered before the publish is issued, so a result
    /// that arrives before the broker acknowledges the publish is not lost.
    ///
    /// # Errors
    ///
    /// - [`Error::DispatchFailed`] if the broker rejects the publish. Nothing
    ///   stays registered.
    /// - [`Error::Cancelled`] after [`shutdown`](Self::shutdown).
    #[tracing::instrument(skip(self, text), fields(request_id = tracing::field::Empty))]
    pub async fn submit(&self, text: &str, language: &str) -> Result<Submission> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request_id = RequestId::generate();
        tracing::Span::current().record("request_id", tracing::field::display(&request_id));
        let payload = TaskEnvelope::new(text, language, request_id.clone()).to_vec()?;

        let (tx, rx) = oneshot::channel();
        let registration = self
            .pending
            .register(request_id.clone(), PendingTask::new(text.to_string(), tx))?;

        self.broker
            .publish(Channel::Tasks, &request_id, payload.into())
            .await
            .map_err(|e| Error::dispatch_failed(format!("failed to publish task {request_id}: {e}")))?;
        registration.commit();

        tracing::debug!("Task published");
        Ok(Submission {
            request_id,
            completion: Completion::new(rx),
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stops the result consumer and completes every task still pending with
    /// [`Error::Cancelled`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Result consumer panicked: {e}");
            }
        }
        self.cancel_pending();
    }

    fn cancel_pending(&self) {
        let drained = self.pending.drain();
        if !drained.is_empty() {
            tracing::info!("Cancelling {} pending tasks", drained.len());
        }
        for (_, task) in drained {
            task.complete(Err(Error::Cancelled));
        }
    }
}

impl Drop for AsyncCorrelator {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.cancel_pending();
    }
}
