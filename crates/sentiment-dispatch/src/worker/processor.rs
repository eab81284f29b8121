use crate::{
    broker::{Broker, Channel, Delivery},
    context::CallContext,
    dispatch::analyze_one,
    telemetry,
    transport::Transport,
};
use core::time::Duration;
use sentiment_core::{
    Error, Result,
    envelope::{ResultEnvelope, TaskEnvelope},
};
use std::sync::Arc;

/// Outcome of one task delivery.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Processed {
    Published,
    /// Permanently unprocessable; acknowledged and dropped.
    Discarded,
    /// Left unacknowledged so the broker redelivers it.
    Deferred,
}

/// Resolves task envelopes into result envelopes.
#[derive(Clone)]
pub(crate) struct TaskProcessor {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) call_timeout: Option<Duration>,
}

impl TaskProcessor {
    pub(crate) async fn process(&self, worker_id: usize, delivery: Delivery) -> Processed {
        let task = match TaskEnvelope::from_slice(delivery.payload()) {
            Ok(task) => task,
            Err(e) => {
                telemetry::increment_malformed_envelopes();
                tracing::warn!("Worker {worker_id} discarding task: {e}");
                settle(delivery).await;
                return Processed::Discarded;
            }
        };

        let payload = match self.analyze(&task).await {
            Ok(payload) => payload,
            Err(e) if is_transient(&e) => {
                tracing::warn!(
                    "Worker {worker_id} deferring {} for redelivery: {e}",
                    task.request_id
                );
                return Processed::Deferred;
            }
            Err(e) => {
                tracing::error!("Worker {worker_id} dropping {}: {e}", task.request_id);
                settle(delivery).await;
                return Processed::Discarded;
            }
        };

        if let Err(e) = self
            .broker
            .publish(Channel::Results, &task.request_id, payload.into())
            .await
        {
            tracing::warn!(
                "Worker {worker_id} failed to publish result for {}: {e}",
                task.request_id
            );
            return Processed::Deferred;
        }

        settle(delivery).await;
        tracing::debug!("Worker {worker_id} resolved {}", task.request_id);
        Processed::Published
    }

    async fn analyze(&self, task: &TaskEnvelope) -> Result<Vec<u8>> {
        let ctx = CallContext::new(self.call_timeout);
        let result = analyze_one(
            self.transport.as_ref(),
            task.text.clone(),
            task.request_id.clone(),
            &task.language,
            &ctx,
        )
        .await?;
        ResultEnvelope::from_result(&result).to_vec()
    }
}

fn is_transient(err: &Error) -> bool {
    matches!(
        err,
        Error::TransportUnavailable { .. } | Error::Timeout | Error::Cancelled
    )
}

async fn settle(delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        tracing::warn!("{e}");
    }
}
