use super::{CorrelatorConfig, pending::PendingTable};
use crate::{
    broker::{Broker, BrokerError, Channel, Delivery, DeliveryStream},
    telemetry,
};
use futures::StreamExt;
use sentiment_core::{Error, envelope::ResultEnvelope, types::RequestId};
use std::sync::Arc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What happened to one inbound result payload.
#[derive(Debug, PartialEq)]
pub(crate) enum Resolution {
    Completed(RequestId),
    /// No task was pending under this id: a duplicate, or a result for an
    /// evicted task.
    Unmatched(RequestId),
    Malformed(Error),
}

/// Matches one result payload against the pending table.
pub(crate) fn resolve(pending: &PendingTable, payload: &[u8]) -> Resolution {
    let envelope = match ResultEnvelope::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => return Resolution::Malformed(e),
    };
    let request_id = envelope.request_id.clone();
    let Some(task) = pending.take(&request_id) else {
        return Resolution::Unmatched(request_id);
    };

    let outcome = envelope.into_result(task.text().to_string());
    if !task.complete(outcome) {
        tracing::debug!("Caller for {request_id} is gone; result dropped");
    }
    Resolution::Completed(request_id)
}

/// Background loop draining the result channel.
pub(crate) struct ResultConsumer {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) config: CorrelatorConfig,
    pub(crate) shutdown: CancellationToken,
}

impl ResultConsumer {
    pub(crate) async fn run(self) {
        tracing::debug!("Result consumer started");
        let mut sweep = tokio::time::interval(self.config.eviction_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'subscription: loop {
            let Some(subscribed) = self.subscribe(&mut sweep).await else {
                break;
            };
            let mut deliveries = match subscribed {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    tracing::warn!("Failed to subscribe to results: {e}");
                    if self.pause(&mut sweep).await {
                        break 'subscription;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => break 'subscription,
                    _ = sweep.tick() => self.evict_expired(),
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => self.handle(delivery).await,
                        Some(Err(e)) => tracing::warn!("Result delivery failed: {e}"),
                        None => {
                            tracing::warn!("Result subscription ended; re-subscribing");
                            break;
                        }
                    },
                }
            }

            if self.pause(&mut sweep).await {
                break;
            }
        }

        tracing::debug!("Result consumer stopped");
    }

    /// Subscribes to the result channel, sweeping meanwhile. Returns `None` if
    /// shut down first.
    async fn subscribe(
        &self,
        sweep: &mut Interval,
    ) -> Option<Result<DeliveryStream, BrokerError>> {
        let subscribing = self.broker.subscribe(Channel::Results);
        tokio::pin!(subscribing);
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return None,
                _ = sweep.tick() => self.evict_expired(),
                subscribed = &mut subscribing => return Some(subscribed),
            }
        }
    }

    /// Waits before re-subscribing, sweeping meanwhile. Returns `true` if shut
    /// down first.
    async fn pause(&self, sweep: &mut Interval) -> bool {
        let resume = tokio::time::sleep(self.config.resubscribe_delay);
        tokio::pin!(resume);
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return true,
                _ = sweep.tick() => self.evict_expired(),
                () = &mut resume => return false,
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        match resolve(&self.pending, delivery.payload()) {
            Resolution::Completed(request_id) => {
                tracing::debug!("Resolved {request_id}");
            }
            Resolution::Unmatched(request_id) => {
                tracing::debug!("No pending task for {request_id}; ignoring");
            }
            Resolution::Malformed(e) => {
                telemetry::increment_malformed_envelopes();
                tracing::warn!("Discarding result: {e}");
            }
        }
        // Settled in every case so a bad payload is not redelivered forever.
        if let Err(e) = delivery.ack().await {
            tracing::warn!("{e}");
        }
    }

    fn evict_expired(&self) {
        let expired = self
            .pending
            .evict_expired(Instant::now(), self.config.task_timeout);
        for (request_id, task) in expired {
            telemetry::increment_tasks_evicted();
            tracing::warn!(
                "No result for {request_id} within {:?}; evicting",
                self.config.task_timeout
            );
            task.complete(Err(Error::Timeout));
        }
    }
}
