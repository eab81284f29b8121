//! Broker task worker.
//!
//! The consumer side of the task channel: pulls [`TaskEnvelope`]s, resolves
//! each through the engine's unary call, and publishes a result envelope on
//! the result channel for the [`AsyncCorrelator`] to pick up.
//!
//! Deliveries are handed round-robin to a fixed set of worker tasks over
//! bounded channels. Shutdown stops pulling, lets in-flight tasks finish for
//! up to [`WorkerConfig::drain_timeout`], then returns.
//!
//! [`TaskEnvelope`]: sentiment_core::envelope::TaskEnvelope
//! [`AsyncCorrelator`]: crate::correlator::AsyncCorrelator

mod processor;


use crate::{
    broker::{Broker, Channel, Delivery},
    transport::Transport,
};
use core::time::Duration;
use futures::StreamExt;
use processor::TaskProcessor;
use std::sync::Arc;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Bound on each engine call.
    pub call_timeout: Option<Duration>,
    pub resubscribe_delay: Duration,
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_timeout: Some(Duration::from_secs(30)),
            resubscribe_delay: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TaskWorker {
    broker: Arc<dyn Broker>,
    processor: TaskProcessor,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(broker: Arc<dyn Broker>, transport: Arc<dyn Transport>, config: WorkerConfig) -> Self {
        let processor = TaskProcessor {
            broker: Arc::clone(&broker),
            transport,
            call_timeout: config.call_timeout,
        };
        Self {
            broker,
            processor,
            config,
        }
    }

    /// Consumes tasks until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        let mut workers = Vec::with_capacity(concurrency);
        let mut handles = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let (tx, rx) = mpsc::channel(1);
            handles.push(tokio::spawn(worker_loop(worker_id, rx, self.processor.clone())));
            workers.push(tx);
        }
        tracing::info!("Task worker started with {concurrency} workers");

        let mut next_worker = 0;
        'subscription: loop {
            let mut deliveries = match self.broker.subscribe(Channel::Tasks).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    tracing::warn!("Failed to subscribe to tasks: {e}");
                    if self.pause(&shutdown).await {
                        break 'subscription;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break 'subscription,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            let worker_idx = next_worker % workers.len();
                            next_worker += 1;
                            if workers[worker_idx].send(delivery).await.is_err() {
                                tracing::error!("Worker {worker_idx} channel closed");
                                break 'subscription;
                            }
                        }
                        Some(Err(e)) => tracing::warn!("Task delivery failed: {e}"),
                        None => {
                            tracing::warn!("Task subscription ended; re-subscribing");
                            break;
                        }
                    },
                }
            }

            if self.pause(&shutdown).await {
                break;
            }
        }

        // === Drain: closing the channels lets each worker finish and exit ===
        tracing::info!("Draining task workers");
        drop(workers);
        match timeout(self.config.drain_timeout, futures::future::join_all(handles)).await {
            Ok(_) => tracing::info!("Task worker shut down"),
            Err(_) => tracing::warn!(
                "Task workers did not drain within {:?}",
                self.config.drain_timeout
            ),
        }
    }

    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(self.config.resubscribe_delay) => false,
        }
    }
}

async fn worker_loop(worker_id: usize, mut rx: mpsc::Receiver<Delivery>, processor: TaskProcessor) {
    tracing::trace!("Worker {worker_id} started");
    while let Some(delivery) = rx.recv().await {
        processor.process(worker_id, delivery).await;
    }
    tracing::trace!("Worker {worker_id} stopped");
}
