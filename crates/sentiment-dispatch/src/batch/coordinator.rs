use super::{BatchResult, job::BatchJob};
use crate::{
    context::CallContext,
    dispatch::{AnalyzeOptions, analyze_one},
    store::{BATCH_ID_KEY, BatchStatus, Metadata, ResultRecorder},
    telemetry,
    transport::Transport,
};
use core::time::Duration;
use futures::StreamExt;
use sentiment_core::{
    Error, Result,
    types::{AnalysisResult, BatchId},
};
use std::sync::Arc;
use tokio::time::Instant;

/// Streams a batch to the engine and reassembles the answers in input order.
///
/// Items the stream does not answer (because it could not be opened, a send
/// failed, or it broke or ended early) are resolved one by one over the unary
/// call, with at most `fallback_concurrency` calls in flight.
pub struct BatchCoordinator {
    transport: Arc<dyn Transport>,
    recorder: Option<ResultRecorder>,
    fallback_concurrency: usize,
}

impl BatchCoordinator {
    pub fn new(transport: Arc<dyn Transport>, fallback_concurrency: usize) -> Self {
        Self {
            transport,
            recorder: None,
            fallback_concurrency: fallback_concurrency.max(1),
        }
    }

    /// Persists every batch run with `store_result` set through `recorder`.
    pub fn set_recorder(&mut self, recorder: ResultRecorder) {
        self.recorder = Some(recorder);
    }

    /// Classifies every text, returning one outcome per input in input order.
    ///
    /// Stream unavailability never fails the batch; a failed fallback call
    /// fills only its own slot with the error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `ctx` is cancelled.
    #[tracing::instrument(skip_all, fields(batch_id = tracing::field::Empty, items = texts.len()))]
    pub async fn analyze_batch(
        &self,
        texts: Vec<String>,
        language: &str,
        options: &AnalyzeOptions,
        ctx: &CallContext,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let mut job = BatchJob::new(texts);
        tracing::Span::current().record("batch_id", tracing::field::display(job.batch_id()));

        let recorder = self.recorder.as_ref().filter(|_| options.store_result);
        if let Some(recorder) = recorder {
            recorder
                .open_batch(job.batch_id(), job.len(), &options.metadata)
                .await;
        }

        let streamed = ctx
            .run(self.stream_pass(&mut job, language, ctx.timeout()))
            .await;
        // An engine-side `Cancelled` is a broken stream, not a cancelled batch.
        match streamed {
            Ok(()) => {}
            Err(_) if ctx.is_cancelled() => return self.abandon(recorder, job.batch_id()).await,
            Err(e) => {
                let answered = job.len() - job.unanswered().len();
                tracing::warn!(
                    "Batch stream failed with {answered} of {} answered: {e}",
                    job.len()
                );
            }
        }

        let unanswered = job.unanswered();
        let fallback_count = unanswered.len();
        if fallback_count > 0 {
            telemetry::increment_batch_fallbacks(fallback_count as u64);
            tracing::info!("Resolving {fallback_count} items individually");

            let outcomes: Vec<(usize, Result<AnalysisResult>)> = futures::stream::iter(unanswered)
                .map(|i| {
                    let (text, request_id) = job.item(i);
                    let (text, request_id) = (text.to_string(), request_id.clone());
                    let transport = self.transport.as_ref();
                    async move {
                        let outcome = analyze_one(transport, text, request_id, language, ctx).await;
                        (i, outcome)
                    }
                })
                .buffered(self.fallback_concurrency)
                .collect()
                .await;

            if ctx.is_cancelled() {
                return self.abandon(recorder, job.batch_id()).await;
            }
            for (i, outcome) in outcomes {
                if let Err(e) = &outcome {
                    tracing::warn!("Fallback for item {i} failed: {e}");
                }
                job.settle(i, outcome);
            }
        }

        let batch_id = job.batch_id().clone();
        let items = job.into_outcomes();
        if let Some(recorder) = recorder {
            persist(recorder, &batch_id, &items, language, &options.metadata).await;
        }

        telemetry::record_batch_duration(started.elapsed().as_secs_f64() * 1000.0);
        Ok(BatchResult {
            batch_id,
            items,
            fallback_count,
        })
    }

    async fn stream_pass(
        &self,
        job: &mut BatchJob,
        language: &str,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let mut stream = self.transport.open_batch_stream(deadline).await?;

        let requests: Vec<_> = job.requests(language).collect();
        for request in requests {
            stream.send(request).await?;
        }
        stream.close_send().await?;

        let expected = job.len();
        let mut received = 0;
        while received < expected && !job.is_complete() {
            match stream.recv().await? {
                Some(response) => {
                    received += 1;
                    job.accept(response);
                }
                None => {
                    tracing::warn!("Batch stream ended after {received} of {expected} responses");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        recorder: Option<&ResultRecorder>,
        batch_id: &BatchId,
    ) -> Result<BatchResult> {
        tracing::info!("Batch {batch_id} cancelled");
        if let Some(recorder) = recorder {
            recorder.close_batch(batch_id, &[], BatchStatus::Failed).await;
        }
        Err(Error::Cancelled)
    }
}

async fn persist(
    recorder: &ResultRecorder,
    batch_id: &BatchId,
    items: &[Result<AnalysisResult>],
    language: &str,
    metadata: &Metadata,
) {
    let mut metadata = metadata.clone();
    metadata.insert(BATCH_ID_KEY.to_string(), batch_id.to_string());

    let mut analysis_ids = Vec::with_capacity(items.len());
    for result in items.iter().flatten() {
        if let Some(id) = recorder.record(result, language, &metadata).await {
            analysis_ids.push(id);
        }
    }

    let resolved = items.iter().filter(|outcome| outcome.is_ok()).count();
    let status = BatchStatus::from_counts(resolved, items.len());
    recorder.close_batch(batch_id, &analysis_ids, status).await;
}
