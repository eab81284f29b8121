//! Single entry point for the three delivery modes.
//!
//! [`Dispatcher`] validates input and forwards to the transport (analyze
//! now), the [`AsyncCorrelator`] (analyze later), or the
//! [`BatchCoordinator`] (analyze many). It holds no correlation state of its
//! own.


use crate::{
    batch::{BatchCoordinator, BatchResult},
    context::CallContext,
    correlator::{AsyncCorrelator, Completion, Submission},
    store::{AnalysisStore, Metadata, ResultRecorder},
    telemetry,
    transport::Transport,
};
use sentiment_core::{
    Error, Result,
    proto::SentimentRequest,
    types::{AnalysisResult, RequestId},
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Per-call persistence options.
#[derive(Clone, Debug, Default)]
pub struct AnalyzeOptions {
    /// Hand each produced result to the configured store.
    pub store_result: bool,
    pub metadata: Metadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_batch_size: usize,
    pub fallback_concurrency: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            fallback_concurrency: 4,
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    correlator: Option<Arc<AsyncCorrelator>>,
    batches: BatchCoordinator,
    recorder: Option<ResultRecorder>,
    limits: DispatchLimits,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, limits: DispatchLimits) -> Self {
        let batches = BatchCoordinator::new(Arc::clone(&transport), limits.fallback_concurrency);
        Self {
            transport,
            correlator: None,
            batches,
            recorder: None,
            limits,
        }
    }

    /// Enables [`analyze_async`](Self::analyze_async).
    #[must_use]
    pub fn with_correlator(mut self, correlator: Arc<AsyncCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn AnalysisStore>) -> Self {
        let recorder = ResultRecorder::new(store);
        self.batches.set_recorder(recorder.clone());
        self.recorder = Some(recorder);
        self
    }

    /// Classifies `text` with one unary call.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `text` is empty. The engine is not
    ///   called.
    /// - Any transport error, unchanged.
    #[tracing::instrument(skip_all, fields(mode = "sync"))]
    pub async fn analyze_sync(
        &self,
        text: &str,
        language: &str,
        options: &AnalyzeOptions,
        ctx: &CallContext,
    ) -> Result<AnalysisResult> {
        validate_text(text)?;
        telemetry::increment_requests("sync");

        let result = analyze_one(
            self.transport.as_ref(),
            text.to_string(),
            RequestId::generate(),
            language,
            ctx,
        )
        .await?;

        if let Some(recorder) = self.recorder.as_ref().filter(|_| options.store_result) {
            recorder.record(&result, language, &options.metadata).await;
        }
        Ok(result)
    }

    /// Submits `text` through the broker and returns as soon as the task is
    /// published.
    ///
    /// When `options.store_result` is set, the result is stored before it is
    /// handed to the returned [`Completion`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `text` is empty. Nothing is published.
    /// - [`Error::DispatchFailed`] if no broker is configured or the publish
    ///   fails.
    #[tracing::instrument(skip_all, fields(mode = "async"))]
    pub async fn analyze_async(
        &self,
        text: &str,
        language: &str,
        options: &AnalyzeOptions,
        ctx: &CallContext,
    ) -> Result<Submission> {
        validate_text(text)?;
        let correlator = self
            .correlator
            .as_ref()
            .ok_or_else(|| Error::dispatch_failed("no message broker configured"))?;
        telemetry::increment_requests("async");

        let submission = ctx.run(correlator.submit(text, language)).await?;

        let Some(recorder) = self.recorder.clone().filter(|_| options.store_result) else {
            return Ok(submission);
        };

        let Submission {
            request_id,
            completion,
        } = submission;
        let (tx, rx) = oneshot::channel();
        let language = language.to_string();
        let metadata = options.metadata.clone();
        tokio::spawn(async move {
            let outcome = completion.await;
            if let Ok(result) = &outcome {
                recorder.record(result, &language, &metadata).await;
            }
            let _ = tx.send(outcome);
        });

        Ok(Submission {
            request_id,
            completion: Completion::new(rx),
        })
    }

    /// Classifies every text, one outcome per input, in input order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `texts` is empty, holds an empty text,
    ///   or exceeds the configured maximum batch size. The engine is not
    ///   called.
    /// - [`Error::Cancelled`] if `ctx` is cancelled.
    #[tracing::instrument(skip_all, fields(mode = "batch"))]
    pub async fn analyze_batch(
        &self,
        texts: Vec<String>,
        language: &str,
        options: &AnalyzeOptions,
        ctx: &CallContext,
    ) -> Result<BatchResult> {
        validate_batch(&texts, self.limits.max_batch_size)?;
        telemetry::increment_requests("batch");
        self.batches.analyze_batch(texts, language, options, ctx).await
    }

    /// Shuts the correlator down, cancelling every pending async task.
    pub async fn shutdown(&self) {
        if let Some(correlator) = &self.correlator {
            correlator.shutdown().await;
        }
    }
}

/// One unary round-trip for `text`, tagged with `request_id`.
pub(crate) async fn analyze_one(
    transport: &dyn Transport,
    text: String,
    request_id: RequestId,
    language: &str,
    ctx: &CallContext,
) -> Result<AnalysisResult> {
    let request = SentimentRequest {
        text: text.clone(),
        language: language.to_string(),
        request_id: request_id.to_string(),
    };
    let response = ctx.run(transport.analyze(request, ctx.timeout())).await?;
    AnalysisResult::from_response(text, request_id, response)
}

fn validate_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(Error::invalid_argument("text must not be empty"));
    }
    Ok(())
}

fn validate_batch(texts: &[String], max_batch_size: usize) -> Result<()> {
    if texts.is_empty() {
        return Err(Error::invalid_argument("texts must not be empty"));
    }
    if texts.len() > max_batch_size {
        return Err(Error::invalid_argument(format!(
            "batch of {} texts exceeds the maximum of {max_batch_size}",
            texts.len()
        )));
    }
    if let Some(i) = texts.iter().position(String::is_empty) {
        return Err(Error::invalid_argument(format!("text at index {i} is empty")));
    }
    Ok(())
}
