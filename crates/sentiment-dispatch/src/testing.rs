//! In-process doubles for the transport, broker and store seams.

use crate::{
    broker::{Acknowledge, Broker, BrokerError, Channel, Delivery, DeliveryStream},
    store::{AnalysisId, AnalysisStore, BatchStatus, Metadata, StoreError},
    transport::{BatchStream, Transport},
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use sentiment_core::{
    Error, Result,
    envelope::{ResultEnvelope, TaskEnvelope},
    proto::{SentimentRequest, SentimentResponse},
    types::{AnalysisResult, BatchId, RequestId},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::mpsc;

/// Deterministic classification used by every double.
pub(crate) fn classify(text: &str, request_id: &str) -> SentimentResponse {
    let (label, score) = if text.contains("good") {
        ("positive", 0.75)
    } else if text.contains("bad") {
        ("negative", -0.5)
    } else {
        ("neutral", 0.0)
    };
    SentimentResponse {
        request_id: request_id.to_string(),
        sentiment: label.to_string(),
        score,
        confidence_scores: BTreeMap::from([(label.to_string(), 0.9)]),
        keywords: text.split_whitespace().map(str::to_string).collect(),
    }
}

/// How a scripted batch stream behaves.
#[derive(Clone, Debug, Default)]
pub(crate) struct StreamScript {
    pub open_error: Option<Error>,
    /// Zero-based index of the send that fails.
    pub send_error_at: Option<usize>,
    /// Response order as indices into the sent requests.
    pub order: Option<Vec<usize>>,
    /// Number of responses produced before the stream ends.
    pub answer: Option<usize>,
    /// Returned by `recv` once `answer` responses were produced.
    pub tail_error: Option<Error>,
    /// Emit an unknown-id and a duplicate response before the real ones.
    pub noise: bool,
    /// `recv` never completes.
    pub hang: bool,
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<StreamScript>,
    unary_failures: Mutex<HashMap<String, Error>>,
    unary_delay: Option<Duration>,
    unary_ids: Mutex<Vec<String>>,
    pub unary_calls: AtomicUsize,
    pub stream_opens: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(self, script: StreamScript) -> Self {
        *self.script.lock() = script;
        self
    }

    pub fn failing_unary(self, text: &str, error: Error) -> Self {
        self.unary_failures.lock().insert(text.to_string(), error);
        self
    }

    pub fn with_unary_delay(mut self, delay: Duration) -> Self {
        self.unary_delay = Some(delay);
        self
    }

    pub fn unary_calls(&self) -> usize {
        self.unary_calls.load(Ordering::SeqCst)
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    /// Request ids seen by unary calls, in call order.
    pub fn unary_ids(&self) -> Vec<String> {
        self.unary_ids.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn analyze(
        &self,
        request: SentimentRequest,
        _deadline: Option<Duration>,
    ) -> Result<SentimentResponse> {
        self.unary_calls.fetch_add(1, Ordering::SeqCst);
        self.unary_ids.lock().push(request.request_id.clone());
        if let Some(delay) = self.unary_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.unary_failures.lock().get(&request.text) {
            return Err(err.clone());
        }
        Ok(classify(&request.text, &request.request_id))
    }

    async fn open_batch_stream(&self, _deadline: Option<Duration>) -> Result<Box<dyn BatchStream>> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();
        if let Some(err) = script.open_error.clone() {
            return Err(err);
        }
        Ok(Box::new(ScriptedBatchStream {
            script,
            sent: Vec::new(),
            closed: false,
            responses: None,
        }))
    }
}

struct ScriptedBatchStream {
    script: StreamScript,
    sent: Vec<SentimentRequest>,
    closed: bool,
    responses: Option<std::vec::IntoIter<SentimentResponse>>,
}

impl ScriptedBatchStream {
    fn build_responses(&self) -> Vec<SentimentResponse> {
        let order: Vec<usize> = match &self.script.order {
            Some(order) => order.clone(),
            None => (0..self.sent.len()).collect(),
        };
        let mut responses: Vec<_> = order
            .into_iter()
            .filter_map(|i| self.sent.get(i))
            .map(|r| classify(&r.text, &r.request_id))
            .collect();
        if let Some(answer) = self.script.answer {
            responses.truncate(answer);
        }
        if self.script.noise && !responses.is_empty() {
            let first = responses[0].clone();
            responses.insert(0, classify("stray", "not-a-request-of-this-batch"));
            responses.insert(2, first);
        }
        responses
    }
}

#[async_trait::async_trait]
impl BatchStream for ScriptedBatchStream {
    async fn send(&mut self, request: SentimentRequest) -> Result<()> {
        if self.closed {
            return Err(Error::dispatch_failed("send after close"));
        }
        if self.script.send_error_at == Some(self.sent.len()) {
            return Err(Error::transport_unavailable("stream reset by engine"));
        }
        self.sent.push(request);
        Ok(())
    }

    async fn close_send(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<SentimentResponse>> {
        if self.script.hang {
            futures::future::pending::<()>().await;
        }
        if self.responses.is_none() {
            self.responses = Some(self.build_responses().into_iter());
        }
        match self.responses.as_mut().and_then(Iterator::next) {
            Some(response) => Ok(Some(response)),
            None => match self.script.tail_error.clone() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }
}

enum QueueItem {
    Payload(Bytes),
    Fault(BrokerError),
    Close,
}

struct Queue {
    tx: mpsc::UnboundedSender<QueueItem>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

struct CountingAck(Arc<AtomicUsize>);

#[async_trait::async_trait]
impl Acknowledge for CountingAck {
    async fn ack(self: Box<Self>) -> core::result::Result<(), BrokerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Unbounded in-memory queues standing in for the two durable channels.
pub(crate) struct MemoryBroker {
    tasks: Queue,
    results: Queue,
    published: Mutex<Vec<(Channel, RequestId, Bytes)>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    answer_on_publish: AtomicBool,
    acks: Arc<AtomicUsize>,
    subscriptions: AtomicUsize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            tasks: Queue::new(),
            results: Queue::new(),
            published: Mutex::default(),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            answer_on_publish: AtomicBool::new(false),
            acks: Arc::default(),
            subscriptions: AtomicUsize::new(0),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, channel: Channel) -> &Queue {
        match channel {
            Channel::Tasks => &self.tasks,
            Channel::Results => &self.results,
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Answers each task inside `publish` and holds the publish ack until the
    /// result has been consumed.
    pub fn set_answer_on_publish(&self, answer: bool) {
        self.answer_on_publish.store(answer, Ordering::SeqCst);
    }

    pub fn inject(&self, channel: Channel, payload: impl Into<Bytes>) {
        let _ = self.queue(channel).tx.send(QueueItem::Payload(payload.into()));
    }

    pub fn inject_fault(&self, channel: Channel, err: BrokerError) {
        let _ = self.queue(channel).tx.send(QueueItem::Fault(err));
    }

    /// Ends the current subscription to `channel`; queued items stay queued.
    pub fn close_subscription(&self, channel: Channel) {
        let _ = self.queue(channel).tx.send(QueueItem::Close);
    }

    pub fn published(&self, channel: Channel) -> Vec<(RequestId, Bytes)> {
        self.published
            .lock()
            .iter()
            .filter(|(c, ..)| *c == channel)
            .map(|(_, id, payload)| (id.clone(), payload.clone()))
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Answers every published task on the result channel, as a worker would.
    pub fn answer_published_tasks(&self) -> usize {
        let tasks = self.published(Channel::Tasks);
        for (_, payload) in &tasks {
            if let Ok(task) = TaskEnvelope::from_slice(payload) {
                self.inject(Channel::Results, result_payload(&task.text, &task.request_id));
            }
        }
        tasks.len()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        channel: Channel,
        request_id: &RequestId,
        payload: Bytes,
    ) -> core::result::Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed("broker unreachable".to_string()));
        }
        self.published
            .lock()
            .push((channel, request_id.clone(), payload.clone()));
        let task = TaskEnvelope::from_slice(&payload).ok();
        let _ = self.queue(channel).tx.send(QueueItem::Payload(payload));

        if channel == Channel::Tasks && self.answer_on_publish.load(Ordering::SeqCst) {
            if let Some(task) = task {
                let acked = self.ack_count();
                self.inject(Channel::Results, result_payload(&task.text, &task.request_id));
                while self.ack_count() == acked {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Channel,
    ) -> core::result::Result<DeliveryStream, BrokerError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::SubscribeFailed("broker unreachable".to_string()));
        }
        let rx = Arc::clone(&self.queue(channel).rx);
        let acks = Arc::clone(&self.acks);
        let stream = futures::stream::unfold((rx, acks), |(rx, acks)| async move {
            let item = rx.lock().await.recv().await;
            let next = match item? {
                QueueItem::Payload(payload) => {
                    Ok(Delivery::new(payload, CountingAck(Arc::clone(&acks))))
                }
                QueueItem::Fault(err) => Err(err),
                QueueItem::Close => return None,
            };
            Some((next, (rx, acks)))
        });
        Ok(Box::pin(stream))
    }
}

/// A well-formed result envelope for `text` tagged `request_id`.
pub(crate) fn result_payload(text: &str, request_id: &RequestId) -> Vec<u8> {
    let response = classify(text, request_id.as_str());
    let envelope = ResultEnvelope {
        request_id: request_id.clone(),
        sentiment: response.sentiment,
        score: response.score,
        confidence_scores: response.confidence_scores,
        keywords: response.keywords,
        text: Some(text.to_string()),
    };
    envelope.to_vec().unwrap()
}

#[derive(Clone, Debug)]
pub(crate) struct StoredAnalysis {
    pub id: AnalysisId,
    pub result: AnalysisResult,
    pub language: String,
    pub metadata: Metadata,
}

#[derive(Clone, Debug)]
pub(crate) struct StoredBatch {
    pub count: usize,
    pub members: Vec<AnalysisId>,
    pub statuses: Vec<BatchStatus>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    analyses: Mutex<Vec<StoredAnalysis>>,
    batches: Mutex<HashMap<String, StoredBatch>>,
    rejected_texts: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(self, text: &str) -> Self {
        self.rejected_texts.lock().insert(text.to_string());
        self
    }

    pub fn analyses(&self) -> Vec<StoredAnalysis> {
        self.analyses.lock().clone()
    }

    pub fn batch(&self, batch_id: &BatchId) -> Option<StoredBatch> {
        self.batches.lock().get(batch_id.as_str()).cloned()
    }
}

#[async_trait::async_trait]
impl AnalysisStore for MemoryStore {
    async fn store(
        &self,
        result: &AnalysisResult,
        language: &str,
        metadata: &Metadata,
    ) -> core::result::Result<AnalysisId, StoreError> {
        if self.rejected_texts.lock().contains(&result.text) {
            return Err(StoreError::Rejected {
                what: "analysis".to_string(),
                reason: "text rejected".to_string(),
            });
        }
        let mut analyses = self.analyses.lock();
        let id = AnalysisId::new(format!("analysis-{}", analyses.len() + 1));
        analyses.push(StoredAnalysis {
            id: id.clone(),
            result: result.clone(),
            language: language.to_string(),
            metadata: metadata.clone(),
        });
        Ok(id)
    }

    async fn create_batch(
        &self,
        batch_id: &BatchId,
        count: usize,
        _metadata: &Metadata,
    ) -> core::result::Result<(), StoreError> {
        self.batches.lock().insert(
            batch_id.as_str().to_string(),
            StoredBatch {
                count,
                members: Vec::new(),
                statuses: vec![BatchStatus::Pending],
            },
        );
        Ok(())
    }

    async fn store_batch_membership(
        &self,
        batch_id: &BatchId,
        analysis_ids: &[AnalysisId],
    ) -> core::result::Result<(), StoreError> {
        let mut batches = self.batches.lock();
        let batch = batches
            .get_mut(batch_id.as_str())
            .ok_or_else(|| StoreError::Unavailable(format!("unknown batch {batch_id}")))?;
        batch.members.extend_from_slice(analysis_ids);
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
    ) -> core::result::Result<(), StoreError> {
        let mut batches = self.batches.lock();
        let batch = batches
            .get_mut(batch_id.as_str())
            .ok_or_else(|| StoreError::Unavailable(format!("unknown batch {batch_id}")))?;
        batch.statuses.push(status);
        Ok(())
    }
}
