use crate::telemetry;
use core::time::Duration;
use parking_lot::Mutex;
use sentiment_core::{
    Error, Result,
    types::{AnalysisResult, RequestId},
};
use std::collections::HashMap;
use tokio::{sync::oneshot, time::Instant};

pub(crate) type CompletionSender = oneshot::Sender<Result<AnalysisResult>>;

/// A submitted task awaiting its result.
pub(crate) struct PendingTask {
    text: String,
    submitted_at: Instant,
    completion: CompletionSender,
}

impl PendingTask {
    pub(crate) fn new(text: String, completion: CompletionSender) -> Self {
        Self {
            text,
            submitted_at: Instant::now(),
            completion,
        }
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    /// Delivers `outcome` to the waiting caller. Returns `false` if the caller
    /// has gone away.
    pub(crate) fn complete(self, outcome: Result<AnalysisResult>) -> bool {
        self.completion.send(outcome).is_ok()
    }
}

/// Pending tasks keyed by request id.
///
/// Every operation is a single critical section, so a task is removed (and
/// therefore completed) at most once no matter how many threads race on it.
#[derive(Default)]
pub(crate) struct PendingTable {
    tasks: Mutex<HashMap<RequestId, PendingTask>>,
}

impl PendingTable {
    /// Inserts `task`, returning a guard that withdraws it again unless
    /// [`Registration::commit`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if `request_id` is already pending.
    pub(crate) fn register(&self, request_id: RequestId, task: PendingTask) -> Result<Registration<'_>> {
        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&request_id) {
                return Err(Error::internal(format!("request {request_id} is already pending")));
            }
            tasks.insert(request_id.clone(), task);
        }
        telemetry::increment_tasks_pending();
        Ok(Registration {
            table: self,
            request_id: Some(request_id),
        })
    }

    pub(crate) fn take(&self, request_id: &RequestId) -> Option<PendingTask> {
        let task = self.tasks.lock().remove(request_id);
        if task.is_some() {
            telemetry::decrement_tasks_pending();
        }
        task
    }

    /// Removes every task submitted more than `ttl` before `now`.
    pub(crate) fn evict_expired(&self, now: Instant, ttl: Duration) -> Vec<(RequestId, PendingTask)> {
        let expired: Vec<_> = {
            let mut tasks = self.tasks.lock();
            let ids: Vec<RequestId> = tasks
                .iter()
                .filter(|(_, task)| now.saturating_duration_since(task.submitted_at) >= ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tasks.remove(&id).map(|task| (id, task)))
                .collect()
        };
        for _ in &expired {
            telemetry::decrement_tasks_pending();
        }
        expired
    }

    pub(crate) fn drain(&self) -> Vec<(RequestId, PendingTask)> {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for _ in &drained {
            telemetry::decrement_tasks_pending();
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Withdraws a registration on drop unless committed.
///
/// Covers both a failed publish and a submitting future dropped mid-publish.
pub(crate) struct Registration<'a> {
    table: &'a PendingTable,
    request_id: Option<RequestId>,
}

impl Registration<'_> {
    pub(crate) fn commit(mut self) {
        self.request_id = None;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(request_id) = self.request_id.take() {
            if self.table.take(&request_id).is_some() {
                tracing::debug!("Withdrew registration for {request_id}");
            }
        }
    }
}
