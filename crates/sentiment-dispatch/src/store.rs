//! Boundary to the persistence layer.
//!
//! Analysis records, batch records and their metadata are owned by an
//! external store. The dispatch paths only hand results over through
//! [`AnalysisStore`]; [`ResultRecorder`] wraps the store so that a failed write
//! is logged and never fails the analysis that produced it.

use core::fmt;
use sentiment_core::types::{AnalysisResult, BatchId};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

/// Free-form key/value metadata attached to stored records.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key tagging every result of a batch.
pub const BATCH_ID_KEY: &str = "batch_id";

/// Store-assigned identifier of one analysis record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AnalysisId(String);

impl AnalysisId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    /// Every item produced a result.
    Completed,
    /// Some, but not all, items produced a result.
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn from_counts(resolved: usize, total: usize) -> Self {
        match resolved {
            0 => BatchStatus::Failed,
            n if n >= total => BatchStatus::Completed,
            _ => BatchStatus::Partial,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Completed => "completed",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store rejected {what}: {reason}")]
    Rejected { what: String, reason: String },
}

#[async_trait::async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn store(
        &self,
        result: &AnalysisResult,
        language: &str,
        metadata: &Metadata,
    ) -> Result<AnalysisId, StoreError>;

    async fn create_batch(
        &self,
        batch_id: &BatchId,
        count: usize,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// Records which analyses belong to `batch_id`, in input order.
    async fn store_batch_membership(
        &self,
        batch_id: &BatchId,
        analysis_ids: &[AnalysisId],
    ) -> Result<(), StoreError>;

    async fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
    ) -> Result<(), StoreError>;
}

/// Best-effort writer in front of an [`AnalysisStore`].
#[derive(Clone)]
pub struct ResultRecorder {
    store: Arc<dyn AnalysisStore>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn AnalysisStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        result: &AnalysisResult,
        language: &str,
        metadata: &Metadata,
    ) -> Option<AnalysisId> {
        match self.store.store(result, language, metadata).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to store result {}: {e}", result.request_id);
                None
            }
        }
    }

    pub async fn open_batch(&self, batch_id: &BatchId, count: usize, metadata: &Metadata) {
        if let Err(e) = self.store.create_batch(batch_id, count, metadata).await {
            tracing::warn!("Failed to create batch record {batch_id}: {e}");
        }
    }

    pub async fn close_batch(
        &self,
        batch_id: &BatchId,
        analysis_ids: &[AnalysisId],
        status: BatchStatus,
    ) {
        if !analysis_ids.is_empty() {
            if let Err(e) = self.store.store_batch_membership(batch_id, analysis_ids).await {
                tracing::warn!("Failed to record membership of batch {batch_id}: {e}");
            }
        }
        if let Err(e) = self.store.update_batch_status(batch_id, status).await {
            tracing::warn!("Failed to mark batch {batch_id} {status}: {e}");
        }
    }
}

impl fmt::Debug for ResultRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultRecorder").finish_non_exhaustive()
    }
}
