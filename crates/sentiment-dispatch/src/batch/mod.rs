//! Many texts over one bidirectional stream, with per-item fallback.
//!
//! ## Structure
//!
//! - `job` - per-batch bookkeeping (request id to input index).
//! - [`coordinator`] - stream pass, fallback, and persistence.

pub mod coordinator;
mod job;


pub use coordinator::BatchCoordinator;

use sentiment_core::{
    Error,
    types::{AnalysisResult, BatchId},
};
use serde::Serialize;

/// Outcome of one batch: exactly one slot per input, in input order.
#[derive(Debug)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub items: Vec<Result<AnalysisResult, Error>>,
    /// How many slots were resolved through the unary fallback.
    pub fallback_count: usize,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok()).count()
    }

    pub fn report(&self) -> BatchReport<'_> {
        BatchReport {
            batch_id: &self.batch_id,
            fallback_count: self.fallback_count,
            items: self
                .items
                .iter()
                .map(|item| match item {
                    Ok(result) => ItemReport::Ok(result),
                    Err(e) => ItemReport::Err {
                        error: e.to_string(),
                    },
                })
                .collect(),
        }
    }
}

/// Serializable view of a [`BatchResult`].
#[derive(Debug, Serialize)]
pub struct BatchReport<'a> {
    pub batch_id: &'a BatchId,
    pub fallback_count: usize,
    pub items: Vec<ItemReport<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ItemReport<'a> {
    Ok(&'a AnalysisResult),
    Err { error: String },
}
