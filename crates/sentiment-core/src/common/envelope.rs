//! JSON envelopes exchanged over the message broker.
//!
//! Task envelopes flow from the dispatcher to workers on the task channel;
//! result envelopes flow back on the result channel. Both are parsed into a
//! fixed schema once, at the boundary: a payload missing a required field or
//! carrying a field of the wrong type is rejected outright instead of being
//! coerced.

use crate::{
    Error, Result,
    types::{AnalysisResult, ConfidenceScores, RequestId},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A unit of work published to the task channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub text: String,
    pub language: String,
    pub request_id: RequestId,
    /// Submission time in Unix seconds.
    pub timestamp: i64,
}

impl TaskEnvelope {
    pub fn new(text: impl Into<String>, language: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            request_id,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::internal(format!("failed to encode task envelope: {e}")))
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(payload)
            .map_err(|e| Error::internal(format!("malformed task envelope: {e}")))?;
        if envelope.request_id.as_str().is_empty() {
            return Err(Error::internal("task envelope has an empty request_id"));
        }
        Ok(envelope)
    }
}

/// A classification published to the result channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub request_id: RequestId,
    pub sentiment: String,
    pub score: f64,
    #[serde(default)]
    pub confidence_scores: ConfidenceScores,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ResultEnvelope {
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::internal(format!("failed to encode result envelope: {e}")))
    }

    /// Parses and validates a result payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the payload is not valid JSON, is missing
    /// `request_id`, `sentiment`, or `score`, or has an empty `request_id`.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(payload)
            .map_err(|e| Error::internal(format!("malformed result envelope: {e}")))?;
        if envelope.request_id.as_str().is_empty() {
            return Err(Error::internal("result envelope has an empty request_id"));
        }
        Ok(envelope)
    }

    /// Converts the envelope into the final result for a task submitted with
    /// `text`. The submitted text wins over any text echoed by the worker.
    pub fn into_result(self, text: String) -> Result<AnalysisResult> {
        AnalysisResult::build(
            text,
            self.request_id,
            self.sentiment,
            self.score,
            self.confidence_scores,
            self.keywords,
        )
    }

    /// Wraps a finished analysis for publication.
    pub fn from_result(result: &AnalysisResult) -> Self {
        Self {
            request_id: result.request_id.clone(),
            sentiment: result.sentiment.clone(),
            score: result.score,
            confidence_scores: result.confidence_scores.clone(),
            keywords: result.keywords.clone(),
            text: Some(result.text.clone()),
        }
    }
}
