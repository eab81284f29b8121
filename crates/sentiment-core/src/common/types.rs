//! # Identifiers and Analysis Results
//!
//! This module defines the identifier and result types shared by every
//! dispatch path.
//!
//! ## Identifiers
//!
//! - [`RequestId`] - correlates one analysis task with its eventual result.
//! - [`BatchId`] - tags every result produced by one batch submission.
//!
//! Both render as hyphenated UUIDv4 strings: 122 random bits, so collisions
//! between concurrently pending tasks are negligible without coordination.
//!
//! ## Results
//!
//! [`AnalysisResult`] is built exactly once per accepted task, from either a
//! gRPC [`SentimentResponse`] or a broker
//! [`ResultEnvelope`](crate::envelope::ResultEnvelope). Construction rejects
//! responses that would produce a partially populated result.

use crate::{Error, Result, proto::SentimentResponse};
use chrono::{DateTime, Utc};
use core::{borrow::Borrow, fmt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique token correlating one analysis task with its result.
///
/// Generated fresh per task and never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::internal("request_id must not be empty"));
        }
        Ok(Self(raw))
    }
}

/// Identifier shared by every result of one batch submission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Label to probability mapping reported by the engine.
pub type ConfidenceScores = BTreeMap<String, f64>;

/// The classification of one text.
///
/// Immutable after construction. `score` and `confidence_scores` are passed
/// through from the engine untouched; `keywords` keep the engine's order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub text: String,
    pub sentiment: String,
    pub score: f64,
    pub confidence_scores: ConfidenceScores,
    pub keywords: Vec<String>,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    /// Builds a result from an engine response to a request tagged
    /// `request_id`.
    ///
    /// An empty `request_id` echo is tolerated (the caller knows which request
    /// it sent); a mismatched one is not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the response answers a different request
    /// or carries no sentiment label.
    pub fn from_response(
        text: String,
        request_id: RequestId,
        response: SentimentResponse,
    ) -> Result<Self> {
        if !response.request_id.is_empty() && response.request_id != request_id.as_str() {
            return Err(Error::internal(format!(
                "response for {} returned to request {request_id}",
                response.request_id
            )));
        }
        Self::build(
            text,
            request_id,
            response.sentiment,
            response.score,
            response.confidence_scores,
            response.keywords,
        )
    }

    pub(crate) fn build(
        text: String,
        request_id: RequestId,
        sentiment: String,
        score: f64,
        confidence_scores: ConfidenceScores,
        keywords: Vec<String>,
    ) -> Result<Self> {
        if sentiment.is_empty() {
            return Err(Error::internal(format!(
                "engine returned no sentiment label for {request_id}"
            )));
        }
        Ok(Self {
            text,
            sentiment,
            score,
            confidence_scores,
            keywords,
            request_id,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: &str, sentiment: &str) -> SentimentResponse {
        SentimentResponse {
            request_id: request_id.to_string(),
            sentiment: sentiment.to_string(),
            score: 0.75,
            confidence_scores: BTreeMap::from([
                ("positive".to_string(), 0.8),
                ("neutral".to_string(), 0.15),
                ("negative".to_string(), 0.05),
            ]),
            keywords: vec!["great".to_string(), "service".to_string()],
        }
    }

    #[test]
    fn generated_ids_are_distinct_uuids() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn empty_request_id_is_rejected() {
        assert!(RequestId::try_from(String::new()).is_err());
    }

    #[test]
    fn result_passes_engine_fields_through() {
        let id = RequestId::generate();
        let result = AnalysisResult::from_response(
            "great service".to_string(),
            id.clone(),
            response(id.as_str(), "positive"),
        )
        .unwrap();

        assert_eq!(result.text, "great service");
        assert_eq!(result.request_id, id);
        assert_eq!(result.score, 0.75);
        assert_eq!(result.keywords, ["great", "service"]);
        assert_eq!(result.confidence_scores["neutral"], 0.15);
    }

    #[test]
    fn missing_echo_uses_sent_id() {
        let id = RequestId::generate();
        let result =
            AnalysisResult::from_response("ok".to_string(), id.clone(), response("", "neutral"))
                .unwrap();
        assert_eq!(result.request_id, id);
    }

    #[test]
    fn partial_responses_are_rejected() {
        let id = RequestId::generate();
        let mismatched =
            AnalysisResult::from_response("x".to_string(), id.clone(), response("other", "positive"));
        assert!(matches!(mismatched, Err(Error::Internal { .. })));

        let unlabeled =
            AnalysisResult::from_response("x".to_string(), id.clone(), response(id.as_str(), ""));
        assert!(matches!(unlabeled, Err(Error::Internal { .. })));
    }
}
