use sentiment_core::{
    Error, Result,
    proto::{SentimentRequest, SentimentResponse},
    types::{AnalysisResult, BatchId, RequestId},
};
use std::collections::HashMap;

struct Item {
    text: String,
    request_id: RequestId,
    outcome: Option<Result<AnalysisResult>>,
}

/// Bookkeeping for one batch: inputs in order, the id each was tagged with,
/// and the outcome of each once known.
pub(crate) struct BatchJob {
    batch_id: BatchId,
    items: Vec<Item>,
    index: HashMap<RequestId, usize>,
    answered: usize,
}

impl BatchJob {
    pub(crate) fn new(texts: Vec<String>) -> Self {
        let items: Vec<Item> = texts
            .into_iter()
            .map(|text| Item {
                text,
                request_id: RequestId::generate(),
                outcome: None,
            })
            .collect();
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.request_id.clone(), i))
            .collect();
        Self {
            batch_id: BatchId::generate(),
            items,
            index,
            answered: 0,
        }
    }

    pub(crate) fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.answered == self.items.len()
    }

    pub(crate) fn requests<'a>(
        &'a self,
        language: &'a str,
    ) -> impl Iterator<Item = SentimentRequest> + 'a {
        self.items.iter().map(move |item| SentimentRequest {
            text: item.text.clone(),
            language: language.to_string(),
            request_id: item.request_id.to_string(),
        })
    }

    /// Places a stream response by its request id. Returns `false` (and
    /// leaves the job unchanged) for untagged, unknown, duplicate, or
    /// unusable responses.
    pub(crate) fn accept(&mut self, response: SentimentResponse) -> bool {
        let Some(&i) = self.index.get(response.request_id.as_str()) else {
            tracing::warn!(
                "Ignoring stream response for unknown request {:?} in batch {}",
                response.request_id,
                self.batch_id
            );
            return false;
        };
        let item = &mut self.items[i];
        if item.outcome.is_some() {
            tracing::warn!("Ignoring duplicate stream response for {}", item.request_id);
            return false;
        }
        match AnalysisResult::from_response(item.text.clone(), item.request_id.clone(), response) {
            Ok(result) => {
                item.outcome = Some(Ok(result));
                self.answered += 1;
                true
            }
            Err(e) => {
                tracing::warn!("Unusable stream response for {}: {e}", item.request_id);
                false
            }
        }
    }

    /// Indices, in input order, of items without an outcome.
    pub(crate) fn unanswered(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.outcome.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn item(&self, i: usize) -> (&str, &RequestId) {
        let item = &self.items[i];
        (&item.text, &item.request_id)
    }

    pub(crate) fn settle(&mut self, i: usize, outcome: Result<AnalysisResult>) {
        let item = &mut self.items[i];
        if item.outcome.is_none() {
            item.outcome = Some(outcome);
            self.answered += 1;
        }
    }

    pub(crate) fn into_outcomes(self) -> Vec<Result<AnalysisResult>> {
        self.items
            .into_iter()
            .map(|item| {
                item.outcome.unwrap_or_else(|| {
                    Err(Error::internal(format!("no outcome for {}", item.request_id)))
                })
            })
            .collect()
    }
}
