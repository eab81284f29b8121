//! Point-to-point and streaming access to the analysis engine.
//!
//! The [`Transport`] trait is the seam between the dispatch core and the
//! engine. [`grpc::GrpcTransport`] implements it over tonic; tests substitute
//! scripted implementations.
//!
//! ## Structure
//!
//! - [`grpc`] - tonic client for `sentiment.v1.SentimentAnalyzer`.

pub mod grpc;

use core::time::Duration;
use sentiment_core::{
    Result,
    proto::{SentimentRequest, SentimentResponse},
};

/// Engine operations used by the dispatch paths.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Classifies one text. `deadline` is forwarded to the engine.
    async fn analyze(
        &self,
        request: SentimentRequest,
        deadline: Option<Duration>,
    ) -> Result<SentimentResponse>;

    /// Opens one bidirectional batch stream.
    async fn open_batch_stream(&self, deadline: Option<Duration>) -> Result<Box<dyn BatchStream>>;
}

/// Handle to one open bidirectional batch stream.
///
/// Dropping the handle aborts the stream.
#[async_trait::async_trait]
pub trait BatchStream: Send {
    /// Sends one tagged request.
    async fn send(&mut self, request: SentimentRequest) -> Result<()>;

    /// Half-closes the send direction. No further `send` calls are allowed.
    async fn close_send(&mut self) -> Result<()>;

    /// Receives the next response, or `None` once the engine ends the stream.
    async fn recv(&mut self) -> Result<Option<SentimentResponse>>;
}

pub use grpc::{Compression, GrpcTransport};
