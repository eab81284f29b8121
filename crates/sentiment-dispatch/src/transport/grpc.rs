//! tonic client for the `sentiment.v1.SentimentAnalyzer` engine.
//!
//! The unary call maps directly onto `AnalyzeSentiment`. The batch stream is
//! driven through a bounded MPSC channel feeding the request side of
//! `BatchAnalyzeSentiment`; the call itself runs on a spawned task so that
//! sends can proceed before the engine has produced response headers (engines
//! commonly read the whole request stream before answering).

use super::{BatchStream, Transport};
use core::{fmt, time::Duration};
use sentiment_core::{
    Error, Result,
    proto::{SentimentRequest, SentimentResponse, sentiment_analyzer_client::SentimentAnalyzerClient},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Request, Response, Status, Streaming,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

/// Request/response compression negotiated with the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    #[default]
    None,
    Deflate,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate => write!(f, "deflate"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Deflate => Some(CompressionEncoding::Deflate),
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

/// gRPC [`Transport`] backed by one multiplexed tonic [`Channel`].
///
/// Cloning is cheap and every clone shares the underlying HTTP/2 connection,
/// so one instance serves any number of concurrent callers.
#[derive(Clone, Debug)]
pub struct GrpcTransport {
    client: SentimentAnalyzerClient<Channel>,
    stream_buffer_size: usize,
}

impl GrpcTransport {
    /// Connects to the engine at `addr` (e.g. `http://127.0.0.1:50051`).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `addr` is not a valid URI.
    /// - [`Error::TransportUnavailable`] if no connection could be established
    ///   within `connect_timeout`.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        compression: Compression,
        stream_buffer_size: usize,
    ) -> Result<Self> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| Error::invalid_argument(format!("invalid engine address {addr}: {e}")))?
            .connect_timeout(connect_timeout);

        let channel = endpoint.connect().await.map_err(|e| {
            Error::transport_unavailable(format!("failed to connect to engine at {addr}: {e}"))
        })?;

        tracing::info!(%addr, %compression, "Connected to analysis engine");
        Ok(Self::new(channel, compression, stream_buffer_size))
    }

    /// Like [`connect`](Self::connect), but defers connecting until the first
    /// call. Used where the engine may never be reached, such as a broker-only
    /// submission.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `addr` is not a valid URI.
    pub fn connect_lazy(
        addr: &str,
        connect_timeout: Duration,
        compression: Compression,
        stream_buffer_size: usize,
    ) -> Result<Self> {
        let channel = Endpoint::from_shared(addr.to_string())
            .map_err(|e| Error::invalid_argument(format!("invalid engine address {addr}: {e}")))?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        Ok(Self::new(channel, compression, stream_buffer_size))
    }

    pub fn new(channel: Channel, compression: Compression, stream_buffer_size: usize) -> Self {
        let mut client = SentimentAnalyzerClient::new(channel);
        if let Some(encoding) = Option::<CompressionEncoding>::from(compression) {
            client = client.send_compressed(encoding).accept_compressed(encoding);
        }
        Self {
            client,
            stream_buffer_size: stream_buffer_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl Transport for GrpcTransport {
    async fn analyze(
        &self,
        request: SentimentRequest,
        deadline: Option<Duration>,
    ) -> Result<SentimentResponse> {
        let mut client = self.client.clone();
        let mut request = Request::new(request);
        if let Some(deadline) = deadline {
            request.set_timeout(deadline);
        }
        let response = client.analyze_sentiment(request).await?;
        Ok(response.into_inner())
    }

    async fn open_batch_stream(&self, deadline: Option<Duration>) -> Result<Box<dyn BatchStream>> {
        let (tx, rx) = mpsc::channel(self.stream_buffer_size);
        let mut request = Request::new(ReceiverStream::new(rx));
        if let Some(deadline) = deadline {
            request.set_timeout(deadline);
        }

        let mut client = self.client.clone();
        let call = tokio::spawn(async move { client.batch_analyze_sentiment(request).await });

        Ok(Box::new(GrpcBatchStream {
            outbound: Some(tx),
            call: Some(call),
            inbound: None,
        }))
    }
}

type BatchCall = JoinHandle<core::result::Result<Response<Streaming<SentimentResponse>>, Status>>;

struct GrpcBatchStream {
    outbound: Option<mpsc::Sender<SentimentRequest>>,
    call: Option<BatchCall>,
    inbound: Option<Streaming<SentimentResponse>>,
}

#[async_trait::async_trait]
impl BatchStream for GrpcBatchStream {
    async fn send(&mut self, request: SentimentRequest) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Err(Error::dispatch_failed("batch stream send direction is closed"));
        };
        outbound
            .send(request)
            .await
            .map_err(|_| Error::transport_unavailable("engine closed the batch stream"))
    }

    async fn close_send(&mut self) -> Result<()> {
        // Dropping the sender ends the request stream.
        self.outbound.take();
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<SentimentResponse>> {
        if self.inbound.is_none() {
            let call = self
                .call
                .take()
                .ok_or_else(|| Error::transport_unavailable("batch stream is no longer open"))?;
            let response = call
                .await
                .map_err(|e| Error::internal(format!("batch stream task failed: {e}")))??;
            self.inbound = Some(response.into_inner());
        }

        match self.inbound.as_mut() {
            Some(inbound) => Ok(inbound.message().await?),
            None => Err(Error::transport_unavailable("batch stream is no longer open")),
        }
    }
}

impl Drop for GrpcBatchStream {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            call.abort();
        }
    }
}
