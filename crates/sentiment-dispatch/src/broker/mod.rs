//! Durable publish/consume access to the message broker.
//!
//! The broker carries two independent channels: [`Channel::Tasks`], drained by
//! [`TaskWorker`](crate::worker::TaskWorker)s, and [`Channel::Results`], drained
//! by the [`AsyncCorrelator`](crate::correlator::AsyncCorrelator). Payloads are
//! opaque bytes at this layer; the JSON envelopes are defined in
//! [`sentiment_core::envelope`].
//!
//! ## Structure
//!
//! - [`nats`] - NATS JetStream implementation.
//! - [`retry`] - linear-backoff retry used when connecting.

pub mod nats;
pub mod retry;

use bytes::Bytes;
use core::{fmt, pin::Pin};
use futures::Stream;
use sentiment_core::{Error, types::RequestId};

pub use nats::{ChannelNames, NatsBroker, NatsSettings};
pub use retry::RetryPolicy;

/// One of the two durable queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Tasks,
    Results,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Tasks => write!(f, "tasks"),
            Channel::Results => write!(f, "results"),
        }
    }
}

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Broker setup failed: {0}")]
    Setup(String),
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ConnectionFailed(context) => Error::TransportUnavailable { context },
            other => Error::DispatchFailed {
                context: other.to_string(),
            },
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A message pulled from a channel.
///
/// Must be [`ack`](Delivery::ack)ed once handled; an unacknowledged delivery
/// is redelivered by the broker.
pub struct Delivery {
    payload: Bytes,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(payload: Bytes, acker: impl Acknowledge + 'static) -> Self {
        Self {
            payload,
            acker: Some(Box::new(acker)),
        }
    }

    /// A delivery that needs no acknowledgement.
    pub fn unacked(payload: Bytes) -> Self {
        Self {
            payload,
            acker: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("acked", &self.acker.is_none())
            .finish()
    }
}

/// Deliveries from one subscription. Ends when the subscription is lost.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `payload` with persistent delivery and waits for the broker
    /// to confirm it. `request_id` keys broker-side de-duplication.
    async fn publish(
        &self,
        channel: Channel,
        request_id: &RequestId,
        payload: Bytes,
    ) -> Result<(), BrokerError>;

    /// Opens a durable subscription to `channel`.
    async fn subscribe(&self, channel: Channel) -> Result<DeliveryStream, BrokerError>;
}
