//! NATS JetStream [`Broker`].
//!
//! Each channel is a file-backed stream bound to one subject. Publishes wait
//! for the stream's persistence ack and carry `Nats-Msg-Id` so the server drops
//! re-publishes of the same request within its duplicate window.
//!
//! The task stream is a work queue shared by every worker through one durable
//! pull consumer. The result stream keeps messages for `result_max_age`, and
//! each [`NatsBroker`] reads it through its own consumer starting at the
//! stream's tail as of [`NatsBroker::connect`]. Concurrent correlators each see
//! every result, so no process can acknowledge away another one's answer.

use super::{Acknowledge, Broker, BrokerError, Channel, Delivery, DeliveryStream, RetryPolicy};
use async_nats::{
    ConnectOptions, HeaderMap, header,
    jetstream::{self, Context as JetStreamContext, consumer, stream},
};
use bytes::Bytes;
use core::time::Duration;
use futures::StreamExt;
use sentiment_core::types::RequestId;

/// Subjects, stream and consumer names for one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelNames {
    pub subject: String,
    pub stream: String,
    /// Durable consumer name for tasks; name prefix of the per-broker consumer
    /// for results.
    pub consumer: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatsSettings {
    pub url: String,
    pub client_name: String,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub duplicate_window: Duration,
    /// How long results stay on the result stream.
    pub result_max_age: Duration,
    /// Idle time after which the server removes a result consumer.
    pub result_consumer_idle: Duration,
    pub tasks: ChannelNames,
    pub results: ChannelNames,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            client_name: "sentiment-dispatch".to_string(),
            connect_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            duplicate_window: Duration::from_secs(120),
            result_max_age: Duration::from_secs(3600),
            result_consumer_idle: Duration::from_secs(300),
            tasks: ChannelNames {
                subject: "sentiment.tasks".to_string(),
                stream: "SENTIMENT_TASKS".to_string(),
                consumer: "sentiment-workers".to_string(),
            },
            results: ChannelNames {
                subject: "sentiment.results".to_string(),
                stream: "SENTIMENT_RESULTS".to_string(),
                consumer: "sentiment-correlator".to_string(),
            },
        }
    }
}

impl NatsSettings {
    fn names(&self, channel: Channel) -> &ChannelNames {
        match channel {
            Channel::Tasks => &self.tasks,
            Channel::Results => &self.results,
        }
    }
}

pub struct NatsBroker {
    jetstream: JetStreamContext,
    settings: NatsSettings,
    /// This broker's own result consumer.
    result_consumer: String,
    /// First result-stream sequence this broker reads.
    result_start: u64,
}

impl NatsBroker {
    /// Connects (retrying per `settings.retry`) and makes sure both streams
    /// exist.
    pub async fn connect(settings: NatsSettings) -> Result<Self, BrokerError> {
        let client = settings
            .retry
            .run("NATS connect", || {
                let options = ConnectOptions::new()
                    .name(&settings.client_name)
                    .connection_timeout(settings.connect_timeout);
                let url = settings.url.clone();
                async move {
                    async_nats::connect_with_options(url, options)
                        .await
                        .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))
                }
            })
            .await?;

        tracing::info!("Connected to NATS at {}", settings.url);

        let jetstream = jetstream::new(client);
        ensure_stream(&jetstream, &settings, Channel::Tasks).await?;
        let results = ensure_stream(&jetstream, &settings, Channel::Results).await?;
        let result_start = results.cached_info().state.last_sequence + 1;
        let result_consumer = format!("{}-{}", settings.results.consumer, uuid::Uuid::new_v4().simple());
        tracing::debug!("Reading results as {result_consumer} from sequence {result_start}");

        Ok(Self {
            jetstream,
            settings,
            result_consumer,
            result_start,
        })
    }
}

/// Pull consumer settings for `channel`: the shared durable `name` for tasks,
/// or a private consumer `name` reading results from `result_start` on.
fn consumer_config(
    settings: &NatsSettings,
    channel: Channel,
    name: &str,
    result_start: u64,
) -> consumer::pull::Config {
    let subject = settings.names(channel).subject.clone();
    match channel {
        Channel::Tasks => consumer::pull::Config {
            durable_name: Some(name.to_string()),
            filter_subject: subject,
            ack_policy: consumer::AckPolicy::Explicit,
            ..Default::default()
        },
        Channel::Results => consumer::pull::Config {
            name: Some(name.to_string()),
            filter_subject: subject,
            deliver_policy: consumer::DeliverPolicy::ByStartSequence {
                start_sequence: result_start,
            },
            ack_policy: consumer::AckPolicy::Explicit,
            inactive_threshold: settings.result_consumer_idle,
            ..Default::default()
        },
    }
}

async fn ensure_stream(
    jetstream: &JetStreamContext,
    settings: &NatsSettings,
    channel: Channel,
) -> Result<stream::Stream, BrokerError> {
    let names = settings.names(channel);
    let (retention, max_age) = match channel {
        Channel::Tasks => (stream::RetentionPolicy::WorkQueue, Duration::ZERO),
        Channel::Results => (stream::RetentionPolicy::Limits, settings.result_max_age),
    };
    let config = stream::Config {
        name: names.stream.clone(),
        subjects: vec![names.subject.clone()],
        storage: stream::StorageType::File,
        retention,
        max_age,
        duplicate_window: settings.duplicate_window,
        ..Default::default()
    };

    let stream = jetstream
        .get_or_create_stream(config)
        .await
        .map_err(|e| BrokerError::Setup(format!("stream {}: {e}", names.stream)))?;
    tracing::debug!("Using stream {} for {channel}", names.stream);
    Ok(stream)
}

#[async_trait::async_trait]
impl Broker for NatsBroker {
    async fn publish(
        &self,
        channel: Channel,
        request_id: &RequestId,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        let subject = self.settings.names(channel).subject.clone();
        let mut headers = HeaderMap::new();
        headers.insert(header::NATS_MESSAGE_ID, request_id.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, payload)
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        ack.await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<DeliveryStream, BrokerError> {
        let stream = ensure_stream(&self.jetstream, &self.settings, channel).await?;

        let name = match channel {
            Channel::Tasks => self.settings.tasks.consumer.as_str(),
            Channel::Results => self.result_consumer.as_str(),
        };
        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(
                name,
                consumer_config(&self.settings, channel, name, self.result_start),
            )
            .await
            .map_err(|e| BrokerError::SubscribeFailed(format!("consumer {name}: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::SubscribeFailed(e.to_string()))?;

        Ok(Box::pin(messages.map(|next| match next {
            Ok(message) => {
                let payload = message.message.payload.clone();
                Ok(Delivery::new(payload, JetStreamAck(message)))
            }
            Err(e) => Err(BrokerError::Receive(e.to_string())),
        })))
    }
}

struct JetStreamAck(jetstream::Message);

#[async_trait::async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0
            .ack()
            .await
            .map_err(|e| BrokerError::AckFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentiment_core::envelope::TaskEnvelope;

    // These tests require a running NATS server with JetStream enabled:
    // docker run -d --name nats -p 4222:4222 nats:latest -js

    #[test]
    fn channel_names_are_distinct() {
        let settings = NatsSettings::default();
        assert_ne!(settings.names(Channel::Tasks), settings.names(Channel::Results));
    }

    #[test]
    fn result_consumers_are_private_and_start_at_the_tail() {
        let settings = NatsSettings::default();

        let tasks = consumer_config(&settings, Channel::Tasks, "sentiment-workers", 42);
        assert_eq!(tasks.durable_name.as_deref(), Some("sentiment-workers"));
        assert!(matches!(tasks.deliver_policy, consumer::DeliverPolicy::All));

        let results = consumer_config(&settings, Channel::Results, "sentiment-correlator-a", 42);
        assert_eq!(results.durable_name, None);
        assert_eq!(results.name.as_deref(), Some("sentiment-correlator-a"));
        assert_eq!(results.filter_subject, "sentiment.results");
        assert!(matches!(
            results.deliver_policy,
            consumer::DeliverPolicy::ByStartSequence { start_sequence: 42 }
        ));
        assert_eq!(results.inactive_threshold, settings.result_consumer_idle);
    }

    fn test_settings() -> NatsSettings {
        NatsSettings {
            tasks: ChannelNames {
                subject: "sentiment.test.tasks".to_string(),
                stream: "SENTIMENT_TEST_TASKS".to_string(),
                consumer: "sentiment-test-workers".to_string(),
            },
            results: ChannelNames {
                subject: "sentiment.test.results".to_string(),
                stream: "SENTIMENT_TEST_RESULTS".to_string(),
                consumer: "sentiment-test-correlator".to_string(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn publish_then_consume_task() {
        let broker = NatsBroker::connect(test_settings()).await.unwrap();
        let id = RequestId::generate();
        let payload = TaskEnvelope::new("fine", "en", id.clone()).to_vec().unwrap();

        broker.publish(Channel::Tasks, &id, payload.into()).await.unwrap();

        let mut deliveries = broker.subscribe(Channel::Tasks).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let task = TaskEnvelope::from_slice(delivery.payload()).unwrap();
        assert_eq!(task.request_id, id);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn every_broker_sees_every_result() {
        let first = NatsBroker::connect(test_settings()).await.unwrap();
        let second = NatsBroker::connect(test_settings()).await.unwrap();
        let mut first_results = first.subscribe(Channel::Results).await.unwrap();
        let mut second_results = second.subscribe(Channel::Results).await.unwrap();

        let id = RequestId::generate();
        first
            .publish(Channel::Results, &id, Bytes::from_static(b"{}"))
            .await
            .unwrap();

        for deliveries in [&mut first_results, &mut second_results] {
            let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(delivery.payload(), b"{}");
            delivery.ack().await.unwrap();
        }
    }
}
