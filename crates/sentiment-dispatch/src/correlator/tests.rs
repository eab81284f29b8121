use super::*;
use crate::testing::{MemoryBroker, result_payload};
use tokio::time::Instant;

fn fast_config() -> CorrelatorConfig {
    CorrelatorConfig {
        task_timeout: Duration::from_secs(30),
        eviction_interval: Duration::from_secs(5),
        resubscribe_delay: Duration::from_millis(10),
    }
}

fn start(config: CorrelatorConfig) -> (Arc<MemoryBroker>, AsyncCorrelator) {
    let broker = Arc::new(MemoryBroker::new());
    let correlator = AsyncCorrelator::start(broker.clone(), config);
    (broker, correlator)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn result_completes_submission() {
    let (broker, correlator) = start(fast_config());

    let submission = correlator.submit("a good day", "en").await.unwrap();
    assert_eq!(correlator.pending_len(), 1);

    let published = broker.published(Channel::Tasks);
    assert_eq!(published.len(), 1);
    let task = TaskEnvelope::from_slice(&published[0].1).unwrap();
    assert_eq!(task.request_id, submission.request_id);
    assert_eq!(task.language, "en");

    broker.answer_published_tasks();
    let result = submission.completion.await.unwrap();

    assert_eq!(result.text, "a good day");
    assert_eq!(result.request_id, submission.request_id);
    assert_eq!(result.sentiment, "positive");
    assert_eq!(correlator.pending_len(), 0);
}

#[tokio::test]
async fn duplicate_delivery_is_ignored() {
    let (broker, correlator) = start(fast_config());
    let submission = correlator.submit("bad", "en").await.unwrap();

    let payload = result_payload("bad", &submission.request_id);
    broker.inject(Channel::Results, payload.clone());
    broker.inject(Channel::Results, payload);

    let result = submission.completion.await.unwrap();
    assert_eq!(result.sentiment, "negative");
    eventually(|| broker.ack_count() == 2).await;
    assert_eq!(correlator.pending_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_resolve_exactly_once() {
    const N: usize = 1_000;
    let (broker, correlator) = start(fast_config());
    let correlator = Arc::new(correlator);

    // Answers tasks as they are published, racing the submitters.
    let answerer = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let mut answered = 0;
            while answered < N {
                let published = broker.published(Channel::Tasks);
                for (id, payload) in &published[answered..] {
                    let task = TaskEnvelope::from_slice(payload).unwrap();
                    broker.inject(Channel::Results, result_payload(&task.text, id));
                }
                answered = published.len();
                tokio::task::yield_now().await;
            }
        })
    };

    let submits: Vec<_> = (0..N)
        .map(|i| {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.submit(&format!("text {i}"), "en").await })
        })
        .collect();
    let mut submissions = Vec::with_capacity(N);
    for submit in submits {
        submissions.push(submit.await.unwrap().unwrap());
    }
    tokio::time::timeout(Duration::from_secs(10), answerer)
        .await
        .unwrap()
        .unwrap();

    for submission in submissions {
        let result = tokio::time::timeout(Duration::from_secs(10), submission.completion)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.request_id, submission.request_id);
    }
    assert_eq!(correlator.pending_len(), 0);
    eventually(|| broker.ack_count() == N).await;
}

#[tokio::test]
async fn result_arriving_before_publish_ack_is_not_lost() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_answer_on_publish(true);
    let correlator = AsyncCorrelator::start(broker.clone(), fast_config());

    let submission = correlator.submit("good timing", "en").await.unwrap();

    // Resolved before `submit` returned.
    assert_eq!(correlator.pending_len(), 0);
    assert_eq!(broker.ack_count(), 1);
    let result = submission.completion.await.unwrap();
    assert_eq!(result.request_id, submission.request_id);
    assert_eq!(result.text, "good timing");
}

#[tokio::test]
async fn failed_publish_leaves_nothing_registered() {
    let (broker, correlator) = start(fast_config());
    broker.set_fail_publish(true);

    let err = correlator.submit("hello", "en").await.unwrap_err();

    assert!(matches!(err, Error::DispatchFailed { .. }));
    assert_eq!(correlator.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_task_is_evicted_with_timeout() {
    let (_broker, correlator) = start(fast_config());
    let started = Instant::now();

    let submission = correlator.submit("never answered", "en").await.unwrap();
    let outcome = submission.completion.await;

    assert_eq!(outcome, Err(Error::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() <= Duration::from_secs(40));
    assert_eq!(correlator.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn tasks_are_evicted_while_results_are_unreachable() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_fail_subscribe(true);
    let correlator = AsyncCorrelator::start(broker.clone(), fast_config());
    let started = Instant::now();

    let submission = correlator.submit("never answered", "en").await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(600), submission.completion)
        .await
        .unwrap();

    assert_eq!(outcome, Err(Error::Timeout));
    assert!(started.elapsed() <= Duration::from_secs(40));
    assert!(broker.subscription_count() >= 2);
    assert_eq!(correlator.pending_len(), 0);
}

#[tokio::test]
async fn malformed_envelope_does_not_stop_consumption() {
    let (broker, correlator) = start(fast_config());
    let submission = correlator.submit("good", "en").await.unwrap();

    broker.inject(Channel::Results, &b"{not json"[..]);
    broker.inject(Channel::Results, &br#"{"request_id":"","sentiment":"x","score":0}"#[..]);
    broker.answer_published_tasks();

    assert!(submission.completion.await.is_ok());
    eventually(|| broker.ack_count() == 3).await;
}

#[tokio::test]
async fn lost_subscription_is_reestablished() {
    let (broker, correlator) = start(fast_config());
    let submission = correlator.submit("good", "en").await.unwrap();

    broker.inject_fault(Channel::Results, crate::broker::BrokerError::Receive("flap".into()));
    broker.close_subscription(Channel::Results);
    broker.answer_published_tasks();

    assert!(submission.completion.await.is_ok());
    assert!(broker.subscription_count() >= 2);
}

#[tokio::test]
async fn shutdown_cancels_pending_tasks() {
    let (_broker, correlator) = start(fast_config());
    let submission = correlator.submit("pending", "en").await.unwrap();

    correlator.shutdown().await;

    assert_eq!(submission.completion.await, Err(Error::Cancelled));
    assert_eq!(correlator.pending_len(), 0);
    assert_eq!(correlator.submit("late", "en").await.unwrap_err(), Error::Cancelled);
}
