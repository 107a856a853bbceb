//! End-to-end pipeline tests against the in-memory broker.
//!
//! All tests run on a paused tokio clock; backoff waits and the dead-letter
//! quarantine advance virtually instead of in wall-clock time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use agora_core::{
    BoxFuture, BrokerError, DeliveryStream, Envelope, EventType, MessageBroker, ProcessFuture,
    ProcessingError, ProcessingOrder, Processor, QueueTopology,
};
use agora_runtime::{ConsumerError, EventRouter, QueueConsumer, RetryPolicy};
use agora_testing::{CountingProcessor, FlakyProcessor, InMemoryBroker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn topology() -> QueueTopology {
    QueueTopology::builder("community.events", "community.search.indexing")
        .quarantine_ttl(Duration::from_secs(60))
        .processing_order(ProcessingOrder::Sequential)
        .build()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("condition not met within the virtual deadline");
}

/// Declare the topology up front (the consumer redeclares it, identically)
/// so the test can publish before the consumer task gets scheduled.
async fn spawn_consumer<M>(
    broker: &InMemoryBroker,
    topology: QueueTopology,
    processor: Arc<dyn Processor<M>>,
) -> (
    tokio::task::JoinHandle<Result<(), ConsumerError>>,
    tokio::sync::watch::Sender<bool>,
)
where
    M: serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let broker: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    broker.declare_topology(&topology).await.unwrap();
    let (mut consumer, shutdown) = QueueConsumer::new(broker, topology, processor);
    let handle = tokio::spawn(async move { consumer.start().await });
    (handle, shutdown)
}

#[tokio::test(start_paused = true)]
async fn message_is_acked_after_transient_failures_recover() {
    let broker = InMemoryBroker::new();
    let processor = Arc::new(FlakyProcessor::new(2));
    let (handle, shutdown) =
        spawn_consumer::<Envelope>(&broker, topology(), processor.clone() as _).await;

    let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    // 2 failures, 2 backoff waits, then one successful terminal attempt.
    wait_until(|| processor.attempts() == 3).await;
    assert_eq!(broker.queue_depth("community.events.dead-dlq"), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_message_lands_in_the_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let processor = Arc::new(FlakyProcessor::new(usize::MAX));
    let (handle, shutdown) =
        spawn_consumer::<Envelope>(&broker, topology(), processor.clone() as _).await;

    let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    // Initial attempt + 5 retries, never acknowledged, then quarantined.
    wait_until(|| broker.queue_depth("community.events.dead-dlq") == 1).await;
    assert_eq!(processor.attempts(), 6);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn quarantined_message_reappears_and_gets_a_fresh_cycle() {
    let broker = InMemoryBroker::new();
    // Fails the entire first attempt cycle, succeeds on the first attempt of
    // the second one.
    let processor = Arc::new(FlakyProcessor::new(6));
    let (handle, shutdown) =
        spawn_consumer::<Envelope>(&broker, topology(), processor.clone() as _).await;

    let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    wait_until(|| processor.attempts() == 7).await;
    wait_until(|| broker.queue_depth("community.events.dead-dlq") == 0).await;

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unknown_event_types_are_swallowed_not_retried() {
    let broker = InMemoryBroker::new();
    let indexer = Arc::new(CountingProcessor::new());
    let router = EventRouter::builder()
        .register(EventType::ChangedTopic, indexer.clone() as _)
        .build();
    let (handle, shutdown) =
        spawn_consumer::<Envelope>(&broker, topology(), Arc::new(router) as _).await;

    // An event type from a newer producer version.
    let unknown = serde_json::json!({
        "eventType": "minted.badge",
        "entityId": Uuid::new_v4(),
        "occurredAt": chrono::Utc::now(),
    });
    broker
        .publish(
            "community.events",
            "minted.badge",
            &serde_json::to_vec(&unknown).unwrap(),
        )
        .await
        .unwrap();

    let known = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &known.to_bytes().unwrap())
        .await
        .unwrap();

    wait_until(|| indexer.calls() == 1).await;
    // The unknown event was acknowledged, not dead-lettered.
    assert_eq!(broker.queue_depth("community.events.dead-dlq"), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn undecodable_payloads_are_dead_lettered() {
    let broker = InMemoryBroker::new();
    let indexer = Arc::new(CountingProcessor::new());
    let (handle, shutdown) =
        spawn_consumer::<Envelope>(&broker, topology(), indexer.clone() as _).await;

    broker
        .publish("community.events", "changed.topic", b"not json")
        .await
        .unwrap();

    wait_until(|| broker.queue_depth("community.events.dead-dlq") == 1).await;
    assert_eq!(indexer.calls(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn sequential_queue_preserves_delivery_order() {
    struct Recording {
        seen: Mutex<Vec<u64>>,
    }

    impl Processor<Envelope> for Recording {
        fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
            Box::pin(async move {
                let revision = envelope
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("revision"))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                self.seen.lock().unwrap().push(revision);
                Ok(())
            })
        }
    }

    let broker = InMemoryBroker::new();
    let recording = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
    });
    let (handle, shutdown) = spawn_consumer(&broker, topology(), recording.clone() as _).await;

    let entity = Uuid::new_v4();
    for revision in 1..=2u64 {
        let envelope = Envelope::new(EventType::ChangedTopic, entity)
            .with_payload(serde_json::json!({ "revision": revision }));
        broker
            .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
            .await
            .unwrap();
    }

    wait_until(|| recording.seen.lock().unwrap().len() == 2).await;
    // Last write wins: the E2 state is what the projection ends on.
    assert_eq!(*recording.seen.lock().unwrap(), vec![1, 2]);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn topology_conflict_is_fatal_at_startup() {
    let broker = InMemoryBroker::new();
    // Broker state that disagrees with the consumer's descriptor.
    let diverged = QueueTopology::builder("community.events", "community.search.indexing")
        .quarantine_ttl(Duration::from_secs(5))
        .build();
    broker.declare_topology(&diverged).await.unwrap();

    let processor: Arc<dyn Processor<Envelope>> = Arc::new(CountingProcessor::new());
    let (mut consumer, _shutdown) =
        QueueConsumer::new(Arc::new(broker) as _, topology(), processor);

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, ConsumerError::Topology(_)));
}

#[tokio::test(start_paused = true)]
async fn subscribe_guard_gives_up_after_bounded_retries() {
    struct UnreachableBroker;

    impl MessageBroker for UnreachableBroker {
        fn declare_topology<'a>(
            &'a self,
            _topology: &'a QueueTopology,
        ) -> BoxFuture<'a, Result<(), BrokerError>> {
            Box::pin(async move { Ok(()) })
        }

        fn subscribe<'a>(
            &'a self,
            topology: &'a QueueTopology,
        ) -> BoxFuture<'a, Result<DeliveryStream, BrokerError>> {
            Box::pin(async move {
                Err(BrokerError::SubscribeFailed {
                    queue: topology.queue.clone(),
                    reason: "connection refused".to_string(),
                })
            })
        }

        fn publish<'a>(
            &'a self,
            exchange: &'a str,
            _routing_key: &'a str,
            _payload: &'a [u8],
        ) -> BoxFuture<'a, Result<(), BrokerError>> {
            Box::pin(async move {
                Err(BrokerError::PublishFailed {
                    exchange: exchange.to_string(),
                    reason: "connection refused".to_string(),
                })
            })
        }
    }

    let processor: Arc<dyn Processor<Envelope>> = Arc::new(CountingProcessor::new());
    let (mut consumer, _shutdown) =
        QueueConsumer::new(Arc::new(UnreachableBroker), topology(), processor);

    let err = consumer.start().await.unwrap_err();
    match err {
        ConsumerError::Subscribe { attempts, .. } => assert_eq!(attempts, 6),
        other => panic!("expected subscribe exhaustion, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_scheduled_retries_and_leaves_the_delivery_unsettled() {
    let broker = InMemoryBroker::new();
    broker.declare_topology(&topology()).await.unwrap();

    let processor = Arc::new(FlakyProcessor::new(usize::MAX));
    let broker_dyn: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let (consumer, shutdown) =
        QueueConsumer::<Envelope>::new(broker_dyn, topology(), processor.clone() as _);
    let mut consumer = consumer.with_message_retry(
        RetryPolicy::builder()
            .initial_delay(Duration::from_secs(300))
            .build(),
    );
    let handle = tokio::spawn(async move { consumer.start().await });

    let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    wait_until(|| processor.attempts() == 1).await;

    let signalled_at = tokio::time::Instant::now();
    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // The attempt in flight finished; the retry scheduled behind the 300 s
    // backoff never ran, and the consumer did not sit out the wait.
    assert_eq!(processor.attempts(), 1);
    assert!(signalled_at.elapsed() < Duration::from_secs(300));
    // Neither acknowledged nor dead-lettered: the broker gets it back.
    assert_eq!(broker.queue_depth("community.events.dead-dlq"), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_queue_keeps_processing_while_a_message_backs_off() {
    struct Selective {
        poison_attempts: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl Processor<Envelope> for Selective {
        fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
            Box::pin(async move {
                let name = envelope
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if name == "poison" {
                    self.poison_attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ProcessingError::Transient("index store offline".to_string()))
                } else {
                    self.delivered.lock().unwrap().push(name);
                    Ok(())
                }
            })
        }
    }

    let concurrent = QueueTopology::builder("community.events", "community.search.indexing")
        .quarantine_ttl(Duration::from_secs(60))
        .processing_order(ProcessingOrder::Concurrent { max_in_flight: 4 })
        .build();

    let broker = InMemoryBroker::new();
    let selective = Arc::new(Selective {
        poison_attempts: AtomicUsize::new(0),
        delivered: Mutex::new(Vec::new()),
    });
    let (handle, shutdown) = spawn_consumer(&broker, concurrent, selective.clone() as _).await;

    for name in ["poison", "healthy"] {
        let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4())
            .with_payload(serde_json::json!({ "name": name }));
        broker
            .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
            .await
            .unwrap();
    }

    wait_until(|| selective.delivered.lock().unwrap().len() == 1).await;
    // The healthy message finished while the poisoned one was still inside
    // its retry budget; a sequential queue would hold it back for the whole
    // chain.
    assert!(selective.poison_attempts.load(Ordering::SeqCst) < 6);
    assert_eq!(
        *selective.delivered.lock().unwrap(),
        vec!["healthy".to_string()]
    );

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn requeue_alert_threshold_never_drops_the_message() {
    let broker = InMemoryBroker::new();
    broker.declare_topology(&topology()).await.unwrap();

    // Fails its whole first cycle, succeeds right after the quarantine.
    let processor = Arc::new(FlakyProcessor::new(6));
    let broker_dyn: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let (consumer, shutdown) =
        QueueConsumer::<Envelope>::new(broker_dyn, topology(), processor.clone() as _);
    let mut consumer = consumer.with_requeue_alert_threshold(1);
    let handle = tokio::spawn(async move { consumer.start().await });

    let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    // The second-cycle delivery carries a requeue count at the threshold,
    // trips the alert, and still gets its full attempt cycle.
    wait_until(|| processor.attempts() == 7).await;
    wait_until(|| broker.queue_depth("community.events.dead-dlq") == 0).await;

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_intake_and_returns_cleanly() {
    let broker = InMemoryBroker::new();
    let processor = Arc::new(CountingProcessor::new());
    let (handle, shutdown) =
        spawn_consumer::<Envelope>(&broker, topology(), processor.clone() as _).await;

    let envelope = Envelope::new(EventType::NewUser, Uuid::new_v4());
    broker
        .publish("community.events", "new.user", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    wait_until(|| processor.calls() == 1).await;
    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn custom_retry_policy_bounds_the_attempt_count() {
    let broker = InMemoryBroker::new();
    broker.declare_topology(&topology()).await.unwrap();

    let processor = Arc::new(FlakyProcessor::new(usize::MAX));
    let broker_dyn: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let (consumer, shutdown) =
        QueueConsumer::<Envelope>::new(broker_dyn, topology(), processor.clone() as _);
    let mut consumer = consumer.with_message_retry(
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(10))
            .build(),
    );
    let handle = tokio::spawn(async move { consumer.start().await });

    let envelope = Envelope::new(EventType::ChangedTopic, Uuid::new_v4());
    broker
        .publish("community.events", "changed.topic", &envelope.to_bytes().unwrap())
        .await
        .unwrap();

    wait_until(|| broker.queue_depth("community.events.dead-dlq") == 1).await;
    assert_eq!(processor.attempts(), 2);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
