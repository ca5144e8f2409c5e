//! End-to-end tests for the outbox pipeline: router -> store -> relay ->
//! bus -> subscriber registry, over the in-memory adapters.

use async_trait::async_trait;
use chrono::Utc;
use relaykit_domain::clock::{Clock, ManualClock};
use relaykit_domain::event_bus::{
    EventEnvelope, EventHandler, EventPublisher, HandlerError, PublishOutcome,
    SubscriberRegistry, Subscription,
};
use relaykit_domain::outbox::{
    BackoffPolicy, NewOutboxRecord, OutboxStatus, OutboxStore, DEFAULT_TENANT,
};
use relaykit_domain::relay::{Relay, RelayConfig};
use relaykit_domain::router::{PublishRouter, PublishStrategy, Routed, RouterConfig};
use relaykit_infrastructure::{InMemoryEventBus, InMemoryOutboxStore};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn deterministic_backoff() -> BackoffPolicy {
    BackoffPolicy::standard().without_jitter()
}

fn order_created() -> NewOutboxRecord {
    NewOutboxRecord::new("order.created", serde_json::json!({"order_id": "o-1"}))
        .with_aggregate("o-1", "Order")
}

/// Publisher that fails its first `failures` calls, then forwards to the
/// wrapped bus.
struct FlakyBus {
    inner: Arc<InMemoryEventBus>,
    failures: AtomicUsize,
}

impl FlakyBus {
    fn new(inner: Arc<InMemoryEventBus>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl EventPublisher for FlakyBus {
    async fn publish(&self, envelope: &EventEnvelope) -> PublishOutcome {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return PublishOutcome::Transient("ECONNRESET".to_string());
        }
        self.inner.publish(envelope).await
    }
}

/// Publisher that never delivers.
struct DownBus;

#[async_trait]
impl EventPublisher for DownBus {
    async fn publish(&self, _envelope: &EventEnvelope) -> PublishOutcome {
        PublishOutcome::Transient("connection refused".to_string())
    }
}

#[tokio::test]
async fn transient_failure_then_delivery() {
    // A publish attempt fails once with a connection reset, the record
    // waits out its backoff and the retry succeeds.
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(InMemoryOutboxStore::with_clock(
        deterministic_backoff(),
        Arc::new(clock.clone()),
    ));
    let bus = Arc::new(InMemoryEventBus::default());
    let mut rx = bus.subscribe();
    let publisher = FlakyBus::new(bus.clone(), 1);
    let relay = Relay::new(store.clone(), publisher, RelayConfig::default());

    let id = store.append(order_created()).await.unwrap();

    // First pass: claim, fail, schedule a retry 200ms out.
    relay.process_batch().await.unwrap();
    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Failed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.error_message.as_deref(), Some("ECONNRESET"));
    assert_eq!(
        record.retry_after.unwrap(),
        clock.now() + chrono::Duration::milliseconds(200)
    );

    // Not eligible until the backoff elapses.
    assert_eq!(relay.process_batch().await.unwrap(), 0);
    clock.advance(chrono::Duration::milliseconds(200));

    // Second pass delivers.
    relay.process_batch().await.unwrap();
    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Sent);

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.topic, "order.created");
    assert_eq!(envelope.payload["order_id"], "o-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claimers_get_disjoint_batches() {
    let store = Arc::new(InMemoryOutboxStore::new(deterministic_backoff()));
    for i in 0..20 {
        store
            .append(NewOutboxRecord::new(
                "order.created",
                serde_json::json!({"n": i}),
            ))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.claim_batch(5, DEFAULT_TENANT).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for claimed in task.await.unwrap() {
            assert!(seen.insert(claimed.id), "record claimed twice");
            total += 1;
        }
    }
    assert_eq!(total, 20);
    assert!(store
        .claim_batch(5, DEFAULT_TENANT)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn hybrid_fast_path_delivers_and_acks() {
    let store = Arc::new(InMemoryOutboxStore::new(deterministic_backoff()));
    let bus = Arc::new(InMemoryEventBus::default());
    let mut rx = bus.subscribe();
    let config = RouterConfig::default().with_default(PublishStrategy::Hybrid);
    let router = PublishRouter::new(store.clone(), bus.clone(), config);

    let routed = router.publish(order_created()).await.unwrap();
    let id = routed.record_id().unwrap();
    assert!(matches!(routed, Routed::StagedAndDelivered(_)));

    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Sent);
    assert_eq!(rx.recv().await.unwrap().topic, "order.created");

    // Nothing left for a relay to pick up.
    assert!(store
        .claim_batch(10, DEFAULT_TENANT)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn hybrid_falls_back_to_relay_when_bus_is_down() {
    let store = Arc::new(InMemoryOutboxStore::new(deterministic_backoff()));
    let config = RouterConfig::default().with_default(PublishStrategy::Hybrid);
    let router = PublishRouter::new(store.clone(), Arc::new(DownBus), config);

    // The caller sees success: the row is durable even though the bus is
    // unreachable.
    let routed = router.publish(order_created()).await.unwrap();
    let id = routed.record_id().unwrap();
    assert!(matches!(routed, Routed::Staged(_)));
    assert_eq!(
        store.find_by_id(id).await.unwrap().unwrap().status,
        OutboxStatus::New
    );

    // Once the bus heals, the relay delivers the record.
    let bus = Arc::new(InMemoryEventBus::default());
    let mut rx = bus.subscribe();
    let relay = Relay::new(store.clone(), bus, RelayConfig::default());
    relay.process_batch().await.unwrap();

    assert_eq!(
        store.find_by_id(id).await.unwrap().unwrap().status,
        OutboxStatus::Sent
    );
    assert_eq!(rx.recv().await.unwrap().topic, "order.created");
}

#[tokio::test]
async fn stale_claim_is_released_and_redelivered() {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(InMemoryOutboxStore::with_clock(
        deterministic_backoff(),
        Arc::new(clock.clone()),
    ));
    let id = store.append(order_created()).await.unwrap();

    // A worker claims the record and dies without acking.
    store.claim_batch(10, DEFAULT_TENANT).await.unwrap();
    assert_eq!(
        store.find_by_id(id).await.unwrap().unwrap().status,
        OutboxStatus::Publishing
    );

    clock.advance(chrono::Duration::seconds(31));
    let released = store
        .release_stale_claims(Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(released, 1);

    // A healthy relay picks it up on the next pass.
    let bus = Arc::new(InMemoryEventBus::default());
    let relay = Relay::new(store.clone(), bus, RelayConfig::default());
    relay.process_batch().await.unwrap();
    assert_eq!(
        store.find_by_id(id).await.unwrap().unwrap().status,
        OutboxStatus::Sent
    );
}

struct CollectingHandler {
    seen: AtomicUsize,
}

#[async_trait]
impl EventHandler for CollectingHandler {
    async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "collecting"
    }

    fn subscription(&self) -> Subscription {
        Subscription::topic("order.created")
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pipeline_from_router_to_handler() {
    let store = Arc::new(InMemoryOutboxStore::new(deterministic_backoff()));
    let bus = Arc::new(InMemoryEventBus::default());

    let handler = Arc::new(CollectingHandler {
        seen: AtomicUsize::new(0),
    });
    let mut registry = SubscriberRegistry::new();
    registry.subscribe(handler.clone());
    let dispatcher = bus.spawn_dispatcher(registry);

    let config = RelayConfig {
        poll_interval_ms: 10,
        ..Default::default()
    };
    let relay = Arc::new(Relay::new(store.clone(), bus.clone(), config));
    let relay_handle = relay.clone().spawn();

    // AsyncOnly staging: the relay owns delivery end to end.
    let router = PublishRouter::new(store.clone(), bus.clone(), RouterConfig::default());
    let mut ids = Vec::new();
    for i in 0..5 {
        let routed = router
            .publish(NewOutboxRecord::new(
                "order.created",
                serde_json::json!({"n": i}),
            ))
            .await
            .unwrap();
        ids.push(routed.record_id().unwrap());
    }

    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if handler.seen.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    relay_handle.shutdown();
    relay_handle.join().await;
    dispatcher.shutdown();
    dispatcher.join().await;

    assert_eq!(handler.seen.load(Ordering::SeqCst), 5);
    for id in ids {
        assert_eq!(
            store.find_by_id(id).await.unwrap().unwrap().status,
            OutboxStatus::Sent
        );
    }
}

#[tokio::test]
async fn acknowledging_twice_is_harmless() {
    let store = Arc::new(InMemoryOutboxStore::new(deterministic_backoff()));
    let id = store.append(order_created()).await.unwrap();
    store.claim_batch(10, DEFAULT_TENANT).await.unwrap();

    store.acknowledge(id).await.unwrap();
    store.acknowledge(id).await.unwrap();
    store.acknowledge(Uuid::new_v4()).await.unwrap();

    assert_eq!(
        store.find_by_id(id).await.unwrap().unwrap().status,
        OutboxStatus::Sent
    );
}
