//! Publish Router (hybrid bus)
//!
//! Per-topic policy deciding how latency and durability trade off when an
//! event is published:
//!
//! - `SyncOnly`: direct publish, no outbox row. Lowest latency, no
//!   durability; for best-effort events only.
//! - `AsyncOnly`: outbox row only; the relay owns delivery.
//! - `Hybrid`: outbox row first, then a bounded best-effort immediate
//!   publish. Fast-path success acknowledges the row; any fast-path
//!   failure leaves the row for the relay and still reports success,
//!   because durability was already achieved.
//!
//! The durable write always happens before any network call; durability
//! never depends on network success.

use crate::event_bus::{EventEnvelope, EventPublisher, PublishOutcome};
use crate::outbox::{NewOutboxRecord, OutboxError, OutboxStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// How an event reaches the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishStrategy {
    SyncOnly,
    AsyncOnly,
    Hybrid,
}

/// Strategy table resolved per publish call.
///
/// Resolution order: per-call override, then topic, then bounded context
/// (topic prefix before the first `.`), then the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_strategy")]
    pub default_strategy: PublishStrategy,

    /// Exact topic -> strategy
    #[serde(default)]
    pub by_topic: HashMap<String, PublishStrategy>,

    /// Bounded context (topic prefix) -> strategy
    #[serde(default)]
    pub by_context: HashMap<String, PublishStrategy>,

    /// Upper bound on the hybrid fast-path publish attempt (default: 2s)
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

fn default_strategy() -> PublishStrategy {
    PublishStrategy::AsyncOnly
}

fn default_sync_timeout_ms() -> u64 {
    2_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            by_topic: HashMap::new(),
            by_context: HashMap::new(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl RouterConfig {
    pub fn with_topic(mut self, topic: impl Into<String>, strategy: PublishStrategy) -> Self {
        self.by_topic.insert(topic.into(), strategy);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>, strategy: PublishStrategy) -> Self {
        self.by_context.insert(context.into(), strategy);
        self
    }

    pub fn with_default(mut self, strategy: PublishStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Resolve the strategy for `topic`.
    pub fn resolve(&self, topic: &str, override_strategy: Option<PublishStrategy>) -> PublishStrategy {
        if let Some(strategy) = override_strategy {
            return strategy;
        }
        if let Some(strategy) = self.by_topic.get(topic) {
            return *strategy;
        }
        let context = topic.split('.').next().unwrap_or(topic);
        if let Some(strategy) = self.by_context.get(context) {
            return *strategy;
        }
        self.default_strategy
    }
}

/// Error types for router publishes
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The durable write failed; the caller's operation must not be
    /// considered complete.
    #[error("Outbox write failed: {0}")]
    Store(#[from] OutboxError),

    /// A SyncOnly publish failed; there is no durable fallback.
    #[error("Synchronous publish of '{topic}' failed: {reason}")]
    SyncPublish { topic: String, reason: String },
}

/// Counters per routing decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterMetrics {
    pub sync_only_total: u64,
    pub async_only_total: u64,
    pub hybrid_total: u64,
    /// Hybrid fast-path publishes that landed immediately
    pub fast_path_delivered: u64,
    /// Hybrid publishes left to the relay after a failed fast path
    pub relay_fallbacks: u64,
}

/// Where the router left the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Published directly; nothing persisted.
    Sync,
    /// Durably staged; the relay will deliver it.
    Staged(Uuid),
    /// Durably staged and already delivered via the fast path.
    StagedAndDelivered(Uuid),
}

impl Routed {
    pub fn record_id(&self) -> Option<Uuid> {
        match self {
            Routed::Sync => None,
            Routed::Staged(id) | Routed::StagedAndDelivered(id) => Some(*id),
        }
    }
}

/// The hybrid publish router.
pub struct PublishRouter<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: RouterConfig,
    metrics: Arc<Mutex<RouterMetrics>>,
}

impl<S, P> PublishRouter<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: RouterConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            metrics: Arc::new(Mutex::new(RouterMetrics::default())),
        }
    }

    pub fn metrics(&self) -> RouterMetrics {
        *self.metrics.lock().unwrap()
    }

    /// Publish with the configured strategy for the record's topic.
    pub async fn publish(&self, record: NewOutboxRecord) -> Result<Routed, RouterError> {
        self.publish_with_strategy(record, None).await
    }

    /// Publish with an explicit per-call strategy override.
    pub async fn publish_with_strategy(
        &self,
        record: NewOutboxRecord,
        override_strategy: Option<PublishStrategy>,
    ) -> Result<Routed, RouterError> {
        let strategy = self.config.resolve(&record.topic, override_strategy);
        debug!(topic = record.topic, strategy = ?strategy, "Routing publish");

        match strategy {
            PublishStrategy::SyncOnly => self.publish_sync(record).await,
            PublishStrategy::AsyncOnly => {
                let id = self.store.append(record).await?;
                self.metrics.lock().unwrap().async_only_total += 1;
                Ok(Routed::Staged(id))
            }
            PublishStrategy::Hybrid => self.publish_hybrid(record).await,
        }
    }

    async fn publish_sync(&self, record: NewOutboxRecord) -> Result<Routed, RouterError> {
        let envelope = EventEnvelope::from_new_record(&record);
        self.metrics.lock().unwrap().sync_only_total += 1;
        match self.publisher.publish(&envelope).await {
            PublishOutcome::Delivered => Ok(Routed::Sync),
            outcome => Err(RouterError::SyncPublish {
                topic: record.topic,
                reason: outcome.failure_reason().unwrap_or("unknown").to_string(),
            }),
        }
    }

    async fn publish_hybrid(&self, record: NewOutboxRecord) -> Result<Routed, RouterError> {
        // Durable write first; only then is the network touched.
        let envelope = EventEnvelope::from_new_record(&record);
        let id = self.store.append(record).await?;
        self.metrics.lock().unwrap().hybrid_total += 1;

        let timeout = Duration::from_millis(self.config.sync_timeout_ms);
        let attempt = tokio::time::timeout(timeout, self.publisher.publish(&envelope)).await;

        match attempt {
            Ok(PublishOutcome::Delivered) => {
                // Ack so the relay does not deliver a duplicate. The row is
                // already durable and the publish landed, so an ack failure
                // must not fail the call: the row stays claimable and the
                // relay redelivers, a duplicate consumers tolerate anyway.
                if let Err(e) = self.store.acknowledge(id).await {
                    warn!(
                        event_id = %id,
                        topic = envelope.topic,
                        error = %e,
                        "Fast path delivered but acknowledge failed, relay may redeliver"
                    );
                }
                self.metrics.lock().unwrap().fast_path_delivered += 1;
                debug!(event_id = %id, topic = envelope.topic, "Fast path delivered");
                Ok(Routed::StagedAndDelivered(id))
            }
            Ok(outcome) => {
                self.metrics.lock().unwrap().relay_fallbacks += 1;
                warn!(
                    event_id = %id,
                    topic = envelope.topic,
                    error = outcome.failure_reason().unwrap_or("unknown"),
                    "Fast path failed, relay will deliver"
                );
                Ok(Routed::Staged(id))
            }
            Err(_) => {
                self.metrics.lock().unwrap().relay_fallbacks += 1;
                warn!(
                    event_id = %id,
                    topic = envelope.topic,
                    timeout_ms = self.config.sync_timeout_ms,
                    "Fast path timed out, relay will deliver"
                );
                Ok(Routed::Staged(id))
            }
        }
    }
}
