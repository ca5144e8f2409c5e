//! Outbox Relay
//!
//! Background worker that drains the outbox store into the event bus with
//! at-least-once delivery: claim a batch, publish each record, acknowledge
//! or fail. Any number of relay instances may run against the same store;
//! the claim operation partitions the backlog between them.
//!
//! A single failed iteration never stops the loop: infrastructure errors
//! are logged and the next tick retries. Records whose worker died
//! mid-publish are recovered by the periodic stale-claim sweep.

use crate::event_bus::{EventEnvelope, EventPublisher, PublishOutcome};
use crate::outbox::{OutboxError, OutboxStatus, OutboxStore, DEFAULT_TENANT};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Configuration for a relay worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum records claimed per batch (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle sleep between polls when the backlog is empty (default: 250ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often to sweep for stale claims (default: 10s)
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    /// Age at which a PUBLISHING claim is considered abandoned (default: 30s)
    #[serde(default = "default_stale_claim_timeout_ms")]
    pub stale_claim_timeout_ms: u64,

    /// Tenant this worker drains (default: "default")
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_batch_size() -> usize {
    50
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_reclaim_interval_ms() -> u64 {
    10_000
}

fn default_stale_claim_timeout_ms() -> u64 {
    30_000
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            stale_claim_timeout_ms: default_stale_claim_timeout_ms(),
            tenant_id: default_tenant(),
        }
    }
}

/// Counters exposed by a relay worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayMetrics {
    pub batches_processed: u64,
    pub records_published: u64,
    pub records_failed: u64,
    pub records_dead_lettered: u64,
    pub stale_claims_released: u64,
    pub last_batch_size: usize,
}

impl RelayMetrics {
    fn record_batch(&mut self, size: usize) {
        self.batches_processed += 1;
        self.last_batch_size = size;
    }

    fn record_published(&mut self) {
        self.records_published += 1;
    }

    fn record_failed(&mut self) {
        self.records_failed += 1;
    }

    fn record_dead_lettered(&mut self) {
        self.records_dead_lettered += 1;
    }

    fn record_stale_released(&mut self, count: u64) {
        self.stale_claims_released += count;
    }
}

/// The relay worker. Generic over the store and the publisher so tests can
/// run it against in-memory implementations.
pub struct Relay<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: RelayConfig,
    metrics: Arc<Mutex<RelayMetrics>>,
    shutdown: broadcast::Sender<()>,
}

impl<S, P> Relay<S, P>
where
    S: OutboxStore + 'static,
    P: EventPublisher + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: RelayConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            store,
            publisher,
            config,
            metrics: Arc::new(Mutex::new(RelayMetrics::default())),
            shutdown,
        }
    }

    /// Snapshot of the worker's counters.
    pub fn metrics(&self) -> RelayMetrics {
        *self.metrics.lock().unwrap()
    }

    /// Spawn the worker loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> RelayHandle {
        let shutdown = self.shutdown.clone();
        let relay = self.clone();
        let task = tokio::spawn(async move { relay.run().await });
        RelayHandle { shutdown, task }
    }

    /// Run the claim -> publish -> ack loop until shutdown.
    pub async fn run(&self) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            tenant_id = self.config.tenant_id,
            "Starting outbox relay"
        );

        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reclaim =
            tokio::time::interval(Duration::from_millis(self.config.reclaim_interval_ms));
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Outbox relay shutting down");
                    break;
                }
                _ = reclaim.tick() => {
                    self.release_stale().await;
                }
                _ = poll.tick() => {
                    if self.drain_backlog(&mut shutdown_rx).await {
                        info!("Outbox relay shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process batches back-to-back while full batches keep coming.
    /// Returns true if a shutdown signal arrived between batches.
    async fn drain_backlog(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        loop {
            match self.process_batch().await {
                Ok(claimed) if claimed >= self.config.batch_size => {}
                Ok(_) => return false,
                Err(e) => {
                    warn!(error = %e, "Outbox batch failed, will retry on next tick");
                    return false;
                }
            }
            // Between batches is the only place a busy worker checks for
            // shutdown; in-flight records are already acked or failed.
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => return true,
            }
        }
    }

    /// Claim and publish one batch. Returns the number of claimed records.
    pub async fn process_batch(&self) -> Result<usize, OutboxError> {
        let batch = self
            .store
            .claim_batch(self.config.batch_size, &self.config.tenant_id)
            .await?;

        if batch.is_empty() {
            return Ok(0);
        }

        debug!(count = batch.len(), "Claimed outbox batch");
        let claimed = batch.len();

        for record in &batch {
            let envelope = EventEnvelope::from_claimed(record);
            match self.publisher.publish(&envelope).await {
                PublishOutcome::Delivered => {
                    self.store.acknowledge(record.id).await?;
                    self.metrics.lock().unwrap().record_published();
                    debug!(
                        event_id = %record.id,
                        topic = record.topic,
                        "Outbox record published"
                    );
                }
                outcome => {
                    let reason = outcome.failure_reason().unwrap_or("unknown");
                    let status = self.store.fail(record.id, reason).await?;
                    let mut metrics = self.metrics.lock().unwrap();
                    if status == OutboxStatus::Dead {
                        metrics.record_dead_lettered();
                        error!(
                            event_id = %record.id,
                            topic = record.topic,
                            retry_count = record.retry_count + 1,
                            error = reason,
                            "Outbox record dead-lettered after exhausting retries"
                        );
                    } else {
                        metrics.record_failed();
                        warn!(
                            event_id = %record.id,
                            topic = record.topic,
                            retry_count = record.retry_count + 1,
                            error = reason,
                            "Publish failed, scheduled for retry"
                        );
                    }
                }
            }
        }

        self.metrics.lock().unwrap().record_batch(claimed);
        Ok(claimed)
    }

    async fn release_stale(&self) {
        let timeout = Duration::from_millis(self.config.stale_claim_timeout_ms);
        match self.store.release_stale_claims(timeout).await {
            Ok(0) => {}
            Ok(count) => {
                self.metrics.lock().unwrap().record_stale_released(count);
                warn!(count, "Released stale outbox claims");
            }
            Err(e) => {
                warn!(error = %e, "Stale claim sweep failed");
            }
        }
    }
}

/// Handle for stopping a spawned relay and waiting for it to exit.
pub struct RelayHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Ask the worker to stop after its current batch.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker loop to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
