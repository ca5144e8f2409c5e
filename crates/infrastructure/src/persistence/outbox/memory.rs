//! In-Memory Outbox Store
//!
//! Mirrors the PostgreSQL store's state machine over a plain vector. Used
//! by tests and single-process setups; the injectable clock makes backoff
//! and stale-claim behavior deterministic.

use chrono::{DateTime, Utc};
use relaykit_domain::clock::{Clock, SystemClock};
use relaykit_domain::outbox::{
    BackoffPolicy, ClaimedRecord, NewOutboxRecord, OutboxError, OutboxRecord, OutboxStats,
    OutboxStatus, OutboxStore,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new(BackoffPolicy::standard())
    }
}

impl InMemoryOutboxStore {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self::with_clock(backoff, Arc::new(SystemClock))
    }

    pub fn with_clock(backoff: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            backoff,
            clock,
        }
    }

    /// Snapshot of every record, for assertions.
    pub fn all(&self) -> Vec<OutboxRecord> {
        self.records.lock().unwrap().clone()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: NewOutboxRecord) -> Result<Uuid, OutboxError> {
        let id = Uuid::new_v4();
        let now = self.now();
        self.records.lock().unwrap().push(OutboxRecord {
            id,
            tenant_id: record.tenant_id,
            aggregate_id: record.aggregate_id,
            aggregate_type: record.aggregate_type,
            topic: record.topic,
            occurred_at: record.occurred_at,
            payload: record.payload,
            metadata: record.metadata,
            routing_key: record.routing_key,
            status: OutboxStatus::New,
            retry_count: 0,
            retry_after: None,
            error_message: None,
            claimed_at: None,
            created_at: now,
        });
        Ok(id)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        tenant_id: &str,
    ) -> Result<Vec<ClaimedRecord>, OutboxError> {
        let now = self.now();
        let mut records = self.records.lock().unwrap();

        // Oldest first, matching the SQL claim order.
        let mut eligible: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.tenant_id == tenant_id && r.is_claimable(now))
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by_key(|&i| records[i].created_at);
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for i in eligible {
            let record = &mut records[i];
            record.status = OutboxStatus::Publishing;
            record.claimed_at = Some(now);
            claimed.push(record.to_claimed());
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records
            .iter_mut()
            .find(|r| r.id == id && !r.status.is_terminal())
        {
            record.status = OutboxStatus::Sent;
            record.claimed_at = None;
            record.error_message = None;
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error_message: &str) -> Result<OutboxStatus, OutboxError> {
        let now = self.now();
        let mut records = self.records.lock().unwrap();
        let record = records.iter_mut().find(|r| r.id == id).ok_or_else(|| {
            OutboxError::InfrastructureError {
                message: format!("Outbox record {} not found", id),
            }
        })?;

        if record.status.is_terminal() {
            return Ok(record.status);
        }

        record.retry_count += 1;
        record.error_message = Some(error_message.to_string());
        record.claimed_at = None;
        if self.backoff.is_exhausted(record.retry_count) {
            record.status = OutboxStatus::Dead;
            record.retry_after = None;
        } else {
            record.status = OutboxStatus::Failed;
            record.retry_after = Some(self.backoff.next_retry_at(now, record.retry_count));
        }
        Ok(record.status)
    }

    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let now = self.now();
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut records = self.records.lock().unwrap();
        let mut released = 0;
        for record in records.iter_mut().filter(|r| {
            r.status == OutboxStatus::Publishing
                && r.claimed_at.map(|t| t < cutoff).unwrap_or(false)
        }) {
            record.retry_count += 1;
            record.error_message = Some("stale claim released".to_string());
            record.claimed_at = None;
            // The lost attempt counts toward the ceiling.
            if self.backoff.is_exhausted(record.retry_count) {
                record.status = OutboxStatus::Dead;
                record.retry_after = None;
            } else {
                record.status = OutboxStatus::Failed;
                record.retry_after = Some(now);
            }
            released += 1;
        }
        Ok(released)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn stats(&self, tenant_id: &str) -> Result<OutboxStats, OutboxError> {
        let now = self.now();
        let records = self.records.lock().unwrap();
        let mut stats = OutboxStats::default();
        let mut oldest_unsent: Option<DateTime<Utc>> = None;

        for record in records.iter().filter(|r| r.tenant_id == tenant_id) {
            match record.status {
                OutboxStatus::New => stats.new_count += 1,
                OutboxStatus::Publishing => stats.publishing_count += 1,
                OutboxStatus::Sent => stats.sent_count += 1,
                OutboxStatus::Failed => stats.failed_count += 1,
                OutboxStatus::Dead => stats.dead_count += 1,
            }
            if !record.status.is_terminal() {
                oldest_unsent = Some(match oldest_unsent {
                    Some(t) => t.min(record.created_at),
                    None => record.created_at,
                });
            }
        }

        stats.oldest_unsent_age_seconds =
            oldest_unsent.map(|t| now.signed_duration_since(t).num_seconds());
        Ok(stats)
    }

    async fn cleanup_sent(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let cutoff = self.now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| !(r.status == OutboxStatus::Sent && r.created_at < cutoff));
        Ok((before - records.len()) as u64)
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<bool, OutboxError> {
        let mut records = self.records.lock().unwrap();
        match records
            .iter_mut()
            .find(|r| r.id == id && r.status == OutboxStatus::Dead)
        {
            Some(record) => {
                record.status = OutboxStatus::New;
                record.retry_after = None;
                record.claimed_at = None;
                record.error_message = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
