//! Outbox Store Ports
//!
//! Abstractions over outbox persistence. The store is the sole
//! synchronization point between relay workers: `claim_batch` must hand
//! each record to exactly one caller across processes.

use crate::outbox::{ClaimedRecord, NewOutboxRecord, OutboxError, OutboxRecord, OutboxStatus};
use sqlx::postgres::PgTransaction;
use std::time::Duration;
use uuid::Uuid;

/// Durable, concurrency-safe staging queue for outbox records.
///
/// All four mutation paths (`append`, `claim_batch`, `acknowledge`, `fail`)
/// go through this port; no other component writes to the outbox table.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a `NEW` record.
    ///
    /// Storage errors propagate to the caller so the enclosing business
    /// transaction fails with them. No side effect on the bus.
    async fn append(&self, record: NewOutboxRecord) -> Result<Uuid, OutboxError>;

    /// Claim up to `limit` records for `tenant_id` and flip them to
    /// `PUBLISHING` in the same atomic step.
    ///
    /// Eligible records are `NEW`, or `FAILED` with `retry_after` in the
    /// past, ordered by `created_at` ascending. Records claimed by a
    /// concurrent caller are skipped, never waited on; a smaller (or
    /// empty) batch is not an error.
    async fn claim_batch(
        &self,
        limit: usize,
        tenant_id: &str,
    ) -> Result<Vec<ClaimedRecord>, OutboxError>;

    /// Transition a record to `SENT`.
    ///
    /// Called by relay workers on claimed records and by the hybrid fast
    /// path on freshly appended ones. Idempotent: acknowledging a missing,
    /// already-`SENT` or `DEAD` record is a no-op.
    async fn acknowledge(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Record a failed publish attempt.
    ///
    /// Increments `retry_count`, stores `error_message`, and either
    /// schedules a retry (`FAILED` with a backoff-computed `retry_after`)
    /// or dead-letters the record (`DEAD`) when the attempt ceiling is
    /// reached. Returns the resulting status so callers can surface
    /// dead-lettering.
    async fn fail(&self, id: Uuid, error_message: &str) -> Result<OutboxStatus, OutboxError>;

    /// Release records stuck in `PUBLISHING` longer than `older_than`.
    ///
    /// A relay crash mid-batch leaves its claims in `PUBLISHING`; this
    /// sweep makes them re-claimable (counted as one failed attempt) so no
    /// record is lost to a dead worker. Returns the number released.
    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64, OutboxError>;

    /// Fetch a single record, for observability and tests.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError>;

    /// Counts per status for `tenant_id`, plus the age of the oldest
    /// unsent record. The dead count is the operator-facing alert signal.
    async fn stats(&self, tenant_id: &str) -> Result<OutboxStats, OutboxError>;

    /// Delete `SENT` records older than `older_than`. Returns the number
    /// deleted. Failed and dead records are kept for investigation.
    async fn cleanup_sent(&self, older_than: Duration) -> Result<u64, OutboxError>;

    /// Manual operator recovery: put a `DEAD` record back to `NEW`,
    /// keeping its retry history. Returns false if the record is missing
    /// or not dead.
    async fn requeue_dead(&self, id: Uuid) -> Result<bool, OutboxError>;
}

/// Transaction-scoped append, the heart of the pattern: the outbox row
/// commits or rolls back together with the business rows.
#[async_trait::async_trait]
pub trait OutboxStoreTx {
    /// Insert a `NEW` record within a caller-owned transaction.
    async fn append_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        record: NewOutboxRecord,
    ) -> Result<Uuid, OutboxError>;
}

/// Counts per status, for monitoring and alerting.
#[derive(Debug, Clone, Default)]
pub struct OutboxStats {
    pub new_count: u64,
    pub publishing_count: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub dead_count: u64,
    pub oldest_unsent_age_seconds: Option<i64>,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.new_count + self.publishing_count + self.sent_count + self.failed_count + self.dead_count
    }

    /// Records still awaiting delivery.
    pub fn backlog(&self) -> u64 {
        self.new_count + self.publishing_count + self.failed_count
    }

    pub fn has_backlog(&self) -> bool {
        self.backlog() > 0
    }

    /// Records that exhausted their retry budget and need an operator.
    pub fn has_dead_letters(&self) -> bool {
        self.dead_count > 0
    }
}
