//! Outbox Record Model
//!
//! Domain model for outbox records used in the Transactional Outbox Pattern.
//! One row per event; only the relay and the publish router mutate a row
//! after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant used when callers do not partition their events.
pub const DEFAULT_TENANT: &str = "default";

/// Delivery status of an outbox record.
///
/// Transitions are monotonic except for the `Failed -> Publishing` retry
/// cycle. `Sent` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Created, never claimed
    New,
    /// Claimed by a relay worker; publish in flight
    Publishing,
    /// Delivered to the event bus; terminal
    Sent,
    /// Publish attempt failed; eligible for re-claim once retry_after passes
    Failed,
    /// Retry budget exhausted; terminal, kept for manual inspection
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Publishing => "PUBLISHING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "NEW" => Ok(OutboxStatus::New),
            "PUBLISHING" => Ok(OutboxStatus::Publishing),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DEAD" => Ok(OutboxStatus::Dead),
            _ => Err(OutboxError::InfrastructureError {
                message: format!("Invalid outbox status: {}", s),
            }),
        }
    }

    /// Terminal statuses are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Dead)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error types for outbox operations
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Infrastructure error: {message}")]
    InfrastructureError { message: String },
}

/// An outbox record ready to be inserted.
///
/// Built by application code and appended inside the business transaction;
/// the server assigns `id`, `status` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub tenant_id: String,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    pub topic: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub routing_key: Option<String>,
}

impl NewOutboxRecord {
    /// Create a record for `topic` carrying `payload`, occurring now.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tenant_id: DEFAULT_TENANT.to_string(),
            aggregate_id: None,
            aggregate_type: None,
            topic: topic.into(),
            occurred_at: Utc::now(),
            payload,
            metadata: serde_json::json!({}),
            routing_key: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Back-reference to the originating business entity. Informational
    /// only; never used for locking.
    pub fn with_aggregate(
        mut self,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
    ) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Transport routing key, falling back to the topic.
    pub fn effective_routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.topic)
    }
}

/// A full view of a stored outbox record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    pub topic: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub routing_key: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Whether a claim at `now` may pick this record up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::New => true,
            OutboxStatus::Failed => self.retry_after.map(|t| t <= now).unwrap_or(true),
            _ => false,
        }
    }

    /// Age of the row since insertion.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Snapshot sufficient to publish without re-reading the row.
    pub fn to_claimed(&self) -> ClaimedRecord {
        ClaimedRecord {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            topic: self.topic.clone(),
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            routing_key: self
                .routing_key
                .clone()
                .unwrap_or_else(|| self.topic.clone()),
            retry_count: self.retry_count,
        }
    }
}

/// Snapshot of a record handed to a relay worker by `claim_batch`.
///
/// The routing key is already resolved (topic fallback applied), so the
/// worker can publish without touching the database again.
#[derive(Debug, Clone)]
pub struct ClaimedRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub topic: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub routing_key: String,
    pub retry_count: i32,
}
