//! Event Bus Ports and Subscriber Registry
//!
//! The publisher port is the transport seam the relay and the router call
//! into; the registry is the consuming-side dispatch point. Publish results
//! are an explicit outcome enum rather than error control flow, so the
//! relay's ack/fail branching is a plain match.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::outbox::{ClaimedRecord, NewOutboxRecord};

/// Decoded event as seen by publishers and handlers.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub topic: String,
    pub payload: Value,
    pub metadata: Value,
    pub routing_key: String,
    pub correlation_id: Option<String>,
}

impl EventEnvelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        let topic = topic.into();
        Self {
            routing_key: topic.clone(),
            topic,
            payload,
            metadata: serde_json::json!({}),
            correlation_id: None,
        }
    }

    /// Envelope for a claimed outbox record.
    pub fn from_claimed(record: &ClaimedRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
            routing_key: record.routing_key.clone(),
            correlation_id: correlation_id_from(&record.metadata),
        }
    }

    /// Envelope for a record that has not been persisted (sync fast path).
    pub fn from_new_record(record: &NewOutboxRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
            routing_key: record.effective_routing_key().to_string(),
            correlation_id: correlation_id_from(&record.metadata),
        }
    }
}

fn correlation_id_from(metadata: &Value) -> Option<String> {
    metadata
        .get("correlation_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Result of a publish attempt at the transport boundary.
///
/// Transient and permanent failures follow the same retry cycle up to the
/// attempt ceiling; the distinction is kept for logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Transport failure expected to heal (connection reset, timeout)
    Transient(String),
    /// Broker rejected the message (malformed payload, unknown topic)
    Permanent(String),
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            PublishOutcome::Delivered => None,
            PublishOutcome::Transient(reason) | PublishOutcome::Permanent(reason) => Some(reason),
        }
    }
}

/// Fire-and-forget publish primitive over the message bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> PublishOutcome;
}

/// Error returned by a consuming-side handler.
#[derive(Debug, thiserror::Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

/// Topics a handler wants to receive.
#[derive(Debug, Clone)]
pub enum Subscription {
    /// Every topic
    All,
    /// An explicit topic list
    Topics(Vec<String>),
}

impl Subscription {
    pub fn topic(topic: impl Into<String>) -> Self {
        Subscription::Topics(vec![topic.into()])
    }
}

/// Consuming-side event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;

    fn handler_name(&self) -> &str;

    fn subscription(&self) -> Subscription;
}

/// Outcome of dispatching one envelope through the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub handlers_run: usize,
    pub failures: usize,
}

/// Explicit, owned subscriber registry.
///
/// Built once at the composition root and passed by handle to whatever
/// drives dispatch; isolated registries keep tests independent. Handler
/// failures are logged, never retried here — retry happens upstream in the
/// relay, before delivery.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    by_topic: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    wildcard: Vec<Arc<dyn EventHandler>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handler: Arc<dyn EventHandler>) {
        match handler.subscription() {
            Subscription::All => self.wildcard.push(handler),
            Subscription::Topics(topics) => {
                for topic in topics {
                    self.by_topic.entry(topic).or_default().push(handler.clone());
                }
            }
        }
    }

    /// Handlers registered for `topic`, wildcard subscribers included.
    pub fn matching(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut merged: Vec<Arc<dyn EventHandler>> = Vec::new();
        if let Some(list) = self.by_topic.get(topic) {
            merged.extend(list.iter().cloned());
        }
        merged.extend(self.wildcard.iter().cloned());
        merged
    }

    /// Run every matching handler for `envelope`.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for handler in self.matching(&envelope.topic) {
            summary.handlers_run += 1;
            if let Err(e) = handler.handle(envelope).await {
                summary.failures += 1;
                warn!(
                    handler = handler.handler_name(),
                    topic = envelope.topic,
                    error = %e,
                    "Event handler failed"
                );
            }
        }
        summary
    }
}
