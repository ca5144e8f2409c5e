//! In-Process Event Bus
//!
//! Broadcast-channel bus implementing `EventPublisher`. A dispatcher task
//! fans received envelopes out through a `SubscriberRegistry`; raw
//! receivers are also available for tests that want to observe traffic
//! directly.

use futures::StreamExt;
use relaykit_domain::event_bus::{
    EventEnvelope, EventPublisher, PublishOutcome, SubscriberRegistry,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

const DEFAULT_CAPACITY: usize = 1024;

pub struct InMemoryEventBus {
    sender: broadcast::Sender<EventEnvelope>,
    // Keeps the channel open so publishing without subscribers succeeds.
    _keepalive: broadcast::Receiver<EventEnvelope>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, keepalive) = broadcast::channel(capacity);
        Self {
            sender,
            _keepalive: keepalive,
        }
    }

    /// Raw channel receiver, for tests and ad-hoc consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Spawn a task that dispatches every bus message through `registry`.
    pub fn spawn_dispatcher(&self, registry: SubscriberRegistry) -> DispatcherHandle {
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let mut stream = BroadcastStream::new(self.sender.subscribe());

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Event dispatcher shutting down");
                        break;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(envelope)) => {
                                let summary = registry.dispatch(&envelope).await;
                                debug!(
                                    topic = envelope.topic,
                                    handlers = summary.handlers_run,
                                    failures = summary.failures,
                                    "Dispatched event"
                                );
                            }
                            // A lagged receiver skips dropped messages and
                            // keeps going.
                            Some(Err(_)) => continue,
                            None => break,
                        }
                    }
                }
            }
        });

        DispatcherHandle { shutdown, task }
    }
}

#[async_trait::async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> PublishOutcome {
        // The keepalive receiver guarantees at least one subscriber, so
        // sending cannot fail.
        let _ = self.sender.send(envelope.clone());
        PublishOutcome::Delivered
    }
}

/// Handle for stopping a spawned dispatcher.
pub struct DispatcherHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}
