// relaykit - Domain Layer
// Core of the transactional outbox pattern:
// - outbox: record model, store ports and backoff policy
// - event_bus: publisher/handler ports and the subscriber registry
// - relay: the claim -> publish -> ack background worker
// - router: per-topic hybrid publish strategy (sync / async / both)
// - clock: injectable time source for deterministic backoff tests

pub mod clock;
pub mod event_bus;
pub mod outbox;
pub mod relay;
pub mod router;

pub use clock::*;
pub use event_bus::*;
pub use outbox::*;
pub use relay::*;
pub use router::*;
