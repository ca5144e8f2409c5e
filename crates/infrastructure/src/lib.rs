// relaykit - Infrastructure Layer
// Concrete adapters behind the domain ports:
// - persistence: PostgreSQL and in-memory outbox stores
// - messaging: in-process event bus feeding the subscriber registry

pub mod messaging;
pub mod persistence;

pub use messaging::InMemoryEventBus;
pub use persistence::outbox::{InMemoryOutboxStore, PostgresOutboxStore};
