//! Outbox store implementations.
//!
//! `PostgresOutboxStore` is the production adapter; `InMemoryOutboxStore`
//! backs tests and single-process wiring with the same state machine.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
