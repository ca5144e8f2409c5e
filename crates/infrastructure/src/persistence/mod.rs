//! Persistence adapters

pub mod outbox;
