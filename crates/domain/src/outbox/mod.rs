//! Transactional Outbox
//!
//! Durable staging queue for domain events, written in the same database
//! transaction as the business state they describe.

pub mod backoff;
pub mod model;
pub mod store;

pub use backoff::*;
pub use model::*;
pub use store::*;
