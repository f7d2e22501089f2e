//! Durable stores for stratus operations and orchestrations.
//!
//! Two implementations with identical semantics: [`InMemoryStore`] for
//! development and tests, and [`PostgresStore`] for production. Every update
//! is optimistic: the caller hands back the record at the version it read,
//! the store bumps the version, and a stale version yields
//! [`StoreError::Conflict`].

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{ChildPage, OperationStore, OrchestrationStore, StoreError};
