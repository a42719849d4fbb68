//! Append-only, multi-tenant event store.
//!
//! Callers depend on the [`Pusher`] and [`Querier`] traits (or their union
//! [`EventStore`]). Two backends implement them with identical semantics:
//! [`InMemoryEventStore`] for tests/dev and [`PostgresEventStore`] for
//! durable deployments.

pub(crate) mod batch;
pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;
pub mod unique;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{Order, SearchQuery, Watermark};
pub use r#trait::{ErrorKind, EventStore, EventStoreError, Pusher, Querier};
pub use unique::{ConstraintChanges, UniqueConstraintIndex};
