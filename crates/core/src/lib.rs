//! `eventstore-core`: shared building blocks of the event store.
//!
//! This crate contains **pure** primitives (no storage or IO concerns): the
//! identifiers that scope every stream and the optimistic concurrency
//! expectation carried by commands.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, AggregateType, CreatorId, EventType, InstanceId, ResourceOwner};
pub use version::ExpectedVersion;
