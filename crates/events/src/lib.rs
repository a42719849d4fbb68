//! Event & command model of the event store.
//!
//! Commands are what callers push; events are what the store persisted. Both
//! are plain data: all behavior (ordering, uniqueness, timestamps) belongs to
//! the store implementations in `eventstore-infra`.

pub mod aggregate;
pub mod command;
pub mod event;
pub mod registry;
pub mod unique_constraint;

pub use aggregate::Aggregate;
pub use command::Command;
pub use event::{Event, EventTag};
pub use registry::{DecodeError, EventRegistry};
pub use unique_constraint::{ConstraintScope, UniqueConstraint, UniqueConstraintAction, UniqueKey};
