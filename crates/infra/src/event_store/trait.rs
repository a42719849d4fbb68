use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use eventstore_core::InstanceId;
use eventstore_events::{Aggregate, Command, DecodeError, Event, UniqueKey};

use super::query::{SearchQuery, Watermark};

/// Coarse classification of an [`EventStoreError`].
///
/// Protocol servers map these to user-facing errors; callers use
/// [`EventStoreError::is_retryable`] to decide between retry and abort.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another writer advanced an aggregate first. Re-read state and resubmit.
    ConcurrencyConflict,
    /// A unique key is already reserved. Retrying the same intent cannot succeed.
    ConstraintViolation,
    /// Malformed command or query. A caller bug.
    InvalidCommand,
    /// An event payload has no registered decoder.
    UnknownEventType,
    /// The substrate is unreachable or too slow. Retry with backoff.
    StorageUnavailable,
}

/// Event store operation error.
///
/// Every failure carries its kind plus the offending key (aggregate, unique
/// key, instance) so the caller can decide what to do. The store never retries
/// internally, and a failed push never leaves a partial write behind.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("concurrency conflict on aggregate {aggregate}: {detail}")]
    ConcurrencyConflict { aggregate: Aggregate, detail: String },

    #[error("unique constraint violated: {key}: {}", .message.as_deref().unwrap_or("already exists"))]
    ConstraintViolation { key: UniqueKey, message: Option<String> },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("instance not provisioned: {0}")]
    InstanceNotProvisioned(InstanceId),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl EventStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EventStoreError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            EventStoreError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            EventStoreError::InvalidCommand(_)
            | EventStoreError::InvalidQuery(_)
            | EventStoreError::InstanceNotProvisioned(_) => ErrorKind::InvalidCommand,
            EventStoreError::Decode(DecodeError::UnknownEventType(_)) => ErrorKind::UnknownEventType,
            EventStoreError::Decode(DecodeError::InvalidPayload { .. }) => ErrorKind::InvalidCommand,
            EventStoreError::StorageUnavailable(_) | EventStoreError::Timeout(_) => {
                ErrorKind::StorageUnavailable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrencyConflict | ErrorKind::StorageUnavailable
        )
    }

    pub(crate) fn lock_poisoned() -> Self {
        EventStoreError::StorageUnavailable("lock poisoned".to_string())
    }
}

/// Write side of the event store.
///
/// `push` persists a batch of commands as one atomic unit:
///
/// - every command becomes an event, or none does
/// - each aggregate's expected version is checked against its current version
///   (optimistic, no locks held across calls)
/// - unique constraints are reserved/released in declaration order
/// - each event gets the next sequence of its aggregate and the next position
///   of its instance
/// - the creation timestamp is the commit instant, assigned by the store
///
/// Returned events are in input order.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError>;
}

/// Read side and tenant lifecycle of the event store.
///
/// Reads are scoped by instance: `filter` and `latest_sequence` reject a query
/// without instance IDs. A query that matches nothing yields an empty result,
/// never an error.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Events matching `query`, ordered by position in the query's direction.
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError>;

    /// The newest event matching `query`, or [`Watermark::zero`].
    async fn latest_sequence(&self, query: &SearchQuery) -> Result<Watermark, EventStoreError>;

    /// Distinct, sorted instance IDs having at least one event matching `query`.
    async fn instance_ids(&self, query: &SearchQuery) -> Result<Vec<InstanceId>, EventStoreError>;

    /// Provision an instance so events can be pushed to it. Idempotent.
    async fn create_instance(&self, instance_id: &InstanceId) -> Result<(), EventStoreError>;

    /// Liveness of the underlying storage. Never mutates state.
    async fn health(&self) -> Result<(), EventStoreError>;
}

/// The complete event store: the six operations callers depend on.
pub trait EventStore: Pusher + Querier {}

impl<T> EventStore for T where T: Pusher + Querier + ?Sized {}

#[async_trait]
impl<S> Pusher for Arc<S>
where
    S: Pusher + ?Sized,
{
    async fn push(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError> {
        (**self).push(commands).await
    }
}

#[async_trait]
impl<S> Querier for Arc<S>
where
    S: Querier + ?Sized,
{
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        (**self).filter(query).await
    }

    async fn latest_sequence(&self, query: &SearchQuery) -> Result<Watermark, EventStoreError> {
        (**self).latest_sequence(query).await
    }

    async fn instance_ids(&self, query: &SearchQuery) -> Result<Vec<InstanceId>, EventStoreError> {
        (**self).instance_ids(query).await
    }

    async fn create_instance(&self, instance_id: &InstanceId) -> Result<(), EventStoreError> {
        (**self).create_instance(instance_id).await
    }

    async fn health(&self) -> Result<(), EventStoreError> {
        (**self).health().await
    }
}
