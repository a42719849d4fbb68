//! Errors raised by the pure building blocks.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failure of an identifier or version check.
///
/// Storage failures are reported by `EventStoreError` in the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{kind} must not be empty")]
    EmptyIdentifier { kind: &'static str },

    #[error("expected version {expected}, found version {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
}
