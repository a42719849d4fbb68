//! Optimistic concurrency expectations.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for an aggregate.
///
/// The version of an aggregate is the sequence of its latest event (0 when the
/// aggregate has no events yet).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// Skip version checking (append on top of whatever is there).
    #[default]
    Any,
    /// Require the aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expect an aggregate that has no events yet.
    pub fn new_aggregate() -> Self {
        ExpectedVersion::Exact(0)
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => {
                Err(DomainError::VersionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}
