//! Strongly-typed identifiers used across the event store.
//!
//! Identifiers are opaque strings issued by callers (instance IDs, organization
//! IDs, user IDs, ...). The newtypes keep them from being mixed up at call sites.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a tenant (an instance). Every stream is partitioned by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

/// Organization that owns an aggregate within an instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceOwner(String);

/// Identifier of an aggregate within its type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

/// Type of an aggregate (e.g. "user", "org", "session").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

/// Type of an event (e.g. "user.human.added").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

/// Identity that issued a command (user or system account).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreatorId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a raw value without validation.
            ///
            /// Emptiness is rejected where it matters (on push); use `parse`
            /// to validate eagerly.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Parse a value, rejecting empty or whitespace-only input.
            pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::EmptyIdentifier { kind: $name });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

impl_string_newtype!(InstanceId, "InstanceId");
impl_string_newtype!(ResourceOwner, "ResourceOwner");
impl_string_newtype!(AggregateId, "AggregateId");
impl_string_newtype!(AggregateType, "AggregateType");
impl_string_newtype!(EventType, "EventType");
impl_string_newtype!(CreatorId, "CreatorId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_identifiers() {
        assert_eq!(
            InstanceId::parse("").unwrap_err().to_string(),
            "InstanceId must not be empty"
        );
        assert!(AggregateId::parse("   ").is_err());
        assert_eq!(InstanceId::parse("I1").unwrap().as_str(), "I1");
    }

    #[test]
    fn serializes_transparently() {
        let id = AggregateType::new("user");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user\"");
        let back: AggregateType = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn from_str_uses_validation() {
        assert!("".parse::<EventType>().is_err());
        assert_eq!("user.added".parse::<EventType>().unwrap().to_string(), "user.added");
    }
}
