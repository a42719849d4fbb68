use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventstore_core::{CreatorId, EventType, ExpectedVersion};

use crate::aggregate::Aggregate;
use crate::unique_constraint::UniqueConstraint;

/// A caller's intent to append one event to an aggregate.
///
/// Commands are **transient**: they are built by a command handler, handed to
/// `Pusher::push` and either become events or are rejected as a whole batch.
/// They carry no identity of their own until persisted.
///
/// ## Optimistic concurrency
///
/// `expected_version` is the aggregate version the caller observed before this
/// command applies. Within a batch, later commands for the same aggregate see
/// the version produced by earlier ones, so a caller that read version 1 and
/// pushes three commands uses `Exact(1)` on the first and `Any` (or `Exact(2)`,
/// `Exact(3)`) on the rest.
///
/// ## Unique constraints
///
/// Constraints are evaluated in declaration order when the command is pushed.
/// For equivalence they form an unordered set: see [`Command::is_equivalent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub aggregate: Aggregate,
    pub creator: CreatorId,
    pub event_type: EventType,
    /// Schema revision of the payload.
    pub revision: u16,
    pub payload: JsonValue,
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraint>,
    #[serde(default)]
    pub expected_version: ExpectedVersion,
}

impl Command {
    pub fn new(aggregate: Aggregate, event_type: impl Into<EventType>) -> Self {
        Self {
            aggregate,
            creator: CreatorId::new("system"),
            event_type: event_type.into(),
            revision: 1,
            payload: JsonValue::Null,
            unique_constraints: Vec::new(),
            expected_version: ExpectedVersion::Any,
        }
    }

    pub fn creator(mut self, creator: impl Into<CreatorId>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn revision(mut self, revision: u16) -> Self {
        self.revision = revision;
        self
    }

    pub fn json_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize a typed payload into the command.
    pub fn payload<P: Serialize>(mut self, payload: &P) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    pub fn expect_version(mut self, expected: ExpectedVersion) -> Self {
        self.expected_version = expected;
        self
    }

    /// Structural equivalence used by test doubles.
    ///
    /// Aggregate, creator, type, revision and payload must be equal;
    /// unique constraints are compared as a multiset, so their order never
    /// matters. The expected version is not part of the caller's intent and is
    /// ignored.
    pub fn is_equivalent(&self, other: &Command) -> bool {
        self.aggregate == other.aggregate
            && self.creator == other.creator
            && self.event_type == other.event_type
            && self.revision == other.revision
            && self.payload == other.payload
            && same_elements(&self.unique_constraints, &other.unique_constraints)
    }
}

fn same_elements(left: &[UniqueConstraint], right: &[UniqueConstraint]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut unmatched: Vec<&UniqueConstraint> = right.iter().collect();
    for c in left {
        match unmatched.iter().position(|candidate| *candidate == c) {
            Some(idx) => {
                unmatched.swap_remove(idx);
            }
            None => return false,
        }
    }
    true
}
