//! Validation and per-aggregate bookkeeping shared by every `Pusher`.

use std::collections::HashMap;

use eventstore_core::{AggregateId, AggregateType, InstanceId, ResourceOwner};
use eventstore_events::{Command, UniqueConstraintAction};
use serde_json::Value as JsonValue;

use super::r#trait::EventStoreError;

/// Stream identity within an instance.
///
/// The resource owner is an attribute of the stream, fixed by its first event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
}

impl StreamKey {
    pub fn of(command: &Command) -> Self {
        Self {
            aggregate_type: command.aggregate.aggregate_type.clone(),
            aggregate_id: command.aggregate.aggregate_id.clone(),
        }
    }
}

/// Latest known state of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamHead {
    pub version: u64,
    pub resource_owner: Option<ResourceOwner>,
}

impl StreamHead {
    pub fn empty() -> Self {
        Self {
            version: 0,
            resource_owner: None,
        }
    }
}

/// Validate a batch and return the instance it targets.
///
/// A batch is the atomic unit of one tenant, so it must not span instances.
pub(crate) fn validate(commands: &[Command]) -> Result<InstanceId, EventStoreError> {
    let first = commands
        .first()
        .ok_or_else(|| EventStoreError::InvalidCommand("no commands to push".to_string()))?;
    let instance_id = first.aggregate.instance_id.clone();

    for (idx, c) in commands.iter().enumerate() {
        let aggregate = &c.aggregate;
        if aggregate.instance_id != instance_id {
            return Err(EventStoreError::InvalidCommand(format!(
                "batch contains multiple instances (index {idx})"
            )));
        }
        if aggregate.instance_id.is_empty() {
            return Err(invalid(idx, "instance id is empty"));
        }
        if aggregate.resource_owner.is_empty() {
            return Err(invalid(idx, "resource owner is empty"));
        }
        if aggregate.aggregate_type.is_empty() {
            return Err(invalid(idx, "aggregate type is empty"));
        }
        if aggregate.aggregate_id.is_empty() {
            return Err(invalid(idx, "aggregate id is empty"));
        }
        if c.event_type.is_empty() {
            return Err(invalid(idx, "event type is empty"));
        }
        if c.creator.is_empty() {
            return Err(invalid(idx, "creator is empty"));
        }
        if !matches!(c.payload, JsonValue::Object(_) | JsonValue::Null) {
            return Err(invalid(idx, "payload must be a JSON object or null"));
        }
        for constraint in &c.unique_constraints {
            if constraint.action != UniqueConstraintAction::RemoveInstance
                && (constraint.unique_type.trim().is_empty() || constraint.unique_field.trim().is_empty())
            {
                return Err(invalid(idx, "unique constraint type and field must not be empty"));
            }
        }
    }

    Ok(instance_id)
}

fn invalid(idx: usize, reason: &str) -> EventStoreError {
    EventStoreError::InvalidCommand(format!("command {idx}: {reason}"))
}

/// Tracks stream heads while a batch is applied, on top of committed state.
#[derive(Debug, Default)]
pub(crate) struct StagedHeads {
    heads: HashMap<StreamKey, StreamHead>,
}

impl StagedHeads {
    pub fn get(&self, key: &StreamKey) -> Option<&StreamHead> {
        self.heads.get(key)
    }

    /// Check ownership and the expected version, then advance the head.
    ///
    /// Returns the sequence assigned to `command`.
    pub fn advance(
        &mut self,
        key: StreamKey,
        current: StreamHead,
        command: &Command,
    ) -> Result<u64, EventStoreError> {
        if let Some(owner) = &current.resource_owner {
            if *owner != command.aggregate.resource_owner {
                return Err(EventStoreError::InvalidCommand(format!(
                    "aggregate {} is owned by '{}', not '{}'",
                    command.aggregate, owner, command.aggregate.resource_owner
                )));
            }
        }
        command
            .expected_version
            .check(current.version)
            .map_err(|e| EventStoreError::ConcurrencyConflict {
                aggregate: command.aggregate.clone(),
                detail: e.to_string(),
            })?;

        let sequence = current.version + 1;
        self.heads.insert(
            key,
            StreamHead {
                version: sequence,
                resource_owner: Some(command.aggregate.resource_owner.clone()),
            },
        );
        Ok(sequence)
    }

    pub fn into_heads(self) -> HashMap<StreamKey, StreamHead> {
        self.heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_core::ExpectedVersion;
    use eventstore_events::{Aggregate, UniqueConstraint};
    use serde_json::json;

    fn cmd(instance: &str, id: &str) -> Command {
        Command::new(Aggregate::new(instance, "O1", "user", id), "user.added")
    }

    #[test]
    fn rejects_empty_batch() {
        assert!(matches!(validate(&[]), Err(EventStoreError::InvalidCommand(_))));
    }

    #[test]
    fn rejects_multi_instance_batch() {
        let err = validate(&[cmd("I1", "U1"), cmd("I2", "U2")]).unwrap_err();
        assert!(err.to_string().contains("multiple instances"));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(validate(&[cmd("I1", "")]).is_err());
        assert!(validate(&[cmd("I1", "U1").json_payload(json!([1, 2]))]).is_err());
        assert!(validate(&[cmd("I1", "U1").unique_constraint(UniqueConstraint::add("", "x", "m"))]).is_err());
        assert!(validate(&[cmd("I1", "U1").unique_constraint(UniqueConstraint::remove_instance())]).is_ok());
        assert_eq!(validate(&[cmd("I1", "U1"), cmd("I1", "U2")]).unwrap(), InstanceId::new("I1"));
    }

    #[test]
    fn advance_checks_version_and_owner() {
        let mut staged = StagedHeads::default();
        let first = cmd("I1", "U1").expect_version(ExpectedVersion::Exact(0));
        let key = StreamKey::of(&first);

        assert_eq!(staged.advance(key.clone(), StreamHead::empty(), &first).unwrap(), 1);

        let head = staged.get(&key).cloned().unwrap();
        let stale = cmd("I1", "U1").expect_version(ExpectedVersion::Exact(0));
        assert!(matches!(
            staged.advance(key.clone(), head.clone(), &stale),
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));

        let mut foreign = cmd("I1", "U1");
        foreign.aggregate.resource_owner = ResourceOwner::new("O2");
        assert!(matches!(
            staged.advance(key, head, &foreign),
            Err(EventStoreError::InvalidCommand(_))
        ));
    }
}
