use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventstore_core::{AggregateType, CreatorId, EventType};

use crate::aggregate::Aggregate;
use crate::command::Command;
use crate::unique_constraint::UniqueConstraint;

/// A persisted, immutable fact.
///
/// An event keeps every attribute of the command it was created from and adds
/// what only the store can assign:
///
/// - `sequence`: position within the aggregate stream (1, 2, 3, ... no gaps)
/// - `position`: position within the whole instance, the only cross-aggregate order
/// - `created_at`: the commit instant; events of one push share it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub aggregate: Aggregate,
    pub creator: CreatorId,
    pub event_type: EventType,
    pub revision: u16,
    pub payload: JsonValue,
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraint>,

    pub sequence: u64,
    pub position: u64,
    pub created_at: DateTime<Utc>,
}

/// Decoding key of an event payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTag {
    pub aggregate_type: AggregateType,
    pub event_type: EventType,
    pub revision: u16,
}

impl EventTag {
    pub fn new(
        aggregate_type: impl Into<AggregateType>,
        event_type: impl Into<EventType>,
        revision: u16,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            revision,
        }
    }
}

impl core::fmt::Display for EventTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}@v{}", self.aggregate_type, self.event_type, self.revision)
    }
}

impl Event {
    /// Materialize a command with the metadata assigned at commit time.
    pub fn from_command(command: Command, sequence: u64, position: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate: command.aggregate,
            creator: command.creator,
            event_type: command.event_type,
            revision: command.revision,
            payload: command.payload,
            unique_constraints: command.unique_constraints,
            sequence,
            position,
            created_at,
        }
    }

    pub fn tag(&self) -> EventTag {
        EventTag {
            aggregate_type: self.aggregate.aggregate_type.clone(),
            event_type: self.event_type.clone(),
            revision: self.revision,
        }
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        P::deserialize(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_command_keeps_command_attributes() {
        let cmd = Command::new(Aggregate::new("I1", "O1", "user", "U1"), "user.added")
            .creator("admin")
            .revision(2)
            .json_payload(json!({"name": "alice"}));
        let now = Utc::now();

        let event = Event::from_command(cmd, 1, 7, now);

        assert_eq!(event.creator.as_str(), "admin");
        assert_eq!(event.sequence, 1);
        assert_eq!(event.position, 7);
        assert_eq!(event.created_at, now);
        assert_eq!(event.tag(), EventTag::new("user", "user.added", 2));
        assert_eq!(event.tag().to_string(), "user:user.added@v2");
    }

    #[test]
    fn decode_reads_payload() {
        #[derive(Deserialize)]
        struct Added {
            name: String,
        }

        let cmd = Command::new(Aggregate::new("I1", "O1", "user", "U1"), "user.added")
            .json_payload(json!({"name": "alice"}));
        let event = Event::from_command(cmd, 1, 1, Utc::now());

        let added: Added = event.decode().unwrap();
        assert_eq!(added.name, "alice");
    }
}
