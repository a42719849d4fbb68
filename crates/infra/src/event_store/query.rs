//! Read-side query model.
//!
//! A `SearchQuery` is pure data: a conjunction of predicates plus ordering and
//! an optional limit. Empty collections mean "no restriction". The same query
//! can be reused for `filter`, `latest_sequence` and `instance_ids`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventstore_core::{AggregateId, AggregateType, CreatorId, EventType, InstanceId, ResourceOwner};
use eventstore_events::Event;

use super::r#trait::EventStoreError;

/// Delivery order by position.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Filter criteria for event queries.
///
/// - `sequence_from` / `sequence_to` are inclusive bounds on the aggregate sequence.
/// - `created_from` is inclusive, `created_before` is exclusive.
/// - `position_after` is an exclusive resume cursor. Positions are per
///   instance, so the cursor is meaningful for single-instance queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub instance_ids: Vec<InstanceId>,
    pub resource_owner: Option<ResourceOwner>,
    pub creator: Option<CreatorId>,
    pub aggregate_types: Vec<AggregateType>,
    pub aggregate_ids: Vec<AggregateId>,
    pub event_types: Vec<EventType>,
    pub sequence_from: Option<u64>,
    pub sequence_to: Option<u64>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub position_after: Option<u64>,
    pub order: Order,
    pub limit: Option<u32>,
}

impl SearchQuery {
    /// Query scoped to a single instance.
    pub fn for_instance(instance_id: impl Into<InstanceId>) -> Self {
        Self {
            instance_ids: vec![instance_id.into()],
            ..Default::default()
        }
    }

    /// Query over every instance. Only `instance_ids` accepts it.
    pub fn all_instances() -> Self {
        Self::default()
    }

    pub fn instance(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_ids.push(instance_id.into());
        self
    }

    pub fn resource_owner(mut self, owner: impl Into<ResourceOwner>) -> Self {
        self.resource_owner = Some(owner.into());
        self
    }

    pub fn creator(mut self, creator: impl Into<CreatorId>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<AggregateType>) -> Self {
        self.aggregate_types.push(aggregate_type.into());
        self
    }

    pub fn aggregate_id(mut self, aggregate_id: impl Into<AggregateId>) -> Self {
        self.aggregate_ids.push(aggregate_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<EventType>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn sequence_from(mut self, sequence: u64) -> Self {
        self.sequence_from = Some(sequence);
        self
    }

    pub fn sequence_to(mut self, sequence: u64) -> Self {
        self.sequence_to = Some(sequence);
        self
    }

    pub fn created_from(mut self, at: DateTime<Utc>) -> Self {
        self.created_from = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn position_after(mut self, position: u64) -> Self {
        self.position_after = Some(position);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Desc;
        self
    }

    pub fn ascending(mut self) -> Self {
        self.order = Order::Asc;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every predicate (ordering and limit aside).
    pub fn matches(&self, event: &Event) -> bool {
        let aggregate = &event.aggregate;

        (self.instance_ids.is_empty() || self.instance_ids.contains(&aggregate.instance_id))
            && self
                .resource_owner
                .as_ref()
                .is_none_or(|owner| *owner == aggregate.resource_owner)
            && self.creator.as_ref().is_none_or(|creator| *creator == event.creator)
            && (self.aggregate_types.is_empty()
                || self.aggregate_types.contains(&aggregate.aggregate_type))
            && (self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&aggregate.aggregate_id))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.sequence_from.is_none_or(|from| event.sequence >= from)
            && self.sequence_to.is_none_or(|to| event.sequence <= to)
            && self.created_from.is_none_or(|at| event.created_at >= at)
            && self.created_before.is_none_or(|at| event.created_at < at)
            && self.position_after.is_none_or(|after| event.position > after)
    }

    /// Reject queries that are not scoped to at least one instance.
    pub(crate) fn ensure_scoped(&self) -> Result<(), EventStoreError> {
        if self.instance_ids.is_empty() {
            return Err(EventStoreError::InvalidQuery(
                "query must be scoped to at least one instance".to_string(),
            ));
        }
        self.ensure_well_formed()
    }

    pub(crate) fn ensure_well_formed(&self) -> Result<(), EventStoreError> {
        if let Some(idx) = self.instance_ids.iter().position(InstanceId::is_empty) {
            return Err(EventStoreError::InvalidQuery(format!(
                "instance id at index {idx} is empty"
            )));
        }
        Ok(())
    }
}

/// How far the log matching a query has progressed.
///
/// Projections compare watermarks to know whether they have caught up.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Position of the newest matching event (0 when none).
    pub position: u64,
    /// Aggregate sequence of that event (0 when none).
    pub sequence: u64,
    pub created_at: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.position == 0
    }

    pub(crate) fn of(event: &Event) -> Self {
        Self {
            position: event.position,
            sequence: event.sequence,
            created_at: Some(event.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_events::{Aggregate, Command};

    fn event(instance: &str, aggregate_type: &str, id: &str, sequence: u64, position: u64) -> Event {
        let cmd = Command::new(Aggregate::new(instance, "O1", aggregate_type, id), "thing.happened")
            .creator("admin");
        Event::from_command(cmd, sequence, position, Utc::now())
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(SearchQuery::all_instances().matches(&event("I1", "user", "U1", 1, 1)));
    }

    #[test]
    fn predicates_are_conjunctive() {
        let query = SearchQuery::for_instance("I1")
            .aggregate_type("user")
            .aggregate_type("org")
            .sequence_from(2)
            .sequence_to(3);

        assert!(query.matches(&event("I1", "org", "O9", 2, 5)));
        assert!(!query.matches(&event("I2", "org", "O9", 2, 5)));
        assert!(!query.matches(&event("I1", "session", "S1", 2, 5)));
        assert!(!query.matches(&event("I1", "user", "U1", 1, 1)));
        assert!(!query.matches(&event("I1", "user", "U1", 4, 9)));
    }

    #[test]
    fn position_cursor_is_exclusive() {
        let query = SearchQuery::for_instance("I1").position_after(3);
        assert!(!query.matches(&event("I1", "user", "U1", 1, 3)));
        assert!(query.matches(&event("I1", "user", "U1", 2, 4)));
    }

    #[test]
    fn created_range_includes_start_and_excludes_end() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(10);
        let at = |created_at| {
            let cmd = Command::new(Aggregate::new("I1", "O1", "user", "U1"), "user.added");
            Event::from_command(cmd, 1, 1, created_at)
        };
        let query = SearchQuery::for_instance("I1").created_from(start).created_before(end);

        assert!(query.matches(&at(start)));
        assert!(query.matches(&at(start + chrono::Duration::seconds(5))));
        assert!(!query.matches(&at(end)));
        assert!(!query.matches(&at(start - chrono::Duration::milliseconds(1))));
    }

    #[test]
    fn unscoped_query_is_rejected_for_reads() {
        assert!(matches!(
            SearchQuery::all_instances().ensure_scoped(),
            Err(EventStoreError::InvalidQuery(_))
        ));
        assert!(SearchQuery::for_instance("I1").ensure_scoped().is_ok());
        assert!(SearchQuery::for_instance("").ensure_scoped().is_err());
    }

    #[test]
    fn zero_watermark() {
        assert!(Watermark::zero().is_zero());
        assert!(!Watermark::of(&event("I1", "user", "U1", 1, 1)).is_zero());
    }
}
