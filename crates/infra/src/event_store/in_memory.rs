use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use eventstore_core::InstanceId;
use eventstore_events::{Command, Event};

use super::batch::{self, StagedHeads, StreamHead, StreamKey};
use super::query::{Order, SearchQuery, Watermark};
use super::r#trait::{EventStoreError, Pusher, Querier};
use super::unique::{ConstraintChanges, UniqueConstraintIndex};

/// Log of one instance.
#[derive(Debug, Default)]
struct InstanceLog {
    /// Events in position order (position = index + 1).
    events: Vec<Event>,
    heads: HashMap<StreamKey, StreamHead>,
    /// Last assigned position.
    position: u64,
    last_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    instances: HashMap<InstanceId, InstanceLog>,
    constraints: UniqueConstraintIndex,
}

/// In-memory append-only event store.
///
/// The reference implementation of [`Pusher`] and [`Querier`]: every push runs
/// under one write lock, so the whole batch (events, stream heads, positions,
/// constraint reservations) is validated against a consistent state and then
/// committed at once. A failed push returns before anything is written.
///
/// Intended for tests/dev and as the behavioral model of the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_locked(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError> {
        let instance_id = batch::validate(&commands)?;

        let mut state = self.state.write().map_err(|_| EventStoreError::lock_poisoned())?;
        let State {
            instances,
            constraints,
        } = &mut *state;

        let log = instances
            .get_mut(&instance_id)
            .ok_or_else(|| EventStoreError::InstanceNotProvisioned(instance_id.clone()))?;

        // Stage the whole batch; nothing below touches `log` or `constraints`
        // until every command has been checked.
        let mut staged = StagedHeads::default();
        let mut changes = ConstraintChanges::default();
        let mut sequences = Vec::with_capacity(commands.len());

        for command in &commands {
            let key = StreamKey::of(command);
            let current = staged
                .get(&key)
                .or_else(|| log.heads.get(&key))
                .cloned()
                .unwrap_or_else(StreamHead::empty);

            let sequence = staged.advance(key, current, command)?;
            constraints.stage(&mut changes, &instance_id, &command.unique_constraints)?;
            sequences.push(sequence);
        }

        // Commit instant; never earlier than a previous commit of this instance.
        let created_at = match log.last_created_at {
            Some(last) => Utc::now().max(last),
            None => Utc::now(),
        };

        let mut committed = Vec::with_capacity(commands.len());
        for (command, sequence) in commands.into_iter().zip(sequences) {
            log.position += 1;
            let event = Event::from_command(command, sequence, log.position, created_at);
            log.events.push(event.clone());
            committed.push(event);
        }
        log.heads.extend(staged.into_heads());
        log.last_created_at = Some(created_at);
        constraints.commit(changes);

        Ok(committed)
    }

    /// Matching events across the queried instances, ordered by
    /// `(position, instance)` ascending.
    fn collect_matching(state: &State, query: &SearchQuery) -> Vec<Event> {
        let instances: BTreeSet<&InstanceId> = query.instance_ids.iter().collect();

        let mut matching: Vec<Event> = instances
            .into_iter()
            .filter_map(|id| state.instances.get(id))
            .flat_map(|log| log.events.iter())
            .filter(|e| query.matches(e))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.aggregate.instance_id.cmp(&b.aggregate.instance_id))
        });
        matching
    }
}

#[async_trait]
impl Pusher for InMemoryEventStore {
    #[instrument(skip(self, commands), fields(command_count = commands.len()), err)]
    async fn push(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError> {
        let committed = self.push_locked(commands)?;
        debug!(
            committed = committed.len(),
            last_position = committed.last().map(|e| e.position),
            "pushed events"
        );
        Ok(committed)
    }
}

#[async_trait]
impl Querier for InMemoryEventStore {
    #[instrument(skip(self, query), err)]
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        query.ensure_scoped()?;
        let state = self.state.read().map_err(|_| EventStoreError::lock_poisoned())?;

        let mut events = Self::collect_matching(&state, query);
        if query.order == Order::Desc {
            events.reverse();
        }
        if let Some(limit) = query.limit {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    #[instrument(skip(self, query), err)]
    async fn latest_sequence(&self, query: &SearchQuery) -> Result<Watermark, EventStoreError> {
        query.ensure_scoped()?;
        let state = self.state.read().map_err(|_| EventStoreError::lock_poisoned())?;

        Ok(Self::collect_matching(&state, query)
            .last()
            .map(Watermark::of)
            .unwrap_or_else(Watermark::zero))
    }

    #[instrument(skip(self, query), err)]
    async fn instance_ids(&self, query: &SearchQuery) -> Result<Vec<InstanceId>, EventStoreError> {
        query.ensure_well_formed()?;
        let state = self.state.read().map_err(|_| EventStoreError::lock_poisoned())?;

        let ids: BTreeSet<InstanceId> = state
            .instances
            .iter()
            .filter(|(id, _)| query.instance_ids.is_empty() || query.instance_ids.contains(id))
            .filter(|(_, log)| log.events.iter().any(|e| query.matches(e)))
            .map(|(id, _)| id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self, instance_id), fields(instance_id = %instance_id), err)]
    async fn create_instance(&self, instance_id: &InstanceId) -> Result<(), EventStoreError> {
        if instance_id.is_empty() {
            return Err(EventStoreError::InvalidCommand("instance id is empty".to_string()));
        }
        let mut state = self.state.write().map_err(|_| EventStoreError::lock_poisoned())?;
        state.instances.entry(instance_id.clone()).or_default();
        Ok(())
    }

    async fn health(&self) -> Result<(), EventStoreError> {
        self.state
            .read()
            .map(|_| ())
            .map_err(|_| EventStoreError::lock_poisoned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_core::ExpectedVersion;
    use eventstore_events::{Aggregate, UniqueConstraint};
    use serde_json::json;

    fn user(id: &str) -> Aggregate {
        Aggregate::new("I1", "O1", "user", id)
    }

    async fn store() -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        store.create_instance(&InstanceId::new("I1")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn push_assigns_sequences_and_positions() {
        let store = store().await;

        let events = store
            .push(vec![
                Command::new(user("U1"), "user.added"),
                Command::new(user("U2"), "user.added"),
                Command::new(user("U1"), "user.changed"),
            ])
            .await
            .unwrap();

        let seqs: Vec<_> = events.iter().map(|e| (e.sequence, e.position)).collect();
        assert_eq!(seqs, vec![(1, 1), (1, 2), (2, 3)]);
        assert!(events.iter().all(|e| e.created_at == events[0].created_at));
    }

    #[tokio::test]
    async fn push_into_unknown_instance_is_rejected() {
        let store = InMemoryEventStore::new();
        let err = store
            .push(vec![Command::new(user("U1"), "user.added")])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InstanceNotProvisioned(id) if id.as_str() == "I1"));
    }

    #[tokio::test]
    async fn conflict_in_last_command_discards_whole_batch() {
        let store = store().await;
        store.push(vec![Command::new(user("U1"), "user.added")]).await.unwrap();

        let err = store
            .push(vec![
                Command::new(user("U2"), "user.added")
                    .unique_constraint(UniqueConstraint::add("username", "bob", "taken")),
                Command::new(user("U1"), "user.changed").expect_version(ExpectedVersion::Exact(0)),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { .. }));

        let all = store.filter(&SearchQuery::for_instance("I1")).await.unwrap();
        assert_eq!(all.len(), 1);

        // bob's reservation was not kept
        store
            .push(vec![Command::new(user("U3"), "user.added")
                .unique_constraint(UniqueConstraint::add("username", "bob", "taken"))])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn positions_continue_after_failed_push() {
        let store = store().await;
        store.push(vec![Command::new(user("U1"), "user.added")]).await.unwrap();
        let _ = store
            .push(vec![Command::new(user("U1"), "x").expect_version(ExpectedVersion::Exact(5))])
            .await;
        let next = store.push(vec![Command::new(user("U2"), "user.added")]).await.unwrap();
        assert_eq!(next[0].position, 2);
    }

    #[tokio::test]
    async fn filter_honors_order_and_limit() {
        let store = store().await;
        for i in 0..5 {
            store
                .push(vec![Command::new(user("U1"), "user.changed").json_payload(json!({ "i": i }))])
                .await
                .unwrap();
        }

        let newest_two = store
            .filter(&SearchQuery::for_instance("I1").descending().limit(2))
            .await
            .unwrap();
        let seqs: Vec<_> = newest_two.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![5, 4]);
    }

    #[tokio::test]
    async fn create_instance_is_idempotent() {
        let store = store().await;
        store.push(vec![Command::new(user("U1"), "user.added")]).await.unwrap();
        store.create_instance(&InstanceId::new("I1")).await.unwrap();

        let events = store.filter(&SearchQuery::for_instance("I1")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(store.create_instance(&InstanceId::new(" ")).await.is_err());
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert!(InMemoryEventStore::new().health().await.is_ok());
    }
}
