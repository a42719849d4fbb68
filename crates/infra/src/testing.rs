//! Test double for callers of the event store.
//!
//! [`RecordingPusher`] wraps a real store (usually [`InMemoryEventStore`]),
//! records every batch handed to `push` and lets a test queue failures for
//! `push`, `filter`, `instance_ids` and `latest_sequence`.
//! Recorded batches are compared with [`Command::is_equivalent`], so the order
//! of unique constraints and the expected version do not matter.
//!
//! [`InMemoryEventStore`]: crate::event_store::InMemoryEventStore

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use eventstore_core::InstanceId;
use eventstore_events::{Command, Event};

use crate::event_store::{EventStoreError, Pusher, Querier, SearchQuery, Watermark};

#[derive(Debug, Default)]
struct Recording {
    batches: Vec<Vec<Command>>,
    push_failures: VecDeque<EventStoreError>,
    filter_failures: VecDeque<EventStoreError>,
    instance_ids_failures: VecDeque<EventStoreError>,
    latest_sequence_failures: VecDeque<EventStoreError>,
}

#[derive(Debug)]
pub struct RecordingPusher<S> {
    inner: S,
    recording: Mutex<Recording>,
}

impl<S> RecordingPusher<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recording: Mutex::new(Recording::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Make the next `push` fail with `err` without reaching the inner store.
    ///
    /// Failures queue up and are consumed in order.
    pub fn fail_next_push(&self, err: EventStoreError) {
        self.lock().push_failures.push_back(err);
    }

    /// Make the next `filter` fail with `err`.
    pub fn fail_next_filter(&self, err: EventStoreError) {
        self.lock().filter_failures.push_back(err);
    }

    /// Make the next `instance_ids` fail with `err`.
    pub fn fail_next_instance_ids(&self, err: EventStoreError) {
        self.lock().instance_ids_failures.push_back(err);
    }

    /// Make the next `latest_sequence` fail with `err`.
    pub fn fail_next_latest_sequence(&self, err: EventStoreError) {
        self.lock().latest_sequence_failures.push_back(err);
    }

    // A poisoned lock means an earlier assertion already panicked mid-test.
    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.recording
            .lock()
            .unwrap_or_else(|_| panic!("RecordingPusher lock poisoned"))
    }

    fn scripted(
        &self,
        queue: fn(&mut Recording) -> &mut VecDeque<EventStoreError>,
    ) -> Option<EventStoreError> {
        queue(&mut self.lock()).pop_front()
    }

    /// Every batch seen so far, including failed ones, in call order.
    pub fn pushed(&self) -> Vec<Vec<Command>> {
        self.lock().batches.clone()
    }

    /// Whether some recorded batch is equivalent to `expected`.
    pub fn was_pushed(&self, expected: &[Command]) -> bool {
        self.pushed()
            .iter()
            .any(|batch| batches_equivalent(batch, expected))
    }

    /// Panic unless some recorded batch is equivalent to `expected`.
    #[track_caller]
    pub fn assert_pushed(&self, expected: &[Command]) {
        if !self.was_pushed(expected) {
            panic!(
                "no pushed batch matches the expected commands\nexpected: {:#?}\npushed: {:#?}",
                expected,
                self.pushed()
            );
        }
    }

    /// Panic unless nothing was pushed.
    #[track_caller]
    pub fn assert_nothing_pushed(&self) {
        let pushed = self.pushed();
        if !pushed.is_empty() {
            panic!("expected no pushes, got {pushed:#?}");
        }
    }
}

fn batches_equivalent(left: &[Command], right: &[Command]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.is_equivalent(r))
}

#[async_trait]
impl<S: Pusher> Pusher for RecordingPusher<S> {
    async fn push(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError> {
        let scripted = {
            let mut recording = self.lock();
            recording.batches.push(commands.clone());
            recording.push_failures.pop_front()
        };
        match scripted {
            Some(err) => Err(err),
            None => self.inner.push(commands).await,
        }
    }
}

#[async_trait]
impl<S: Querier> Querier for RecordingPusher<S> {
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        match self.scripted(|r| &mut r.filter_failures) {
            Some(err) => Err(err),
            None => self.inner.filter(query).await,
        }
    }

    async fn latest_sequence(&self, query: &SearchQuery) -> Result<Watermark, EventStoreError> {
        match self.scripted(|r| &mut r.latest_sequence_failures) {
            Some(err) => Err(err),
            None => self.inner.latest_sequence(query).await,
        }
    }

    async fn instance_ids(&self, query: &SearchQuery) -> Result<Vec<InstanceId>, EventStoreError> {
        match self.scripted(|r| &mut r.instance_ids_failures) {
            Some(err) => Err(err),
            None => self.inner.instance_ids(query).await,
        }
    }

    async fn create_instance(&self, instance_id: &InstanceId) -> Result<(), EventStoreError> {
        self.inner.create_instance(instance_id).await
    }

    async fn health(&self) -> Result<(), EventStoreError> {
        self.inner.health().await
    }
}
