//! In-memory unique-constraint engine.
//!
//! Reservations live in a set keyed by `(instance, type, field)`. A push never
//! mutates the set directly: it stages its constraints in a
//! [`ConstraintChanges`] that reads through to the committed set, and the
//! changes are committed only together with the push's events.

use std::collections::HashSet;

use eventstore_core::InstanceId;
use eventstore_events::{UniqueConstraint, UniqueConstraintAction, UniqueKey};

use super::r#trait::EventStoreError;

/// Committed reservations.
#[derive(Debug, Default)]
pub struct UniqueConstraintIndex {
    reserved: HashSet<UniqueKey>,
}

/// Reservations staged by an in-flight push.
#[derive(Debug, Default)]
pub struct ConstraintChanges {
    cleared_instance: Option<InstanceId>,
    removed: HashSet<UniqueKey>,
    added: HashSet<UniqueKey>,
}

impl UniqueConstraintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reserved(&self, key: &UniqueKey) -> bool {
        self.reserved.contains(key)
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    /// Stage `constraints` of a command pushed into `instance_id`.
    ///
    /// Constraints are applied in order on top of `changes`; the first
    /// reservation that conflicts aborts with `ConstraintViolation`.
    pub fn stage<'a>(
        &self,
        changes: &mut ConstraintChanges,
        instance_id: &InstanceId,
        constraints: impl IntoIterator<Item = &'a UniqueConstraint>,
    ) -> Result<(), EventStoreError> {
        for constraint in constraints {
            match constraint.action {
                UniqueConstraintAction::RemoveInstance => {
                    changes.cleared_instance = Some(instance_id.clone());
                    changes
                        .added
                        .retain(|k| k.instance_id.as_ref() != Some(instance_id));
                }
                UniqueConstraintAction::Remove => {
                    let Some(key) = constraint.key(instance_id) else {
                        continue;
                    };
                    changes.added.remove(&key);
                    changes.removed.insert(key);
                }
                UniqueConstraintAction::Add => {
                    let Some(key) = constraint.key(instance_id) else {
                        continue;
                    };
                    if self.is_reserved_with(changes, &key) {
                        return Err(EventStoreError::ConstraintViolation {
                            key,
                            message: constraint.error_message.clone(),
                        });
                    }
                    changes.added.insert(key);
                }
            }
        }
        Ok(())
    }

    /// Apply staged changes. Called only when the owning push commits.
    pub fn commit(&mut self, changes: ConstraintChanges) {
        if let Some(instance_id) = &changes.cleared_instance {
            self.reserved
                .retain(|k| k.instance_id.as_ref() != Some(instance_id));
        }
        for key in &changes.removed {
            self.reserved.remove(key);
        }
        self.reserved.extend(changes.added);
    }

    fn is_reserved_with(&self, changes: &ConstraintChanges, key: &UniqueKey) -> bool {
        if changes.added.contains(key) {
            return true;
        }
        if changes.removed.contains(key) {
            return false;
        }
        if let Some(cleared) = &changes.cleared_instance {
            if key.instance_id.as_ref() == Some(cleared) {
                return false;
            }
        }
        self.reserved.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i1() -> InstanceId {
        InstanceId::new("I1")
    }

    fn email(addr: &str) -> UniqueConstraint {
        UniqueConstraint::add("email", addr, "email already taken")
    }

    fn reserve(index: &mut UniqueConstraintIndex, instance: &InstanceId, constraints: &[UniqueConstraint]) -> Result<(), EventStoreError> {
        let mut changes = ConstraintChanges::default();
        index.stage(&mut changes, instance, constraints)?;
        index.commit(changes);
        Ok(())
    }

    #[test]
    fn second_reservation_of_same_key_is_rejected() {
        let mut index = UniqueConstraintIndex::new();
        reserve(&mut index, &i1(), &[email("alice@ex.com")]).unwrap();

        let err = reserve(&mut index, &i1(), &[email("alice@ex.com")]).unwrap_err();
        match err {
            EventStoreError::ConstraintViolation { key, message } => {
                assert_eq!(key.unique_field, "alice@ex.com");
                assert_eq!(message.as_deref(), Some("email already taken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn same_key_in_other_instance_is_independent() {
        let mut index = UniqueConstraintIndex::new();
        reserve(&mut index, &i1(), &[email("alice@ex.com")]).unwrap();
        reserve(&mut index, &InstanceId::new("I2"), &[email("alice@ex.com")]).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn global_key_spans_instances() {
        let mut index = UniqueConstraintIndex::new();
        let domain = UniqueConstraint::add("domain", "acme.test", "domain taken").global();
        reserve(&mut index, &i1(), &[domain.clone()]).unwrap();
        assert!(reserve(&mut index, &InstanceId::new("I2"), &[domain]).is_err());
    }

    #[test]
    fn failed_stage_leaves_index_untouched() {
        let mut index = UniqueConstraintIndex::new();
        reserve(&mut index, &i1(), &[email("alice@ex.com")]).unwrap();

        let mut changes = ConstraintChanges::default();
        let result = index.stage(
            &mut changes,
            &i1(),
            &[email("bob@ex.com"), email("alice@ex.com")],
        );
        assert!(result.is_err());
        drop(changes);

        let bob = email("bob@ex.com").key(&i1()).unwrap();
        assert!(!index.is_reserved(&bob));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn release_is_idempotent_and_frees_the_key() {
        let mut index = UniqueConstraintIndex::new();
        reserve(&mut index, &i1(), &[email("alice@ex.com")]).unwrap();
        reserve(&mut index, &i1(), &[UniqueConstraint::remove("email", "alice@ex.com")]).unwrap();
        reserve(&mut index, &i1(), &[UniqueConstraint::remove("email", "alice@ex.com")]).unwrap();
        assert!(index.is_empty());

        reserve(&mut index, &i1(), &[email("alice@ex.com")]).unwrap();
    }

    #[test]
    fn change_of_key_within_one_batch() {
        let mut index = UniqueConstraintIndex::new();
        reserve(&mut index, &i1(), &[email("old@ex.com")]).unwrap();

        // remove then re-add in the same batch
        reserve(
            &mut index,
            &i1(),
            &[UniqueConstraint::remove("email", "old@ex.com"), email("old@ex.com")],
        )
        .unwrap();
        assert!(index.is_reserved(&email("old@ex.com").key(&i1()).unwrap()));

        // add then remove in the same batch
        reserve(
            &mut index,
            &i1(),
            &[email("tmp@ex.com"), UniqueConstraint::remove("email", "tmp@ex.com")],
        )
        .unwrap();
        assert!(!index.is_reserved(&email("tmp@ex.com").key(&i1()).unwrap()));
    }

    #[test]
    fn duplicate_add_within_one_batch_is_rejected() {
        let index = UniqueConstraintIndex::new();
        let mut changes = ConstraintChanges::default();
        assert!(index
            .stage(&mut changes, &i1(), &[email("a@ex.com"), email("a@ex.com")])
            .is_err());
    }

    #[test]
    fn remove_instance_releases_only_that_instance() {
        let mut index = UniqueConstraintIndex::new();
        let i2 = InstanceId::new("I2");
        let domain = UniqueConstraint::add("domain", "acme.test", "taken").global();
        reserve(&mut index, &i1(), &[email("a@ex.com"), email("b@ex.com"), domain]).unwrap();
        reserve(&mut index, &i2, &[email("a@ex.com")]).unwrap();

        reserve(&mut index, &i1(), &[UniqueConstraint::remove_instance()]).unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.is_reserved(&email("a@ex.com").key(&i2).unwrap()));
        reserve(&mut index, &i1(), &[email("a@ex.com")]).unwrap();
    }
}
