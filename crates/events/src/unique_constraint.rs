//! Declarative uniqueness rules attached to commands.
//!
//! The log itself has no natural uniqueness. A command that needs one (e.g.
//! "username unique within the instance") declares a `UniqueConstraint`; the
//! store reserves or releases it in the same atomic unit that persists the
//! command's event.

use serde::{Deserialize, Serialize};

use eventstore_core::InstanceId;

/// What a constraint does when its command is pushed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueConstraintAction {
    /// Reserve the key; fails if it is already reserved.
    Add,
    /// Release the key. Releasing an absent key is a no-op.
    Remove,
    /// Release every reservation held by the command's instance.
    RemoveInstance,
}

/// Whether a constraint is unique within one instance or across all of them.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintScope {
    #[default]
    Instance,
    Global,
}

/// A uniqueness declaration carried by a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub unique_type: String,
    pub unique_field: String,
    pub action: UniqueConstraintAction,
    #[serde(default)]
    pub scope: ConstraintScope,
    /// User-facing message surfaced when the reservation is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The reservation key: `(instance, type, field)`.
///
/// Global constraints have no instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueKey {
    pub instance_id: Option<InstanceId>,
    pub unique_type: String,
    pub unique_field: String,
}

impl UniqueConstraint {
    /// Reserve `unique_field` for `unique_type`.
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Add,
            scope: ConstraintScope::Instance,
            error_message: Some(error_message.into()),
        }
    }

    /// Release a previous reservation.
    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Remove,
            scope: ConstraintScope::Instance,
            error_message: None,
        }
    }

    /// Release all reservations of the pushing instance.
    pub fn remove_instance() -> Self {
        Self {
            unique_type: String::new(),
            unique_field: String::new(),
            action: UniqueConstraintAction::RemoveInstance,
            scope: ConstraintScope::Instance,
            error_message: None,
        }
    }

    /// Make the constraint unique across all instances.
    pub fn global(mut self) -> Self {
        self.scope = ConstraintScope::Global;
        self
    }

    /// The reservation key this constraint targets when pushed into `instance_id`.
    ///
    /// `None` for `RemoveInstance`, which targets every key of the instance.
    pub fn key(&self, instance_id: &InstanceId) -> Option<UniqueKey> {
        if self.action == UniqueConstraintAction::RemoveInstance {
            return None;
        }
        let instance_id = match self.scope {
            ConstraintScope::Instance => Some(instance_id.clone()),
            ConstraintScope::Global => None,
        };
        Some(UniqueKey {
            instance_id,
            unique_type: self.unique_type.clone(),
            unique_field: self.unique_field.clone(),
        })
    }
}

impl core::fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.instance_id {
            Some(instance) => write!(f, "{}={} in instance {}", self.unique_type, self.unique_field, instance),
            None => write!(f, "{}={} (global)", self.unique_type, self.unique_field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_scoped_key_carries_instance() {
        let c = UniqueConstraint::add("email", "alice@ex.com", "email already taken");
        let key = c.key(&InstanceId::new("I1")).unwrap();
        assert_eq!(key.instance_id, Some(InstanceId::new("I1")));
        assert_eq!(key.to_string(), "email=alice@ex.com in instance I1");
    }

    #[test]
    fn global_key_has_no_instance() {
        let c = UniqueConstraint::add("domain", "acme.test", "domain taken").global();
        let key = c.key(&InstanceId::new("I1")).unwrap();
        assert_eq!(key.instance_id, None);
        assert_eq!(c.key(&InstanceId::new("I2")).unwrap(), key);
    }

    #[test]
    fn remove_instance_has_no_single_key() {
        assert!(UniqueConstraint::remove_instance().key(&InstanceId::new("I1")).is_none());
    }
}
