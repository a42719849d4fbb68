use serde::{Deserialize, Serialize};

use eventstore_core::{AggregateId, AggregateType, InstanceId, ResourceOwner};

/// Reference to an aggregate: the unit of ownership and ordering.
///
/// Identity is the full tuple. Two aggregates with the same ID but different
/// instances (or types) are unrelated streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    pub instance_id: InstanceId,
    pub resource_owner: ResourceOwner,
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
}

impl Aggregate {
    pub fn new(
        instance_id: impl Into<InstanceId>,
        resource_owner: impl Into<ResourceOwner>,
        aggregate_type: impl Into<AggregateType>,
        aggregate_id: impl Into<AggregateId>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            resource_owner: resource_owner.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl core::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.instance_id, self.resource_owner, self.aggregate_type, self.aggregate_id
        )
    }
}
