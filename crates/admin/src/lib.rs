//! Operational commands against a configured event store.
//!
//! ```text
//! eventstore-admin health
//! eventstore-admin create-instance <instance>
//! eventstore-admin instances [aggregate_type...]
//! eventstore-admin latest <instance> [aggregate_type]
//! ```
//!
//! Output is JSON on stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use eventstore_core::{AggregateType, DomainError, InstanceId};
use eventstore_infra::event_store::{EventStore, Querier, SearchQuery, Watermark};

#[derive(Debug, Parser)]
#[command(name = "eventstore-admin", about = "Operational commands against the configured event store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum AdminCommand {
    /// Check that the backing store is reachable
    Health,
    /// Provision an instance so it can accept pushes
    CreateInstance {
        #[arg(value_parser = parse_instance_id)]
        instance_id: InstanceId,
    },
    /// List instances holding events of the given aggregate types
    Instances {
        #[arg(value_parser = parse_aggregate_type)]
        aggregate_types: Vec<AggregateType>,
    },
    /// Show the latest position of an instance
    Latest {
        #[arg(value_parser = parse_instance_id)]
        instance_id: InstanceId,

        /// Only consider events of this aggregate type
        #[arg(value_parser = parse_aggregate_type)]
        aggregate_type: Option<AggregateType>,
    },
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, DomainError> {
    InstanceId::parse(raw)
}

fn parse_aggregate_type(raw: &str) -> Result<AggregateType, DomainError> {
    AggregateType::parse(raw)
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminOutput {
    Healthy,
    InstanceCreated { instance_id: InstanceId },
    Instances { instance_ids: Vec<InstanceId> },
    Latest { instance_id: InstanceId, watermark: Watermark },
}

/// Execute `command` against `store`.
pub async fn run<S>(store: &S, command: &AdminCommand) -> anyhow::Result<AdminOutput>
where
    S: EventStore + ?Sized,
{
    let output = match command {
        AdminCommand::Health => {
            store.health().await?;
            AdminOutput::Healthy
        }
        AdminCommand::CreateInstance { instance_id } => {
            store.create_instance(instance_id).await?;
            info!(instance_id = %instance_id, "instance provisioned");
            AdminOutput::InstanceCreated {
                instance_id: instance_id.clone(),
            }
        }
        AdminCommand::Instances { aggregate_types } => {
            let query = SearchQuery {
                aggregate_types: aggregate_types.clone(),
                ..SearchQuery::all_instances()
            };
            AdminOutput::Instances {
                instance_ids: store.instance_ids(&query).await?,
            }
        }
        AdminCommand::Latest {
            instance_id,
            aggregate_type,
        } => {
            let mut query = SearchQuery::for_instance(instance_id.clone());
            if let Some(aggregate_type) = aggregate_type {
                query = query.aggregate_type(aggregate_type.clone());
            }
            AdminOutput::Latest {
                instance_id: instance_id.clone(),
                watermark: store.latest_sequence(&query).await?,
            }
        }
    };
    Ok(output)
}
