//! Postgres-backed event store implementation.
//!
//! This module persists the log in PostgreSQL. Atomicity, ordering and
//! uniqueness are enforced inside one database transaction per push.
//!
//! ## Push protocol
//!
//! 1. `UPDATE instances ... RETURNING position` reserves the batch's positions
//!    and row-locks the instance until commit, so pushes into one instance are
//!    linearized and positions become visible in order.
//! 2. For each command: read the stream head, check owner and expected
//!    version, apply its unique constraints, insert the event.
//! 3. Commit. Any error (or dropping the future) drops the transaction,
//!    which rolls it back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation on `unique_constraints_pkey`) | `23505` | `ConstraintViolation` |
//! | Database (unique violation on an events key) | `23505` | `ConcurrencyConflict` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `InvalidCommand` |
//! | Database (other) | Any other | `StorageUnavailable` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `StorageUnavailable` |
//! | elapsed operation timeout | N/A | `Timeout` |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};

use eventstore_core::{
    AggregateId, AggregateType, CreatorId, EventType, InstanceId, ResourceOwner,
};
use eventstore_events::{
    Aggregate, Command, Event, UniqueConstraint, UniqueConstraintAction, UniqueKey,
};

use super::batch::{self, StagedHeads, StreamHead, StreamKey};
use super::query::{Order, SearchQuery, Watermark};
use super::r#trait::{EventStoreError, Pusher, Querier};

const SCHEMA: &str = include_str!("../../migrations/0001_eventstore.sql");

const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, sequence, position, \
     event_id, resource_owner, creator, event_type, revision, payload, unique_constraints, created_at";

const UNIQUE_CONSTRAINTS_KEY: &str = "unique_constraints_pkey";

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Postgres-backed append-only event store.
///
/// `Send + Sync`; cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    operation_timeout: Duration,
}

impl PostgresEventStore {
    /// Create a new store with the default operation timeout.
    pub fn new(pool: PgPool) -> Self {
        Self::with_timeout(pool, DEFAULT_OPERATION_TIMEOUT)
    }

    /// Create a new store bounding every operation by `operation_timeout`.
    pub fn with_timeout(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            operation_timeout,
        }
    }

    /// Create the schema if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        self.bounded(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
            Ok(())
        })
        .await
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, EventStoreError>
    where
        F: Future<Output = Result<T, EventStoreError>>,
    {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .map_err(|_| EventStoreError::Timeout(self.operation_timeout))?
    }

    async fn push_in_tx(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError> {
        let instance_id = batch::validate(&commands)?;
        Span::current().record("instance_id", instance_id.as_str());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (last_position, created_at) = reserve_positions(&mut tx, &instance_id, commands.len())
            .await?
            .ok_or_else(|| EventStoreError::InstanceNotProvisioned(instance_id.clone()))?;

        let mut position = last_position - commands.len() as u64;
        let mut staged = StagedHeads::default();
        let mut committed = Vec::with_capacity(commands.len());

        for command in commands {
            let key = StreamKey::of(&command);
            let current = match staged.get(&key) {
                Some(head) => head.clone(),
                None => load_stream_head(&mut tx, &instance_id, &key).await?,
            };

            let sequence = staged.advance(key, current, &command)?;
            apply_constraints(&mut tx, &instance_id, &command.unique_constraints).await?;

            position += 1;
            let event = Event::from_command(command, sequence, position, created_at);
            insert_event(&mut tx, &event).await?;
            committed.push(event);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", committed.len() as u64);
        Ok(committed)
    }

    async fn fetch_events(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM eventstore.events"));
        push_predicates(&mut qb, query);
        match query.order {
            Order::Asc => qb.push(" ORDER BY position ASC, instance_id ASC"),
            Order::Desc => qb.push(" ORDER BY position DESC, instance_id DESC"),
        };
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter", e))?;

        rows.iter().map(event_from_row).collect()
    }
}

/// Reserve `count` positions for `instance_id` and take the commit timestamp.
///
/// Returns `None` when the instance is not provisioned. The timestamp never goes
/// backwards within an instance.
async fn reserve_positions(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    count: usize,
) -> Result<Option<(u64, DateTime<Utc>)>, EventStoreError> {
    let row = sqlx::query(
        r#"
        UPDATE eventstore.instances
        SET position = position + $2,
            last_created_at = GREATEST(last_created_at, clock_timestamp())
        WHERE instance_id = $1
        RETURNING position, last_created_at
        "#,
    )
    .bind(instance_id.as_str())
    .bind(count as i64)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("reserve_positions", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let position: i64 = row
        .try_get("position")
        .map_err(|e| map_sqlx_error("reserve_positions", e))?;
    let created_at: DateTime<Utc> = row
        .try_get("last_created_at")
        .map_err(|e| map_sqlx_error("reserve_positions", e))?;
    Ok(Some((position as u64, created_at)))
}

/// Current version and owner of a stream (version 0 if it has no events).
async fn load_stream_head(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    key: &StreamKey,
) -> Result<StreamHead, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT sequence, resource_owner
        FROM eventstore.events
        WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        ORDER BY sequence DESC
        LIMIT 1
        "#,
    )
    .bind(instance_id.as_str())
    .bind(key.aggregate_type.as_str())
    .bind(key.aggregate_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_stream_head", e))?;

    let Some(row) = row else {
        return Ok(StreamHead::empty());
    };
    let version: i64 = row
        .try_get("sequence")
        .map_err(|e| map_sqlx_error("load_stream_head", e))?;
    let owner: String = row
        .try_get("resource_owner")
        .map_err(|e| map_sqlx_error("load_stream_head", e))?;
    Ok(StreamHead {
        version: version as u64,
        resource_owner: Some(ResourceOwner::new(owner)),
    })
}

async fn apply_constraints(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    constraints: &[UniqueConstraint],
) -> Result<(), EventStoreError> {
    for constraint in constraints {
        match constraint.action {
            UniqueConstraintAction::RemoveInstance => {
                sqlx::query("DELETE FROM eventstore.unique_constraints WHERE instance_id = $1")
                    .bind(instance_id.as_str())
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("remove_instance_constraints", e))?;
            }
            UniqueConstraintAction::Remove => {
                let Some(key) = constraint.key(instance_id) else {
                    continue;
                };
                sqlx::query(
                    r#"
                    DELETE FROM eventstore.unique_constraints
                    WHERE instance_id = $1 AND unique_type = $2 AND unique_field = $3
                    "#,
                )
                .bind(key_instance(&key))
                .bind(&key.unique_type)
                .bind(&key.unique_field)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("remove_constraint", e))?;
            }
            UniqueConstraintAction::Add => {
                let Some(key) = constraint.key(instance_id) else {
                    continue;
                };
                let result = sqlx::query(
                    r#"
                    INSERT INTO eventstore.unique_constraints (instance_id, unique_type, unique_field)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(key_instance(&key))
                .bind(&key.unique_type)
                .bind(&key.unique_field)
                .execute(&mut **tx)
                .await;

                if let Err(e) = result {
                    if unique_violation_on(&e) == Some(UNIQUE_CONSTRAINTS_KEY) {
                        return Err(EventStoreError::ConstraintViolation {
                            key,
                            message: constraint.error_message.clone(),
                        });
                    }
                    return Err(map_sqlx_error("add_constraint", e));
                }
            }
        }
    }
    Ok(())
}

async fn insert_event(tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<(), EventStoreError> {
    let aggregate = &event.aggregate;
    sqlx::query(
        r#"
        INSERT INTO eventstore.events (
            instance_id,
            aggregate_type,
            aggregate_id,
            sequence,
            position,
            event_id,
            resource_owner,
            creator,
            event_type,
            revision,
            payload,
            unique_constraints,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(aggregate.instance_id.as_str())
    .bind(aggregate.aggregate_type.as_str())
    .bind(aggregate.aggregate_id.as_str())
    .bind(event.sequence as i64)
    .bind(event.position as i64)
    .bind(event.event_id)
    .bind(aggregate.resource_owner.as_str())
    .bind(event.creator.as_str())
    .bind(event.event_type.as_str())
    .bind(event.revision as i16)
    .bind(&event.payload)
    .bind(Json(&event.unique_constraints))
    .bind(event.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        // The instance row lock serializes pushes, so this only fires if a
        // writer bypassed it.
        if unique_violation_on(&e).is_some() {
            EventStoreError::ConcurrencyConflict {
                aggregate: aggregate.clone(),
                detail: format!("sequence {} already exists", event.sequence),
            }
        } else {
            map_sqlx_error("insert_event", e)
        }
    })?;
    Ok(())
}

fn key_instance(key: &UniqueKey) -> &str {
    key.instance_id.as_ref().map(InstanceId::as_str).unwrap_or("")
}

fn push_predicates(qb: &mut QueryBuilder<'_, Postgres>, query: &SearchQuery) {
    qb.push(" WHERE TRUE");
    if !query.instance_ids.is_empty() {
        qb.push(" AND instance_id = ANY(")
            .push_bind(strings(&query.instance_ids))
            .push(")");
    }
    if let Some(owner) = &query.resource_owner {
        qb.push(" AND resource_owner = ").push_bind(owner.as_str().to_owned());
    }
    if let Some(creator) = &query.creator {
        qb.push(" AND creator = ").push_bind(creator.as_str().to_owned());
    }
    if !query.aggregate_types.is_empty() {
        qb.push(" AND aggregate_type = ANY(")
            .push_bind(strings(&query.aggregate_types))
            .push(")");
    }
    if !query.aggregate_ids.is_empty() {
        qb.push(" AND aggregate_id = ANY(")
            .push_bind(strings(&query.aggregate_ids))
            .push(")");
    }
    if !query.event_types.is_empty() {
        qb.push(" AND event_type = ANY(")
            .push_bind(strings(&query.event_types))
            .push(")");
    }
    if let Some(from) = query.sequence_from {
        qb.push(" AND sequence >= ").push_bind(from as i64);
    }
    if let Some(to) = query.sequence_to {
        qb.push(" AND sequence <= ").push_bind(to as i64);
    }
    if let Some(from) = query.created_from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(before) = query.created_before {
        qb.push(" AND created_at < ").push_bind(before);
    }
    if let Some(after) = query.position_after {
        qb.push(" AND position > ").push_bind(after as i64);
    }
}

fn strings<T: AsRef<str>>(values: &[T]) -> Vec<String> {
    values.iter().map(|v| v.as_ref().to_owned()).collect()
}

fn event_from_row(row: &PgRow) -> Result<Event, EventStoreError> {
    read_event(row).map_err(|e| {
        EventStoreError::StorageUnavailable(format!("failed to deserialize event row: {e}"))
    })
}

fn read_event(row: &PgRow) -> Result<Event, sqlx::Error> {
    let Json(unique_constraints): Json<Vec<UniqueConstraint>> = row.try_get("unique_constraints")?;
    let sequence: i64 = row.try_get("sequence")?;
    let position: i64 = row.try_get("position")?;
    let revision: i16 = row.try_get("revision")?;

    Ok(Event {
        event_id: row.try_get("event_id")?,
        aggregate: Aggregate {
            instance_id: InstanceId::new(row.try_get::<String, _>("instance_id")?),
            resource_owner: ResourceOwner::new(row.try_get::<String, _>("resource_owner")?),
            aggregate_type: AggregateType::new(row.try_get::<String, _>("aggregate_type")?),
            aggregate_id: AggregateId::new(row.try_get::<String, _>("aggregate_id")?),
        },
        creator: CreatorId::new(row.try_get::<String, _>("creator")?),
        event_type: EventType::new(row.try_get::<String, _>("event_type")?),
        revision: revision as u16,
        payload: row.try_get("payload")?,
        unique_constraints,
        sequence: sequence as u64,
        position: position as u64,
        created_at: row.try_get("created_at")?,
    })
}

/// Name of the violated unique key, if `err` is a unique violation.
fn unique_violation_on(err: &sqlx::Error) -> Option<&str> {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return Some(db_err.constraint().unwrap_or_default());
        }
    }
    None
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // foreign key / check constraint
                Some("23503") | Some("23514") => EventStoreError::InvalidCommand(msg),
                _ => EventStoreError::StorageUnavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::StorageUnavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => EventStoreError::StorageUnavailable(format!(
            "timed out acquiring a connection in {operation}"
        )),
        _ => EventStoreError::StorageUnavailable(format!("sqlx error in {operation}: {err}")),
    }
}

#[async_trait]
impl Pusher for PostgresEventStore {
    #[instrument(
        skip(self, commands),
        fields(
            command_count = commands.len(),
            instance_id = tracing::field::Empty,
            committed_events = tracing::field::Empty
        ),
        err
    )]
    async fn push(&self, commands: Vec<Command>) -> Result<Vec<Event>, EventStoreError> {
        self.bounded(self.push_in_tx(commands)).await
    }
}

#[async_trait]
impl Querier for PostgresEventStore {
    #[instrument(skip(self, query), fields(event_count = tracing::field::Empty), err)]
    async fn filter(&self, query: &SearchQuery) -> Result<Vec<Event>, EventStoreError> {
        query.ensure_scoped()?;
        let events = self.bounded(self.fetch_events(query)).await?;
        Span::current().record("event_count", events.len() as u64);
        Ok(events)
    }

    #[instrument(skip(self, query), err)]
    async fn latest_sequence(&self, query: &SearchQuery) -> Result<Watermark, EventStoreError> {
        query.ensure_scoped()?;
        self.bounded(async {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT position, sequence, created_at FROM eventstore.events",
            );
            push_predicates(&mut qb, query);
            qb.push(" ORDER BY position DESC, instance_id DESC LIMIT 1");

            let row = qb
                .build()
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("latest_sequence", e))?;

            let Some(row) = row else {
                return Ok(Watermark::zero());
            };
            let read = |row: &PgRow| -> Result<Watermark, sqlx::Error> {
                let position: i64 = row.try_get("position")?;
                let sequence: i64 = row.try_get("sequence")?;
                Ok(Watermark {
                    position: position as u64,
                    sequence: sequence as u64,
                    created_at: Some(row.try_get("created_at")?),
                })
            };
            read(&row).map_err(|e| map_sqlx_error("latest_sequence", e))
        })
        .await
    }

    #[instrument(skip(self, query), err)]
    async fn instance_ids(&self, query: &SearchQuery) -> Result<Vec<InstanceId>, EventStoreError> {
        query.ensure_well_formed()?;
        self.bounded(async {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT DISTINCT instance_id FROM eventstore.events");
            push_predicates(&mut qb, query);
            qb.push(" ORDER BY instance_id ASC");

            let rows = qb
                .build()
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("instance_ids", e))?;

            rows.iter()
                .map(|row| {
                    row.try_get::<String, _>("instance_id")
                        .map(InstanceId::new)
                        .map_err(|e| map_sqlx_error("instance_ids", e))
                })
                .collect()
        })
        .await
    }

    #[instrument(skip(self, instance_id), fields(instance_id = %instance_id), err)]
    async fn create_instance(&self, instance_id: &InstanceId) -> Result<(), EventStoreError> {
        if instance_id.is_empty() {
            return Err(EventStoreError::InvalidCommand("instance id is empty".to_string()));
        }
        self.bounded(async {
            sqlx::query(
                r#"
                INSERT INTO eventstore.instances (instance_id)
                VALUES ($1)
                ON CONFLICT (instance_id) DO NOTHING
                "#,
            )
            .bind(instance_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_instance", e))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn health(&self) -> Result<(), EventStoreError> {
        self.bounded(async {
            sqlx::query("SELECT 1")
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("health", e))?;
            Ok(())
        })
        .await
    }
}
