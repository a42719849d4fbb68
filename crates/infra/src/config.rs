//! Store configuration loading and backend wiring.
//!
//! Environment variables:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `EVENTSTORE_BACKEND` | `memory` | `memory` or `postgres` |
//! | `DATABASE_URL` | (required for `postgres`) | Postgres connection string |
//! | `EVENTSTORE_MAX_CONNECTIONS` | `10` | pool size |
//! | `EVENTSTORE_OPERATION_TIMEOUT_MS` | `10000` | per-operation deadline |

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use crate::event_store::postgres::DEFAULT_OPERATION_TIMEOUT;
use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown backend '{0}' (expected 'memory' or 'postgres')")]
    UnknownBackend(String),

    #[error("DATABASE_URL must be set for the postgres backend")]
    MissingDatabaseUrl,

    #[error("invalid value for {name}: '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}

/// Which storage substrate backs the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: Backend,
    pub max_connections: u32,
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::InMemory,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = match lookup("EVENTSTORE_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => Backend::InMemory,
            Some("postgres") => Backend::Postgres {
                database_url: lookup("DATABASE_URL")
                    .filter(|url| !url.trim().is_empty())
                    .ok_or(ConfigError::MissingDatabaseUrl)?,
            },
            Some(other) => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let max_connections = match lookup("EVENTSTORE_MAX_CONNECTIONS") {
            Some(raw) => parse_number("EVENTSTORE_MAX_CONNECTIONS", &raw)?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let operation_timeout = match lookup("EVENTSTORE_OPERATION_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_number("EVENTSTORE_OPERATION_TIMEOUT_MS", &raw)?),
            None => DEFAULT_OPERATION_TIMEOUT,
        };

        Ok(Self {
            backend,
            max_connections,
            operation_timeout,
        })
    }
}

fn parse_number<T: std::str::FromStr + PartialOrd + Default>(
    name: &'static str,
    raw: &str,
) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|n| *n > T::default())
        .ok_or_else(|| ConfigError::InvalidNumber {
            name,
            value: raw.to_string(),
        })
}

/// Build the configured store.
///
/// For Postgres this opens the pool and applies the embedded schema.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn EventStore>, EventStoreError> {
    match &config.backend {
        Backend::InMemory => {
            info!(backend = "memory", "event store ready");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
        Backend::Postgres { database_url } => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.operation_timeout)
                .connect(database_url)
                .await
                .map_err(|e| EventStoreError::StorageUnavailable(format!("failed to connect: {e}")))?;

            let store = PostgresEventStore::with_timeout(pool, config.operation_timeout);
            store.migrate().await?;
            info!(
                backend = "postgres",
                max_connections = config.max_connections,
                "event store ready"
            );
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::Querier;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_to_in_memory() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = StoreConfig::from_lookup(lookup(&[("EVENTSTORE_BACKEND", "postgres")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingDatabaseUrl);

        let config = StoreConfig::from_lookup(lookup(&[
            ("EVENTSTORE_BACKEND", "postgres"),
            ("DATABASE_URL", "postgres://localhost/events"),
            ("EVENTSTORE_MAX_CONNECTIONS", "4"),
            ("EVENTSTORE_OPERATION_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            Backend::Postgres {
                database_url: "postgres://localhost/events".into()
            }
        );
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            StoreConfig::from_lookup(lookup(&[("EVENTSTORE_BACKEND", "mysql")])),
            Err(ConfigError::UnknownBackend(_))
        ));
        assert!(matches!(
            StoreConfig::from_lookup(lookup(&[("EVENTSTORE_MAX_CONNECTIONS", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            StoreConfig::from_lookup(lookup(&[("EVENTSTORE_OPERATION_TIMEOUT_MS", "soon")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }

    #[tokio::test]
    async fn connect_builds_in_memory_store() {
        let store = connect(&StoreConfig::default()).await.unwrap();
        store.health().await.unwrap();
    }
}
