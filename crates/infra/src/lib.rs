//! Infrastructure layer: event store backends, config, replay and test helpers.

pub mod config;
pub mod event_store;
pub mod replay;
pub mod testing;

pub use config::{Backend, ConfigError, StoreConfig, connect};
pub use event_store::{
    ErrorKind, EventStore, EventStoreError, InMemoryEventStore, Order, PostgresEventStore, Pusher,
    Querier, SearchQuery, Watermark,
};
