//! Tessera Event Store — `PostgreSQL` adapter for the Tessera event storage
//! engine.
//!
//! Provides `PgEventRepository`, the embedded schema migrations, environment
//! configuration and tracing setup.

pub mod config;
mod error;
pub mod pg_event_repository;
pub mod schema;
pub mod telemetry;

pub use config::{ConfigError, EventStoreConfig, PgEventEngine, PgEventStore};
pub use pg_event_repository::PgEventRepository;
