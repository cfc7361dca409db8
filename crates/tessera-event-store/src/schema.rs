//! Event store database schema.
//!
//! The DDL lives in the workspace `migrations/` directory and is embedded
//! into the binary by `MIGRATOR`.

use sqlx::migrate::Migrator;

/// Embedded migrations for the `events` and `snapshots` tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Unique constraint over `(tenant_id, aggregate_id, sequence_number)`.
pub const STREAM_SEQUENCE_CONSTRAINT: &str = "events_stream_sequence_key";

/// Transaction-scoped advisory lock key taken by appends when they are
/// serialized, so that commit order matches `global_sequence` order.
pub const APPEND_LOCK_KEY: i64 = 0x7465_7373_6572_6101;

