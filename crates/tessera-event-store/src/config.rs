//! Environment configuration and connection setup.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tessera_core::{
    EngineConfig, EventStorageEngine, RetryPolicy, TenantContextProvider,
    TenantEnforcedEventStore,
};
use thiserror::Error;

use crate::pg_event_repository::PgEventRepository;

/// Engine over the `PostgreSQL` repository.
pub type PgEventEngine = EventStorageEngine<PgEventRepository>;

/// Tenant-enforced store over the `PostgreSQL` engine.
pub type PgEventStore = TenantEnforcedEventStore<PgEventEngine>;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{0} environment variable must be set")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Connection and engine settings for a `PostgreSQL`-backed store.
#[derive(Clone)]
pub struct EventStoreConfig {
    /// Connection string. May carry credentials and is never logged.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Whether appends take the global advisory lock.
    pub serialize_appends: bool,
    /// Engine settings.
    pub engine: EngineConfig,
}

impl fmt::Debug for EventStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStoreConfig")
            .field("database_url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("serialize_appends", &self.serialize_appends)
            .field("engine", &self.engine)
            .finish()
    }
}

impl EventStoreConfig {
    /// Default pool size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    /// Default pool acquire timeout.
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a configuration with defaults for everything but the URL.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
            serialize_appends: true,
            engine: EngineConfig::default(),
        }
    }

    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is missing or a variable
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is missing or a variable
    /// cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Some(max) = parse(&lookup, "TESSERA_DB_MAX_CONNECTIONS", "a positive integer")? {
            config.max_connections = max;
        }
        if let Some(ms) = parse(&lookup, "TESSERA_DB_ACQUIRE_TIMEOUT_MS", "milliseconds")? {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(serialize) = parse(&lookup, "TESSERA_SERIALIZE_APPENDS", "true or false")? {
            config.serialize_appends = serialize;
        }

        let mut engine = EngineConfig::default();
        if let Some(page_size) = parse(&lookup, "TESSERA_PAGE_SIZE", "a positive integer")? {
            engine = engine.with_page_size(page_size);
        }
        if let Some(ms) = parse(&lookup, "TESSERA_OPERATION_TIMEOUT_MS", "milliseconds")? {
            engine = engine.with_operation_timeout(Duration::from_millis(ms));
        }
        let mut retry = RetryPolicy::default();
        if let Some(attempts) = parse(&lookup, "TESSERA_READ_RETRY_ATTEMPTS", "a positive integer")?
        {
            retry.max_attempts = u32::max(attempts, 1);
        }
        if let Some(ms) = parse(&lookup, "TESSERA_READ_RETRY_BACKOFF_MS", "milliseconds")? {
            retry.initial_backoff = Duration::from_millis(ms);
        }
        engine = engine.with_read_retry(retry);
        if let Some(types) = lookup("TESSERA_SNAPSHOT_EVENT_TYPES") {
            for event_type in types.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                engine = engine.with_snapshot_event_type(event_type);
            }
        }
        config.engine = engine;

        if config.max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "TESSERA_DB_MAX_CONNECTIONS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    /// Opens a connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url)
            .await?;
        tracing::info!(
            max_connections = self.max_connections,
            serialize_appends = self.serialize_appends,
            "connected to event store database"
        );
        Ok(pool)
    }

    /// Opens a pool, applies migrations and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached or a migration
    /// fails.
    pub async fn connect_engine(&self) -> Result<PgEventEngine, sqlx::Error> {
        let repository = PgEventRepository::new(self.connect().await?)
            .with_serialize_appends(self.serialize_appends);
        repository.migrate().await?;
        Ok(EventStorageEngine::new(Arc::new(repository)).with_config(self.engine.clone()))
    }

    /// Builds a tenant-enforced store resolving tenants through `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached or a migration
    /// fails.
    pub async fn connect_store(
        &self,
        provider: Arc<dyn TenantContextProvider>,
    ) -> Result<PgEventStore, sqlx::Error> {
        let engine = self.connect_engine().await?;
        Ok(TenantEnforcedEventStore::new(Arc::new(engine), provider))
    }
}

fn parse<F, T>(
    lookup: &F,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(name)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                name,
                expected,
                value,
            })
        })
        .transpose()
}
