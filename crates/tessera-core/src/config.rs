//! Engine tuning knobs.

use std::collections::BTreeSet;
use std::time::Duration;

use backon::ExponentialBuilder;

/// Default number of rows fetched per page of a streaming read.
pub const DEFAULT_PAGE_SIZE: u32 = 256;

/// Bounded exponential backoff applied to read-side transient faults.
///
/// Writes are never retried by the engine. Callers retrying appends after a
/// `TransientStorageFault` can reuse the same policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff schedule for this policy: doubles from `initial_backoff`,
    /// capped at `max_backoff`, for at most `max_attempts - 1` retries.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Configuration of an `EventStorageEngine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows fetched per page by streaming reads; bounds reader memory.
    pub page_size: u32,
    /// Retry policy for read-side transient faults.
    pub read_retry: RetryPolicy,
    /// Upper bound for each repository call, if any.
    pub operation_timeout: Option<Duration>,
    /// Event types treated as snapshot events by tracking reads.
    pub snapshot_event_types: BTreeSet<String>,
}

impl EngineConfig {
    /// Sets the page size. Zero is raised to one.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the read retry policy.
    #[must_use]
    pub fn with_read_retry(mut self, read_retry: RetryPolicy) -> Self {
        self.read_retry = read_retry;
        self
    }

    /// Bounds every repository call by `timeout`.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Marks `event_type` as a snapshot event.
    #[must_use]
    pub fn with_snapshot_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.snapshot_event_types.insert(event_type.into());
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_retry: RetryPolicy::default(),
            operation_timeout: None,
            snapshot_event_types: BTreeSet::new(),
        }
    }
}
