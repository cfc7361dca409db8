//! Test repositories — `EventRepository` wrappers and stubs for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_core::event::EventRecord;
use tessera_core::identifiers::{AggregateId, GlobalSequence, SequenceNumber, TenantId};
use tessera_core::repository::{EventRepository, NewEvent, RepositoryError};
use tessera_core::snapshot::SnapshotRecord;
use tessera_core::token::TrackingToken;

/// Wraps a repository and records the name of every method called on it.
#[derive(Debug)]
pub struct SpyEventRepository<R> {
    inner: R,
    calls: Mutex<Vec<&'static str>>,
}

impl<R> SpyEventRepository<R> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the recorded method names in call order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    /// Returns how many calls reached the repository.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Returns the wrapped repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn record(&self, method: &'static str) {
        self.calls.lock().unwrap().push(method);
    }
}

#[async_trait]
impl<R: EventRepository> EventRepository for SpyEventRepository<R> {
    async fn insert_events(
        &self,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        self.record("insert_events");
        self.inner.insert_events(tenant, events).await
    }

    async fn read_stream(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        self.record("read_stream");
        self.inner.read_stream(tenant, aggregate_id, from, limit).await
    }

    async fn read_tracked(
        &self,
        tenant: &TenantId,
        after: TrackingToken,
        excluded_event_types: &[String],
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        self.record("read_tracked");
        self.inner
            .read_tracked(tenant, after, excluded_event_types, limit)
            .await
    }

    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError> {
        self.record("last_sequence_number");
        self.inner.last_sequence_number(tenant, aggregate_id).await
    }

    async fn max_global_sequence(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        self.record("max_global_sequence");
        self.inner.max_global_sequence(tenant).await
    }

    async fn first_global_sequence_since(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        self.record("first_global_sequence_since");
        self.inner.first_global_sequence_since(tenant, since).await
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), RepositoryError> {
        self.record("upsert_snapshot");
        self.inner.upsert_snapshot(snapshot).await
    }

    async fn find_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        self.record("find_snapshot");
        self.inner.find_snapshot(tenant, aggregate_id).await
    }
}

/// The kind of failure a `FailingEventRepository` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// `RepositoryError::Transient`.
    Transient,
    /// `RepositoryError::Corrupt`.
    Corrupt,
    /// `RepositoryError::Backend`.
    Backend,
}

impl Failure {
    fn to_error(self) -> RepositoryError {
        match self {
            Self::Transient => RepositoryError::Transient("connection refused".into()),
            Self::Corrupt => RepositoryError::Corrupt("payload is not valid JSON".into()),
            Self::Backend => RepositoryError::Backend("relation \"events\" does not exist".into()),
        }
    }
}

/// An event repository that fails every call. Useful for testing error
/// translation paths.
#[derive(Debug)]
pub struct FailingEventRepository {
    failure: Failure,
}

impl FailingEventRepository {
    /// Fails every call with `failure`.
    #[must_use]
    pub fn new(failure: Failure) -> Self {
        Self { failure }
    }
}

#[async_trait]
impl EventRepository for FailingEventRepository {
    async fn insert_events(
        &self,
        _tenant: &TenantId,
        _events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn read_stream(
        &self,
        _tenant: &TenantId,
        _aggregate_id: &AggregateId,
        _from: SequenceNumber,
        _limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn read_tracked(
        &self,
        _tenant: &TenantId,
        _after: TrackingToken,
        _excluded_event_types: &[String],
        _limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn last_sequence_number(
        &self,
        _tenant: &TenantId,
        _aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn max_global_sequence(
        &self,
        _tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn first_global_sequence_since(
        &self,
        _tenant: &TenantId,
        _since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn upsert_snapshot(&self, _snapshot: &SnapshotRecord) -> Result<(), RepositoryError> {
        Err(self.failure.to_error())
    }

    async fn find_snapshot(
        &self,
        _tenant: &TenantId,
        _aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        Err(self.failure.to_error())
    }
}

/// Wraps a repository and fails the first `failures` calls with a transient
/// error before delegating.
#[derive(Debug)]
pub struct FlakyEventRepository<R> {
    inner: R,
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

impl<R> FlakyEventRepository<R> {
    /// Wraps `inner`, failing the first `failures` calls.
    #[must_use]
    pub fn new(inner: R, failures: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    /// Returns how many calls were made, failed or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the wrapped repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn trip(&self) -> Result<(), RepositoryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            Err(RepositoryError::Transient("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<R: EventRepository> EventRepository for FlakyEventRepository<R> {
    async fn insert_events(
        &self,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        self.trip()?;
        self.inner.insert_events(tenant, events).await
    }

    async fn read_stream(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        self.trip()?;
        self.inner.read_stream(tenant, aggregate_id, from, limit).await
    }

    async fn read_tracked(
        &self,
        tenant: &TenantId,
        after: TrackingToken,
        excluded_event_types: &[String],
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        self.trip()?;
        self.inner
            .read_tracked(tenant, after, excluded_event_types, limit)
            .await
    }

    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError> {
        self.trip()?;
        self.inner.last_sequence_number(tenant, aggregate_id).await
    }

    async fn max_global_sequence(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        self.trip()?;
        self.inner.max_global_sequence(tenant).await
    }

    async fn first_global_sequence_since(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        self.trip()?;
        self.inner.first_global_sequence_since(tenant, since).await
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), RepositoryError> {
        self.trip()?;
        self.inner.upsert_snapshot(snapshot).await
    }

    async fn find_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        self.trip()?;
        self.inner.find_snapshot(tenant, aggregate_id).await
    }
}

/// Wraps a repository and sleeps for `delay` before every call. Useful for
/// timeout and cancellation tests.
#[derive(Debug)]
pub struct DelayedEventRepository<R> {
    inner: R,
    delay: Duration,
}

impl<R> DelayedEventRepository<R> {
    /// Wraps `inner`, delaying each call by `delay`.
    #[must_use]
    pub fn new(inner: R, delay: Duration) -> Self {
        Self { inner, delay }
    }

    /// Returns the wrapped repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: EventRepository> EventRepository for DelayedEventRepository<R> {
    async fn insert_events(
        &self,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_events(tenant, events).await
    }

    async fn read_stream(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_stream(tenant, aggregate_id, from, limit).await
    }

    async fn read_tracked(
        &self,
        tenant: &TenantId,
        after: TrackingToken,
        excluded_event_types: &[String],
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .read_tracked(tenant, after, excluded_event_types, limit)
            .await
    }

    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.last_sequence_number(tenant, aggregate_id).await
    }

    async fn max_global_sequence(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.max_global_sequence(tenant).await
    }

    async fn first_global_sequence_since(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.first_global_sequence_since(tenant, since).await
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert_snapshot(snapshot).await
    }

    async fn find_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_snapshot(tenant, aggregate_id).await
    }
}
