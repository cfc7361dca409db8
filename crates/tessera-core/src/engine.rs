//! The event storage engine façade.
//!
//! `EventStorageEngine` sits between callers and an `EventRepository`. It
//! assigns event ids and timestamps, resolves "next in stream" sequence
//! numbers, turns repository pages into lazy streams, bounds and retries
//! repository calls per `EngineConfig`, and translates every repository
//! failure into a `StorageError`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{AppendError, StorageError};
use crate::event::{EventBatch, EventRecord, PendingEvent, TrackedEventRecord};
use crate::identifiers::{AggregateId, SequenceNumber, TenantId};
use crate::repository::{EventRepository, NewEvent, RepositoryError};
use crate::snapshot::{PendingSnapshot, SnapshotRecord};
use crate::store::RawEventStore;
use crate::stream::{EventStream, OnEmptyPage, paged};
use crate::token::TrackingToken;

/// Storage engine over a repository `R`.
///
/// Cloning is cheap; clones share the repository, clock and configuration.
pub struct EventStorageEngine<R: ?Sized> {
    repository: Arc<R>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl<R: ?Sized> Clone for EventStorageEngine<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            clock: Arc::clone(&self.clock),
            config: Arc::clone(&self.config),
        }
    }
}

impl<R: ?Sized> std::fmt::Debug for EventStorageEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStorageEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R> EventStorageEngine<R>
where
    R: EventRepository + ?Sized + 'static,
{
    /// Creates an engine using the system clock and default configuration.
    #[must_use]
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            clock: Arc::new(SystemClock),
            config: Arc::new(EngineConfig::default()),
        }
    }

    /// Replaces the clock used for event and snapshot timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the underlying repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Runs one repository call under the configured timeout and translates
    /// its failure.
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, StorageError> {
        let outcome = match self.config.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(elapsed) => {
                    tracing::warn!(operation, ?limit, "storage call timed out");
                    return Err(StorageError::TransientStorageFault {
                        operation,
                        source: Box::new(elapsed),
                    });
                }
            },
            None => fut.await,
        };
        outcome.map_err(|e| translate(operation, e))
    }

    /// Runs a side-effect-free repository call, retrying transient faults
    /// per `EngineConfig::read_retry`.
    async fn read_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        attempt_call: F,
    ) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        (move || self.call(operation, attempt_call()))
            .retry(self.config.read_retry.backoff())
            .when(StorageError::is_transient)
            .notify(|err: &StorageError, delay: Duration| {
                tracing::warn!(
                    operation,
                    ?delay,
                    error = %err,
                    "retrying read after transient storage fault"
                );
            })
            .await
    }

    /// Validates a batch and turns it into rows with ids, timestamps and
    /// resolved sequence numbers.
    async fn prepare_batch(
        &self,
        tenant: &TenantId,
        batch: EventBatch,
    ) -> Result<Vec<NewEvent>, StorageError> {
        let streams = plan_streams(batch.events())?;

        let mut next_free: HashMap<AggregateId, Option<SequenceNumber>> = HashMap::new();
        for (aggregate_id, numbered) in streams {
            if numbered {
                continue;
            }
            let head = self
                .call(
                    "append_events",
                    self.repository.last_sequence_number(tenant, &aggregate_id),
                )
                .await?;
            let first_free =
                head.map_or(Some(SequenceNumber::FIRST), SequenceNumber::checked_next);
            next_free.insert(aggregate_id, first_free);
        }

        let timestamp = self.clock.now();
        batch
            .into_events()
            .into_iter()
            .map(|event| {
                let sequence_number = match event.sequence_number {
                    Some(explicit) => explicit,
                    None => {
                        let slot = next_free
                            .entry(event.aggregate_id.clone())
                            .or_insert(Some(SequenceNumber::FIRST));
                        let assigned = slot.ok_or_else(|| {
                            StorageError::InvalidBatch(format!(
                                "aggregate {} has no sequence numbers left",
                                event.aggregate_id
                            ))
                        })?;
                        *slot = assigned.checked_next();
                        assigned
                    }
                };
                Ok(NewEvent {
                    event_id: Uuid::now_v7(),
                    aggregate_type: event.aggregate_type,
                    aggregate_id: event.aggregate_id,
                    sequence_number,
                    event_type: event.event_type,
                    payload: event.payload,
                    metadata: event.metadata,
                    timestamp,
                })
            })
            .collect()
    }

    fn tracked_stream(
        &self,
        tenant: &TenantId,
        from: TrackingToken,
        include_snapshot_events: bool,
        on_empty: OnEmptyPage,
    ) -> EventStream<TrackedEventRecord> {
        let engine = self.clone();
        let tenant = tenant.clone();
        let page_size = self.config.page_size;
        let excluded: Arc<Vec<String>> = Arc::new(if include_snapshot_events {
            Vec::new()
        } else {
            self.config.snapshot_event_types.iter().cloned().collect()
        });

        paged(from, page_size, on_empty, move |cursor: TrackingToken| {
            let engine = engine.clone();
            let tenant = tenant.clone();
            let excluded = Arc::clone(&excluded);
            async move {
                let rows = engine
                    .read_with_retry("read_tracked_events", || {
                        engine
                            .repository
                            .read_tracked(&tenant, cursor, &excluded, page_size)
                    })
                    .await?;
                let mut tracked = Vec::with_capacity(rows.len());
                for row in rows {
                    check_tenant(&tenant, &row.tenant_id)?;
                    if !cursor.covers(row.global_sequence) {
                        return Err(StorageError::CorruptRecord(format!(
                            "event {} at {} returned for a read after {cursor}",
                            row.event_id, row.global_sequence
                        )));
                    }
                    tracked.push(TrackedEventRecord::new(row));
                }
                let next = tracked.last().map_or(cursor, |t| t.token);
                Ok((tracked, next))
            }
        })
    }
}

#[async_trait]
impl<R> RawEventStore for EventStorageEngine<R>
where
    R: EventRepository + ?Sized + 'static,
{
    async fn append_events(&self, tenant: &TenantId, batch: EventBatch) -> Result<(), AppendError> {
        let rows = self.prepare_batch(tenant, batch).await?;
        let result = self
            .call("append_events", self.repository.insert_events(tenant, &rows))
            .await;
        match &result {
            Ok(()) => tracing::debug!(%tenant, events = rows.len(), "appended event batch"),
            Err(err) if err.is_conflict() => {
                tracing::warn!(%tenant, error = %err, "append rejected by concurrency check");
            }
            Err(err) => tracing::warn!(%tenant, error = %err, "append failed"),
        }
        result
    }

    fn read_events(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
    ) -> EventStream<EventRecord> {
        let engine = self.clone();
        let tenant = tenant.clone();
        let aggregate_id = aggregate_id.clone();
        let page_size = self.config.page_size;

        paged(from, page_size, OnEmptyPage::Finish, move |cursor: SequenceNumber| {
            let engine = engine.clone();
            let tenant = tenant.clone();
            let aggregate_id = aggregate_id.clone();
            async move {
                let rows = engine
                    .read_with_retry("read_events", || {
                        engine
                            .repository
                            .read_stream(&tenant, &aggregate_id, cursor, page_size)
                    })
                    .await?;
                for row in &rows {
                    check_tenant(&tenant, &row.tenant_id)?;
                }
                let next = rows.last().map_or(cursor, |r| r.sequence_number.next());
                Ok((rows, next))
            }
        })
    }

    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, StorageError> {
        self.read_with_retry("last_sequence_number", || {
            self.repository.last_sequence_number(tenant, aggregate_id)
        })
        .await
    }

    fn create_tail_token(&self, _tenant: &TenantId) -> TrackingToken {
        TrackingToken::tail()
    }

    async fn create_head_token(&self, tenant: &TenantId) -> Result<TrackingToken, StorageError> {
        let head = self
            .read_with_retry("create_head_token", || {
                self.repository.max_global_sequence(tenant)
            })
            .await?;
        Ok(head.map_or_else(TrackingToken::tail, TrackingToken::at))
    }

    async fn create_token_at(
        &self,
        tenant: &TenantId,
        at: DateTime<Utc>,
    ) -> Result<TrackingToken, StorageError> {
        let first = self
            .read_with_retry("create_token_at", || {
                self.repository.first_global_sequence_since(tenant, at)
            })
            .await?;
        match first {
            Some(first) => Ok(first
                .previous()
                .map_or_else(TrackingToken::tail, TrackingToken::at)),
            None => self.create_head_token(tenant).await,
        }
    }

    fn read_tracked_events(
        &self,
        tenant: &TenantId,
        from: TrackingToken,
        include_snapshot_events: bool,
    ) -> EventStream<TrackedEventRecord> {
        self.tracked_stream(tenant, from, include_snapshot_events, OnEmptyPage::Finish)
    }

    fn follow_tracked_events(
        &self,
        tenant: &TenantId,
        from: TrackingToken,
        include_snapshot_events: bool,
        poll_interval: Duration,
    ) -> EventStream<TrackedEventRecord> {
        self.tracked_stream(
            tenant,
            from,
            include_snapshot_events,
            OnEmptyPage::Poll(poll_interval),
        )
    }

    async fn store_snapshot(
        &self,
        tenant: &TenantId,
        snapshot: PendingSnapshot,
    ) -> Result<(), StorageError> {
        let record = snapshot.into_record(tenant.clone(), self.clock.now());
        self.call("store_snapshot", self.repository.upsert_snapshot(&record))
            .await?;
        tracing::debug!(
            %tenant,
            aggregate_id = %record.aggregate_id,
            sequence_number = %record.sequence_number,
            "stored snapshot"
        );
        Ok(())
    }

    async fn read_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let snapshot = self
            .read_with_retry("read_snapshot", || {
                self.repository.find_snapshot(tenant, aggregate_id)
            })
            .await?;
        if let Some(found) = &snapshot {
            check_tenant(tenant, &found.tenant_id)?;
        }
        Ok(snapshot)
    }
}

/// Translates a repository failure into the engine taxonomy.
fn translate(operation: &'static str, err: RepositoryError) -> StorageError {
    match err {
        RepositoryError::Conflict {
            aggregate_id,
            sequence_number,
        } => StorageError::ConcurrencyConflict {
            aggregate_id,
            sequence_number,
        },
        RepositoryError::SequenceGap {
            aggregate_id,
            expected,
            actual,
        } => StorageError::InvalidBatch(format!(
            "aggregate {aggregate_id} expects sequence {expected} next, batch starts at {actual}"
        )),
        RepositoryError::Transient(source) => {
            StorageError::TransientStorageFault { operation, source }
        }
        RepositoryError::Corrupt(reason) => StorageError::CorruptRecord(reason),
        RepositoryError::Backend(source) => StorageError::UnknownStorageFault { operation, source },
    }
}

/// A row of another tenant must never reach a caller.
fn check_tenant(expected: &TenantId, found: &TenantId) -> Result<(), StorageError> {
    if expected == found {
        Ok(())
    } else {
        Err(StorageError::CorruptRecord(format!(
            "row of tenant {found} returned for tenant {expected}"
        )))
    }
}

/// Checks the per-aggregate shape of a batch and returns each aggregate once,
/// in first-seen order, with whether its events carry explicit numbers.
///
/// Within a batch, one aggregate's events must share an aggregate type, be
/// either all numbered or all unnumbered, and numbered ones must be
/// consecutive.
fn plan_streams(events: &[PendingEvent]) -> Result<Vec<(AggregateId, bool)>, StorageError> {
    struct Plan<'a> {
        event: &'a PendingEvent,
        last: Option<SequenceNumber>,
    }

    let mut order: Vec<(AggregateId, bool)> = Vec::new();
    let mut plans: HashMap<&AggregateId, Plan<'_>> = HashMap::new();

    for event in events {
        if let Some(explicit) = event.sequence_number.filter(|n| *n > SequenceNumber::MAX) {
            return Err(StorageError::InvalidBatch(format!(
                "aggregate {} sequence {explicit} exceeds the maximum {}",
                event.aggregate_id,
                SequenceNumber::MAX
            )));
        }
        let Some(plan) = plans.get_mut(&event.aggregate_id) else {
            order.push((event.aggregate_id.clone(), event.sequence_number.is_some()));
            plans.insert(
                &event.aggregate_id,
                Plan {
                    event,
                    last: event.sequence_number,
                },
            );
            continue;
        };

        if plan.event.aggregate_type != event.aggregate_type {
            return Err(StorageError::InvalidBatch(format!(
                "aggregate {} appears as both {} and {}",
                event.aggregate_id, plan.event.aggregate_type, event.aggregate_type
            )));
        }
        match (plan.last, event.sequence_number) {
            (Some(last), Some(current)) if last.checked_next() == Some(current) => {
                plan.last = Some(current);
            }
            (Some(last), Some(current)) => {
                return Err(StorageError::InvalidBatch(format!(
                    "aggregate {} jumps from sequence {last} to {current}",
                    event.aggregate_id
                )));
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::InvalidBatch(format!(
                    "aggregate {} mixes numbered and unnumbered events",
                    event.aggregate_id
                )));
            }
        }
    }
    Ok(order)
}
