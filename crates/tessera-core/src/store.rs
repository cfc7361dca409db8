//! The tenant-explicit event store contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppendError, StorageError};
use crate::event::{EventBatch, EventRecord, TrackedEventRecord};
use crate::identifiers::{AggregateId, SequenceNumber, TenantId};
use crate::snapshot::{PendingSnapshot, SnapshotRecord};
use crate::stream::EventStream;
use crate::token::TrackingToken;

/// Event store operations with the tenant passed as an explicit argument.
///
/// Callers normally go through `TenantEnforcedEventStore`, which resolves the
/// tenant from the call's context and refuses to proceed without one.
#[async_trait]
pub trait RawEventStore: Send + Sync {
    /// Appends a batch atomically.
    async fn append_events(&self, tenant: &TenantId, batch: EventBatch) -> Result<(), AppendError>;

    /// Streams one aggregate's events from `from` onwards, by sequence number.
    fn read_events(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
    ) -> EventStream<EventRecord>;

    /// Returns the head of an aggregate stream.
    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, StorageError>;

    /// Token before any of the tenant's events.
    fn create_tail_token(&self, tenant: &TenantId) -> TrackingToken;

    /// Token at the tenant's highest committed global sequence.
    async fn create_head_token(&self, tenant: &TenantId) -> Result<TrackingToken, StorageError>;

    /// Token just before the tenant's first event at or after `at`.
    async fn create_token_at(
        &self,
        tenant: &TenantId,
        at: DateTime<Utc>,
    ) -> Result<TrackingToken, StorageError>;

    /// Streams the tenant's events after `from` in global order, ending at
    /// the visible head.
    fn read_tracked_events(
        &self,
        tenant: &TenantId,
        from: TrackingToken,
        include_snapshot_events: bool,
    ) -> EventStream<TrackedEventRecord>;

    /// Like `read_tracked_events`, but keeps polling every `poll_interval`
    /// once the head is reached. Ends only when dropped or on error.
    fn follow_tracked_events(
        &self,
        tenant: &TenantId,
        from: TrackingToken,
        include_snapshot_events: bool,
        poll_interval: Duration,
    ) -> EventStream<TrackedEventRecord>;

    /// Stores a snapshot.
    async fn store_snapshot(
        &self,
        tenant: &TenantId,
        snapshot: PendingSnapshot,
    ) -> Result<(), StorageError>;

    /// Returns the newest snapshot of an aggregate.
    async fn read_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, StorageError>;
}
