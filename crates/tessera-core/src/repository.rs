//! Storage repository abstraction.
//!
//! The repository owns the schema and raw queries. Every method takes the
//! tenant explicitly and must never return rows of another tenant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::BoxError;
use crate::event::EventRecord;
use crate::identifiers::{AggregateId, AggregateType, GlobalSequence, SequenceNumber, TenantId};
use crate::snapshot::SnapshotRecord;
use crate::token::TrackingToken;

/// A fully prepared event row awaiting its global sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type of the owning aggregate.
    pub aggregate_type: AggregateType,
    /// Owning aggregate within the tenant.
    pub aggregate_id: AggregateId,
    /// Position within the aggregate stream.
    pub sequence_number: SequenceNumber,
    /// Type tag for payload decoding.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Serialized event metadata.
    pub metadata: serde_json::Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    /// Completes the row with its tenant and database-assigned position.
    #[must_use]
    pub fn into_record(self, tenant_id: TenantId, global_sequence: GlobalSequence) -> EventRecord {
        EventRecord {
            event_id: self.event_id,
            tenant_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
            global_sequence,
            event_type: self.event_type,
            payload: self.payload,
            metadata: self.metadata,
            timestamp: self.timestamp,
        }
    }
}

/// Failures reported by a repository implementation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The stream already holds the sequence number.
    #[error("sequence {sequence_number} of aggregate {aggregate_id} is already taken")]
    Conflict {
        /// The contested aggregate.
        aggregate_id: AggregateId,
        /// The contested sequence number.
        sequence_number: SequenceNumber,
    },

    /// The batch would leave a hole in the stream.
    #[error("aggregate {aggregate_id} expects sequence {expected} next, got {actual}")]
    SequenceGap {
        /// The aggregate being appended to.
        aggregate_id: AggregateId,
        /// The next free sequence number.
        expected: SequenceNumber,
        /// The sequence number the batch started at.
        actual: SequenceNumber,
    },

    /// Connectivity, timeout, pool exhaustion or serialization failure.
    #[error("transient storage failure")]
    Transient(#[source] BoxError),

    /// A stored row could not be mapped into the record model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Any other backend failure.
    #[error("storage backend failure")]
    Backend(#[source] BoxError),
}

/// Repository trait for event and snapshot persistence.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Inserts `events` in one transaction, all or nothing, letting the
    /// database assign global sequences in slice order.
    ///
    /// For each aggregate in the batch, the first event must sit directly
    /// after the stored stream head: at or below it is a `Conflict`, above it
    /// is a `SequenceGap`. A uniqueness violation on
    /// `(tenant, aggregate, sequence)` is reported as `Conflict`.
    async fn insert_events(
        &self,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError>;

    /// Reads up to `limit` events of one stream with
    /// `sequence_number >= from`, ascending.
    async fn read_stream(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError>;

    /// Reads up to `limit` tenant events after `after` in global order,
    /// skipping the listed event types.
    async fn read_tracked(
        &self,
        tenant: &TenantId,
        after: TrackingToken,
        excluded_event_types: &[String],
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError>;

    /// Returns the highest sequence number of a stream.
    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError>;

    /// Returns the highest global sequence committed for the tenant.
    async fn max_global_sequence(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError>;

    /// Returns the global sequence of the tenant's first event with a
    /// timestamp at or after `since`.
    async fn first_global_sequence_since(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError>;

    /// Stores a snapshot, replacing the current one for the same aggregate
    /// unless that one is at a higher sequence number.
    async fn upsert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), RepositoryError>;

    /// Returns the newest snapshot of an aggregate.
    async fn find_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError>;
}
