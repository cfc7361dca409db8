//! Event record model: what callers append and what the engine returns.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::EventPayload;
use crate::error::StorageError;
use crate::identifiers::{AggregateId, AggregateType, GlobalSequence, SequenceNumber, TenantId};
use crate::token::TrackingToken;

/// An event submitted for appending.
///
/// The tenant is taken from the call's context, not from the event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    /// Type of the owning aggregate.
    pub aggregate_type: AggregateType,
    /// Owning aggregate within the tenant.
    pub aggregate_id: AggregateId,
    /// Caller-assigned position, or `None` to append at the end of the stream.
    pub sequence_number: Option<SequenceNumber>,
    /// Type tag for payload decoding.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Serialized event metadata.
    pub metadata: serde_json::Value,
}

impl PendingEvent {
    /// Creates an unnumbered event with empty metadata.
    #[must_use]
    pub fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
            sequence_number: None,
            event_type: event_type.into(),
            payload,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Creates an unnumbered event from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidBatch` if the payload cannot be encoded.
    pub fn from_payload<P: EventPayload>(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        payload: &P,
    ) -> Result<Self, StorageError> {
        let value = serde_json::to_value(payload).map_err(|e| {
            StorageError::InvalidBatch(format!(
                "payload of type {} cannot be encoded: {e}",
                payload.event_type()
            ))
        })?;
        Ok(Self::new(
            aggregate_type,
            aggregate_id,
            payload.event_type(),
            value,
        ))
    }

    /// Pins the event to an explicit stream position.
    #[must_use]
    pub fn at_sequence(mut self, sequence_number: SequenceNumber) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    /// Replaces the event metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A non-empty list of events appended in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch(Vec<PendingEvent>);

impl EventBatch {
    /// Creates a batch.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidBatch` if `events` is empty.
    pub fn new(events: Vec<PendingEvent>) -> Result<Self, StorageError> {
        if events.is_empty() {
            return Err(StorageError::InvalidBatch(
                "an event batch must contain at least one event".into(),
            ));
        }
        Ok(Self(events))
    }

    /// Creates a batch holding exactly one event.
    #[must_use]
    pub fn single(event: PendingEvent) -> Self {
        Self(vec![event])
    }

    /// Number of events in the batch. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; present for API symmetry with collections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The events in submission order.
    #[must_use]
    pub fn events(&self) -> &[PendingEvent] {
        &self.0
    }

    /// Consumes the batch, returning the events in submission order.
    #[must_use]
    pub fn into_events(self) -> Vec<PendingEvent> {
        self.0
    }
}

impl From<PendingEvent> for EventBatch {
    fn from(event: PendingEvent) -> Self {
        Self::single(event)
    }
}

/// One committed, immutable event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Tenant that owns the event.
    pub tenant_id: TenantId,
    /// Type of the owning aggregate.
    pub aggregate_type: AggregateType,
    /// Owning aggregate within the tenant.
    pub aggregate_id: AggregateId,
    /// Position within the aggregate stream.
    pub sequence_number: SequenceNumber,
    /// Table-wide position.
    pub global_sequence: GlobalSequence,
    /// Type tag for payload decoding.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Serialized event metadata.
    pub metadata: serde_json::Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Decodes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::CorruptRecord` if the payload does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StorageError::CorruptRecord(format!(
                "event {} ({}) payload failed to decode: {e}",
                self.event_id, self.event_type
            ))
        })
    }
}

/// An event read from the global stream, paired with the token that resumes
/// reading right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEventRecord {
    /// Token positioned at this event.
    pub token: TrackingToken,
    /// The event itself.
    pub event: EventRecord,
}

impl TrackedEventRecord {
    /// Wraps `event` with a token at its global sequence.
    #[must_use]
    pub fn new(event: EventRecord) -> Self {
        Self {
            token: TrackingToken::at(event.global_sequence),
            event,
        }
    }
}
