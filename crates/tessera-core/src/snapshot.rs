//! Aggregate snapshots.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::identifiers::{AggregateId, AggregateType, SequenceNumber, TenantId};

/// A snapshot submitted for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSnapshot {
    /// Type of the snapshotted aggregate.
    pub aggregate_type: AggregateType,
    /// Snapshotted aggregate.
    pub aggregate_id: AggregateId,
    /// Sequence number of the last event folded into the state.
    pub sequence_number: SequenceNumber,
    /// Serialized aggregate state.
    pub payload: serde_json::Value,
    /// Serialized snapshot metadata.
    pub metadata: serde_json::Value,
}

impl PendingSnapshot {
    /// Creates a snapshot of an aggregate's state taken at `sequence_number`.
    #[must_use]
    pub fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        sequence_number: SequenceNumber,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
            sequence_number,
            payload,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Creates a snapshot from a serializable state value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidBatch` if `state` cannot be encoded.
    pub fn from_state<T: Serialize>(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        sequence_number: SequenceNumber,
        state: &T,
    ) -> Result<Self, StorageError> {
        let payload = serde_json::to_value(state).map_err(|e| {
            StorageError::InvalidBatch(format!("snapshot state cannot be encoded: {e}"))
        })?;
        Ok(Self::new(
            aggregate_type,
            aggregate_id,
            sequence_number,
            payload,
        ))
    }

    /// Replaces the snapshot metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stamps the snapshot with its tenant and time of storage.
    #[must_use]
    pub fn into_record(self, tenant_id: TenantId, timestamp: DateTime<Utc>) -> SnapshotRecord {
        SnapshotRecord {
            tenant_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            sequence_number: self.sequence_number,
            payload: self.payload,
            metadata: self.metadata,
            timestamp,
        }
    }
}

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Tenant that owns the snapshot.
    pub tenant_id: TenantId,
    /// Type of the snapshotted aggregate.
    pub aggregate_type: AggregateType,
    /// Snapshotted aggregate.
    pub aggregate_id: AggregateId,
    /// Sequence number of the last event folded into the state.
    pub sequence_number: SequenceNumber,
    /// Serialized aggregate state.
    pub payload: serde_json::Value,
    /// Serialized snapshot metadata.
    pub metadata: serde_json::Value,
    /// When the snapshot was stored.
    pub timestamp: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Decodes the stored state into `T`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::CorruptRecord` if the payload does not match `T`.
    pub fn decode_state<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StorageError::CorruptRecord(format!(
                "snapshot of aggregate {} at sequence {} failed to decode: {e}",
                self.aggregate_id, self.sequence_number
            ))
        })
    }
}
