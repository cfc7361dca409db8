//! Engine-level error taxonomy.

use thiserror::Error;

use crate::identifiers::{AggregateId, SequenceNumber};

/// Boxed cause carried by storage faults for diagnostics.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure the engine reports to callers.
///
/// Nothing backend specific leaks through this type; the original cause of a
/// storage fault is kept as its `source`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No tenant is bound to the current call.
    #[error("no tenant context is bound to the current call")]
    MissingTenantContext,

    /// The append collides with an already committed sequence number.
    #[error("concurrency conflict on aggregate {aggregate_id} at sequence {sequence_number}")]
    ConcurrencyConflict {
        /// The aggregate whose stream already holds the slot.
        aggregate_id: AggregateId,
        /// The contested sequence number.
        sequence_number: SequenceNumber,
    },

    /// The batch violates the append contract.
    #[error("invalid event batch: {0}")]
    InvalidBatch(String),

    /// Connectivity, timeout or serialization fault. Safe to retry with backoff.
    #[error("transient storage fault during {operation}")]
    TransientStorageFault {
        /// The engine operation that failed.
        operation: &'static str,
        /// The underlying cause.
        #[source]
        source: BoxError,
    },

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Any other backend failure.
    #[error("unexpected storage fault during {operation}")]
    UnknownStorageFault {
        /// The engine operation that failed.
        operation: &'static str,
        /// The underlying cause.
        #[source]
        source: BoxError,
    },
}

/// Error returned by appends.
pub type AppendError = StorageError;

impl StorageError {
    /// Returns `true` if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorageFault { .. })
    }

    /// Returns `true` if the caller should reload state and retry with
    /// recomputed sequence numbers.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_only_transient_faults_are_transient() {
        let transient = StorageError::TransientStorageFault {
            operation: "read_events",
            source: "connection reset".into(),
        };
        let unknown = StorageError::UnknownStorageFault {
            operation: "read_events",
            source: "syntax error".into(),
        };

        assert!(transient.is_transient());
        assert!(!unknown.is_transient());
        assert!(!StorageError::MissingTenantContext.is_transient());
    }

    #[test]
    fn test_conflict_is_distinguishable() {
        let conflict = StorageError::ConcurrencyConflict {
            aggregate_id: AggregateId::new("order-1"),
            sequence_number: SequenceNumber::new(1),
        };

        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());
        assert_eq!(
            conflict.to_string(),
            "concurrency conflict on aggregate order-1 at sequence 1"
        );
    }

    #[test]
    fn test_storage_faults_preserve_their_cause() {
        let err = StorageError::UnknownStorageFault {
            operation: "store_snapshot",
            source: "disk full".into(),
        };

        assert_eq!(err.source().unwrap().to_string(), "disk full");
    }
}
