//! Event fixtures shared by engine and adapter tests.

use serde_json::json;
use tessera_core::event::PendingEvent;
use tessera_core::identifiers::{AggregateId, AggregateType, SequenceNumber, TenantId};
use tessera_core::snapshot::PendingSnapshot;

/// Builds a tenant identifier.
///
/// # Panics
///
/// Panics if `name` is blank.
#[must_use]
pub fn tenant(name: &str) -> TenantId {
    TenantId::new(name).expect("fixture tenant names are never blank")
}

/// Builds an `Order` event pinned to `sequence_number`.
#[must_use]
pub fn order_event(aggregate_id: &str, sequence_number: u64) -> PendingEvent {
    unnumbered_order_event(aggregate_id).at_sequence(SequenceNumber::new(sequence_number))
}

/// Builds an `Order` event that the engine appends at the end of the stream.
#[must_use]
pub fn unnumbered_order_event(aggregate_id: &str) -> PendingEvent {
    PendingEvent::new(
        AggregateType::new("Order"),
        AggregateId::new(aggregate_id),
        "order.line_added",
        json!({"sku": "SKU-1", "quantity": 1}),
    )
}

/// Builds a snapshot of an `Order` aggregate at `sequence_number`.
#[must_use]
pub fn order_snapshot(aggregate_id: &str, sequence_number: u64) -> PendingSnapshot {
    PendingSnapshot::new(
        AggregateType::new("Order"),
        AggregateId::new(aggregate_id),
        SequenceNumber::new(sequence_number),
        json!({"lines": sequence_number + 1}),
    )
}
