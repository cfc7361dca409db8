//! Payload encoding and the event type registry.
//!
//! Payloads are stored as JSON next to a type tag. On the way out, the
//! registry maps each tag to a decode function that yields one variant of a
//! caller-defined sum type, so unknown or malformed rows are rejected at the
//! serialization boundary instead of deep inside a handler.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;
use crate::event::EventRecord;

/// A typed event payload that knows its own type tag.
pub trait EventPayload: Serialize {
    /// Returns the type tag stored in `event_type`.
    fn event_type(&self) -> &'static str;
}

type Decoder<E> = Box<dyn Fn(serde_json::Value) -> Result<E, serde_json::Error> + Send + Sync>;

/// Maps event type tags to decode functions producing `E`.
pub struct EventTypeRegistry<E> {
    decoders: HashMap<String, Decoder<E>>,
}

impl<E: 'static> EventTypeRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers `event_type`, decoding its payload as `T` and wrapping it
    /// with `wrap`. A later registration of the same tag replaces the earlier.
    #[must_use]
    pub fn register<T>(mut self, event_type: impl Into<String>, wrap: fn(T) -> E) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        self.decoders.insert(
            event_type.into(),
            Box::new(move |value| serde_json::from_value::<T>(value).map(wrap)),
        );
        self
    }

    /// Returns `true` if `event_type` has a decoder.
    #[must_use]
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Decodes the payload of `record`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::CorruptRecord` if the type tag is unknown or the
    /// payload does not match the registered type.
    pub fn decode(&self, record: &EventRecord) -> Result<E, StorageError> {
        let decoder = self.decoders.get(&record.event_type).ok_or_else(|| {
            StorageError::CorruptRecord(format!(
                "event {} has unregistered type {}",
                record.event_id, record.event_type
            ))
        })?;
        decoder(record.payload.clone()).map_err(|e| {
            StorageError::CorruptRecord(format!(
                "event {} ({}) payload failed to decode: {e}",
                record.event_id, record.event_type
            ))
        })
    }
}

impl<E: 'static> Default for EventTypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventTypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("EventTypeRegistry")
            .field("event_types", &tags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::identifiers::{AggregateId, AggregateType, GlobalSequence, SequenceNumber, TenantId};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        total: u32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderShipped {
        carrier: String,
    }

    #[derive(Debug, PartialEq)]
    enum OrderEvent {
        Placed(OrderPlaced),
        Shipped(OrderShipped),
    }

    impl EventPayload for OrderPlaced {
        fn event_type(&self) -> &'static str {
            "order.placed"
        }
    }

    fn registry() -> EventTypeRegistry<OrderEvent> {
        EventTypeRegistry::new()
            .register("order.placed", OrderEvent::Placed)
            .register("order.shipped", OrderEvent::Shipped)
    }

    fn record(event_type: &str, payload: serde_json::Value) -> EventRecord {
        EventRecord {
            event_id: Uuid::now_v7(),
            tenant_id: TenantId::new("acme").unwrap(),
            aggregate_type: AggregateType::new("Order"),
            aggregate_id: AggregateId::new("order-1"),
            sequence_number: SequenceNumber::FIRST,
            global_sequence: GlobalSequence::new(1),
            event_type: event_type.into(),
            payload,
            metadata: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_decode_dispatches_on_type_tag() {
        let registry = registry();

        let placed = registry
            .decode(&record("order.placed", json!({"total": 30})))
            .unwrap();
        let shipped = registry
            .decode(&record("order.shipped", json!({"carrier": "ups"})))
            .unwrap();

        assert_eq!(placed, OrderEvent::Placed(OrderPlaced { total: 30 }));
        assert_eq!(
            shipped,
            OrderEvent::Shipped(OrderShipped {
                carrier: "ups".into()
            })
        );
    }

    #[test]
    fn test_unknown_type_tag_is_corrupt_record() {
        let result = registry().decode(&record("order.cancelled", json!({})));
        assert!(matches!(result, Err(StorageError::CorruptRecord(_))));
    }

    #[test]
    fn test_mismatched_payload_is_corrupt_record() {
        let result = registry().decode(&record("order.placed", json!({"total": "lots"})));
        assert!(matches!(result, Err(StorageError::CorruptRecord(_))));
    }

    #[test]
    fn test_payload_type_tag_matches_registration() {
        let payload = OrderPlaced { total: 1 };
        assert!(registry().is_registered(payload.event_type()));
    }
}
