//! Identifier value types for tenants, aggregates and event positions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Tenant scope of every stored row. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::MissingTenantContext` if `value` is empty or
    /// whitespace only, since such a value cannot scope a query.
    pub fn new(value: impl Into<String>) -> Result<Self, StorageError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(StorageError::MissingTenantContext);
        }
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type name of an aggregate, e.g. `"Order"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

impl AggregateType {
    /// Creates an aggregate type name.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the type name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate identifier. Unique only within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    /// Creates an aggregate identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Zero-based position of an event within its aggregate stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The first position of every stream.
    pub const FIRST: Self = Self(0);

    /// The last position a stream may hold. Matches the range of a signed
    /// 64-bit column so that every accepted number is storable.
    pub const MAX: Self = Self(i64::MAX.unsigned_abs());

    /// Wraps a raw sequence value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the following position, saturating at `u64::MAX`.
    ///
    /// Use `checked_next` when the result will be written.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the following position, or `None` once `MAX` is reached.
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        if self.0 < Self::MAX.0 {
            Some(Self(self.0 + 1))
        } else {
            None
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Table-wide monotonic position assigned by the database on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalSequence(u64);

impl GlobalSequence {
    /// Wraps a raw global sequence value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the position immediately before this one, if any.
    #[must_use]
    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for GlobalSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_rejects_blank_values() {
        assert!(matches!(
            TenantId::new(""),
            Err(StorageError::MissingTenantContext)
        ));
        assert!(matches!(
            TenantId::new("   "),
            Err(StorageError::MissingTenantContext)
        ));
    }

    #[test]
    fn test_tenant_id_keeps_value_verbatim() {
        let tenant = TenantId::new("acme").unwrap();
        assert_eq!(tenant.as_str(), "acme");
        assert_eq!(tenant.to_string(), "acme");
    }

    #[test]
    fn test_sequence_number_next_increments() {
        assert_eq!(SequenceNumber::FIRST.next(), SequenceNumber::new(1));
    }

    #[test]
    fn test_sequence_number_checked_next_stops_at_max() {
        assert_eq!(
            SequenceNumber::new(41).checked_next(),
            Some(SequenceNumber::new(42))
        );
        assert_eq!(SequenceNumber::MAX.checked_next(), None);
        assert_eq!(SequenceNumber::new(u64::MAX).checked_next(), None);
        assert_eq!(SequenceNumber::new(u64::MAX).next().value(), u64::MAX);
    }

    #[test]
    fn test_global_sequence_previous_stops_at_zero() {
        assert_eq!(
            GlobalSequence::new(5).previous(),
            Some(GlobalSequence::new(4))
        );
        assert_eq!(GlobalSequence::new(0).previous(), None);
    }
}
