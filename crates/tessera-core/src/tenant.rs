//! Tenant enforcement.
//!
//! `TenantEnforcedEventStore` wraps a `RawEventStore` and resolves the tenant
//! of every call from an injected `TenantContextProvider`. A call without a
//! tenant fails with `StorageError::MissingTenantContext` before the wrapped
//! store is touched. A call with a tenant holds a `TenantBinding` for its
//! duration; the binding returns to `NoContext` when dropped, whatever way the
//! call ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppendError, StorageError};
use crate::event::{EventBatch, EventRecord, TrackedEventRecord};
use crate::identifiers::{AggregateId, SequenceNumber, TenantId};
use crate::snapshot::{PendingSnapshot, SnapshotRecord};
use crate::store::RawEventStore;
use crate::stream::EventStream;
use crate::token::TrackingToken;

/// Capability that yields the tenant of the current call, if any.
pub trait TenantContextProvider: Send + Sync {
    /// Returns the current tenant, or `None` if no tenant is bound.
    fn current_tenant(&self) -> Option<TenantId>;
}

/// An explicitly captured tenant context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantContext(Option<TenantId>);

impl TenantContext {
    /// A context bound to `tenant`.
    #[must_use]
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self(Some(tenant))
    }

    /// A context with no tenant.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }
}

impl TenantContextProvider for TenantContext {
    fn current_tenant(&self) -> Option<TenantId> {
        self.0.clone()
    }
}

impl<F> TenantContextProvider for F
where
    F: Fn() -> Option<TenantId> + Send + Sync,
{
    fn current_tenant(&self) -> Option<TenantId> {
        self()
    }
}

/// State of a tenant binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    /// No tenant is bound.
    NoContext,
    /// The tenant bound for the running operation.
    ContextSet(TenantId),
}

/// Scoped binding of a tenant to one operation.
///
/// Counts itself in the owning store's active-binding gauge while set and
/// returns to `NoContext` on drop.
#[derive(Debug)]
pub struct TenantBinding {
    state: BindingState,
    active: Arc<AtomicUsize>,
}

impl TenantBinding {
    fn bind(tenant: TenantId, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            state: BindingState::ContextSet(tenant),
            active,
        }
    }

    /// Returns the bound tenant.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::MissingTenantContext` once the binding is
    /// released.
    pub fn tenant(&self) -> Result<&TenantId, StorageError> {
        match &self.state {
            BindingState::ContextSet(tenant) => Ok(tenant),
            BindingState::NoContext => Err(StorageError::MissingTenantContext),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &BindingState {
        &self.state
    }

    /// Releases the binding early. Idempotent.
    pub fn release(&mut self) {
        if matches!(self.state, BindingState::ContextSet(_)) {
            self.state = BindingState::NoContext;
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for TenantBinding {
    fn drop(&mut self) {
        self.release();
    }
}

/// Event store that requires a tenant on every call.
pub struct TenantEnforcedEventStore<S: ?Sized> {
    inner: Arc<S>,
    provider: Arc<dyn TenantContextProvider>,
    active: Arc<AtomicUsize>,
}

impl<S: ?Sized> Clone for TenantEnforcedEventStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            provider: Arc::clone(&self.provider),
            active: Arc::clone(&self.active),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for TenantEnforcedEventStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantEnforcedEventStore")
            .field("active_bindings", &self.active.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<S> TenantEnforcedEventStore<S>
where
    S: RawEventStore + ?Sized,
{
    /// Wraps `inner`, resolving tenants through `provider`.
    #[must_use]
    pub fn new(inner: Arc<S>, provider: Arc<dyn TenantContextProvider>) -> Self {
        Self {
            inner,
            provider,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a store over the same inner store that resolves tenants
    /// through `provider`. Used to hand a captured context to another task.
    #[must_use]
    pub fn with_provider(&self, provider: Arc<dyn TenantContextProvider>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            provider,
            active: Arc::clone(&self.active),
        }
    }

    /// Number of operations currently holding a tenant binding, across this
    /// store and every store derived from it with `with_provider`.
    #[must_use]
    pub fn active_bindings(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reads the provider once and binds the tenant for one operation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::MissingTenantContext` if the provider has no
    /// tenant.
    pub fn bind(&self) -> Result<TenantBinding, StorageError> {
        let tenant = self.provider.current_tenant().ok_or_else(|| {
            tracing::debug!("rejecting call without tenant context");
            StorageError::MissingTenantContext
        })?;
        Ok(TenantBinding::bind(tenant, Arc::clone(&self.active)))
    }

    /// Appends a batch of events for the current tenant.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant, `ConcurrencyConflict`
    /// if a sequence number is taken, `InvalidBatch` on a malformed batch, or
    /// a storage fault.
    pub async fn append_events(&self, batch: EventBatch) -> Result<(), AppendError> {
        let binding = self.bind()?;
        self.inner.append_events(binding.tenant()?, batch).await
    }

    /// Streams an aggregate's events from `from` onwards.
    ///
    /// The tenant is captured into the stream when the call returns.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant. Storage failures are
    /// reported through the stream.
    pub fn read_events(
        &self,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
    ) -> Result<EventStream<EventRecord>, StorageError> {
        let binding = self.bind()?;
        Ok(self.inner.read_events(binding.tenant()?, aggregate_id, from))
    }

    /// Returns the head of an aggregate stream.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant, or a storage fault.
    pub async fn last_sequence_number(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, StorageError> {
        let binding = self.bind()?;
        self.inner
            .last_sequence_number(binding.tenant()?, aggregate_id)
            .await
    }

    /// Token before any of the current tenant's events.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant.
    pub fn create_tail_token(&self) -> Result<TrackingToken, StorageError> {
        let binding = self.bind()?;
        Ok(self.inner.create_tail_token(binding.tenant()?))
    }

    /// Token at the current tenant's highest committed event.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant, or a storage fault.
    pub async fn create_head_token(&self) -> Result<TrackingToken, StorageError> {
        let binding = self.bind()?;
        self.inner.create_head_token(binding.tenant()?).await
    }

    /// Token just before the current tenant's first event at or after `at`.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant, or a storage fault.
    pub async fn create_token_at(&self, at: DateTime<Utc>) -> Result<TrackingToken, StorageError> {
        let binding = self.bind()?;
        self.inner.create_token_at(binding.tenant()?, at).await
    }

    /// Streams the current tenant's events after `from` in global order.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant.
    pub fn read_tracked_events(
        &self,
        from: TrackingToken,
        include_snapshot_events: bool,
    ) -> Result<EventStream<TrackedEventRecord>, StorageError> {
        let binding = self.bind()?;
        Ok(self
            .inner
            .read_tracked_events(binding.tenant()?, from, include_snapshot_events))
    }

    /// Streams the current tenant's events after `from`, polling for new
    /// events once the head is reached.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant.
    pub fn follow_tracked_events(
        &self,
        from: TrackingToken,
        include_snapshot_events: bool,
        poll_interval: Duration,
    ) -> Result<EventStream<TrackedEventRecord>, StorageError> {
        let binding = self.bind()?;
        Ok(self.inner.follow_tracked_events(
            binding.tenant()?,
            from,
            include_snapshot_events,
            poll_interval,
        ))
    }

    /// Stores a snapshot for the current tenant.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant, or a storage fault.
    pub async fn store_snapshot(&self, snapshot: PendingSnapshot) -> Result<(), StorageError> {
        let binding = self.bind()?;
        self.inner.store_snapshot(binding.tenant()?, snapshot).await
    }

    /// Returns the newest snapshot of one of the current tenant's aggregates.
    ///
    /// # Errors
    ///
    /// Returns `MissingTenantContext` without a tenant, or a storage fault.
    pub async fn read_snapshot(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let binding = self.bind()?;
        self.inner
            .read_snapshot(binding.tenant()?, aggregate_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    #[test]
    fn test_binding_moves_through_context_set_back_to_no_context() {
        // Arrange
        let gauge = Arc::new(AtomicUsize::new(0));

        // Act
        let mut binding = TenantBinding::bind(acme(), Arc::clone(&gauge));

        // Assert
        assert_eq!(binding.state(), &BindingState::ContextSet(acme()));
        assert_eq!(gauge.load(Ordering::Acquire), 1);

        binding.release();
        assert_eq!(binding.state(), &BindingState::NoContext);
        assert!(matches!(
            binding.tenant(),
            Err(StorageError::MissingTenantContext)
        ));
        assert_eq!(gauge.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_release_is_idempotent_and_drop_does_not_double_count() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let mut binding = TenantBinding::bind(acme(), Arc::clone(&gauge));

        binding.release();
        binding.release();
        drop(binding);

        assert_eq!(gauge.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_binding_is_released_when_unwinding() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&gauge);

        let outcome = std::panic::catch_unwind(move || {
            let _binding = TenantBinding::bind(acme(), shared);
            panic!("operation failed");
        });

        assert!(outcome.is_err());
        assert_eq!(gauge.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_tenant_context_provides_its_tenant() {
        assert_eq!(
            TenantContext::for_tenant(acme()).current_tenant(),
            Some(acme())
        );
        assert_eq!(TenantContext::none().current_tenant(), None);
    }

    #[test]
    fn test_closures_are_providers() {
        let provider = || TenantId::new("globex").ok();
        assert_eq!(
            provider.current_tenant(),
            Some(TenantId::new("globex").unwrap())
        );
    }
}
