//! In-memory `EventRepository` with the same constraint semantics as the
//! PostgreSQL adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_core::event::EventRecord;
use tessera_core::identifiers::{
    AggregateId, AggregateType, GlobalSequence, SequenceNumber, TenantId,
};
use tessera_core::repository::{EventRepository, NewEvent, RepositoryError};
use tessera_core::snapshot::SnapshotRecord;
use tessera_core::token::TrackingToken;

type SnapshotKey = (TenantId, AggregateType, AggregateId);

#[derive(Debug, Default)]
struct State {
    /// All tenants' events in global order.
    events: Vec<EventRecord>,
    last_global: u64,
    snapshots: HashMap<SnapshotKey, SnapshotRecord>,
}

impl State {
    fn head(&self, tenant: &TenantId, aggregate_id: &AggregateId) -> Option<SequenceNumber> {
        self.events
            .iter()
            .filter(|e| &e.tenant_id == tenant && &e.aggregate_id == aggregate_id)
            .map(|e| e.sequence_number)
            .max()
    }

    fn is_taken(&self, tenant: &TenantId, event: &NewEvent) -> bool {
        self.events.iter().any(|e| {
            &e.tenant_id == tenant
                && e.aggregate_id == event.aggregate_id
                && e.sequence_number == event.sequence_number
        })
    }
}

/// Event repository backed by a mutex-guarded vector.
///
/// Enforces uniqueness of `(tenant, aggregate, sequence)`, assigns global
/// sequences from a single counter and applies batches all or nothing.
#[derive(Debug, Default)]
pub struct InMemoryEventRepository {
    state: Mutex<State>,
}

impl InMemoryEventRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored event of every tenant in global order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_events(&self) -> Vec<EventRecord> {
        self.state.lock().unwrap().events.clone()
    }

    /// Returns the number of stored snapshots across all tenants.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn insert_events(
        &self,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();

        let mut checked: Vec<&AggregateId> = Vec::new();
        for event in events {
            if checked.contains(&&event.aggregate_id) {
                continue;
            }
            checked.push(&event.aggregate_id);
            let Some(expected) = state
                .head(tenant, &event.aggregate_id)
                .map_or(Some(SequenceNumber::FIRST), SequenceNumber::checked_next)
            else {
                return Err(RepositoryError::Conflict {
                    aggregate_id: event.aggregate_id.clone(),
                    sequence_number: event.sequence_number,
                });
            };
            if event.sequence_number < expected {
                return Err(RepositoryError::Conflict {
                    aggregate_id: event.aggregate_id.clone(),
                    sequence_number: event.sequence_number,
                });
            }
            if event.sequence_number > expected {
                return Err(RepositoryError::SequenceGap {
                    aggregate_id: event.aggregate_id.clone(),
                    expected,
                    actual: event.sequence_number,
                });
            }
        }

        for (index, event) in events.iter().enumerate() {
            let duplicate_in_batch = events[..index].iter().any(|earlier| {
                earlier.aggregate_id == event.aggregate_id
                    && earlier.sequence_number == event.sequence_number
            });
            if duplicate_in_batch || state.is_taken(tenant, event) {
                return Err(RepositoryError::Conflict {
                    aggregate_id: event.aggregate_id.clone(),
                    sequence_number: event.sequence_number,
                });
            }
        }

        for event in events {
            state.last_global += 1;
            let global_sequence = GlobalSequence::new(state.last_global);
            state
                .events
                .push(event.clone().into_record(tenant.clone(), global_sequence));
        }
        Ok(())
    }

    async fn read_stream(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| {
                &e.tenant_id == tenant
                    && &e.aggregate_id == aggregate_id
                    && e.sequence_number >= from
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.sequence_number);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn read_tracked(
        &self,
        tenant: &TenantId,
        after: TrackingToken,
        excluded_event_types: &[String],
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|e| {
                &e.tenant_id == tenant
                    && after.covers(e.global_sequence)
                    && !excluded_event_types.contains(&e.event_type)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError> {
        Ok(self.state.lock().unwrap().head(tenant, aggregate_id))
    }

    async fn max_global_sequence(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|e| &e.tenant_id == tenant)
            .map(|e| e.global_sequence)
            .max())
    }

    async fn first_global_sequence_since(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|e| &e.tenant_id == tenant && e.timestamp >= since)
            .map(|e| e.global_sequence)
            .min())
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let key = (
            snapshot.tenant_id.clone(),
            snapshot.aggregate_type.clone(),
            snapshot.aggregate_id.clone(),
        );
        match state.snapshots.get(&key) {
            Some(current) if current.sequence_number > snapshot.sequence_number => {}
            _ => {
                state.snapshots.insert(key, snapshot.clone());
            }
        }
        Ok(())
    }

    async fn find_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .values()
            .filter(|s| &s.tenant_id == tenant && &s.aggregate_id == aggregate_id)
            .max_by_key(|s| (s.sequence_number, s.timestamp))
            .cloned())
    }
}
