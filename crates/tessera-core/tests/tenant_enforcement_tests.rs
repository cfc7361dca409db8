//! Integration tests for `TenantEnforcedEventStore`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use tessera_core::{
    AggregateId, EventRecord, EventStorageEngine, SequenceNumber, StorageError, TenantContext,
    TenantContextProvider, TenantEnforcedEventStore, TenantId, TrackingToken,
};
use tessera_test_support::{
    Failure, FailingEventRepository, InMemoryEventRepository, SpyEventRepository, order_event,
    order_snapshot, tenant,
};
use tokio::sync::Barrier;

type InMemoryEngine = EventStorageEngine<InMemoryEventRepository>;

fn provider(name: &str) -> Arc<dyn TenantContextProvider> {
    Arc::new(TenantContext::for_tenant(tenant(name)))
}

fn shared_engine() -> (Arc<InMemoryEventRepository>, Arc<InMemoryEngine>) {
    let repo = Arc::new(InMemoryEventRepository::new());
    let engine = Arc::new(EventStorageEngine::new(Arc::clone(&repo)));
    (repo, engine)
}

async fn read_all(
    store: &TenantEnforcedEventStore<InMemoryEngine>,
    aggregate_id: &str,
) -> Vec<EventRecord> {
    store
        .read_events(&AggregateId::new(aggregate_id), SequenceNumber::FIRST)
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

fn assert_missing<T: std::fmt::Debug>(result: Result<T, StorageError>) {
    assert!(
        matches!(result, Err(StorageError::MissingTenantContext)),
        "expected MissingTenantContext, got {result:?}"
    );
}

// --- missing context ---

#[tokio::test]
async fn test_every_operation_without_tenant_is_rejected_before_storage() {
    // Arrange
    let spy = Arc::new(SpyEventRepository::new(InMemoryEventRepository::new()));
    let engine = Arc::new(EventStorageEngine::new(Arc::clone(&spy)));
    let store = TenantEnforcedEventStore::new(engine, Arc::new(TenantContext::none()));
    let order = AggregateId::new("order-1");

    // Act + Assert
    assert_missing(store.append_events(order_event("order-1", 0).into()).await);
    assert_missing(store.read_events(&order, SequenceNumber::FIRST).map(drop));
    assert_missing(store.last_sequence_number(&order).await);
    assert_missing(store.create_tail_token());
    assert_missing(store.create_head_token().await);
    assert_missing(store.create_token_at(Utc::now()).await);
    assert_missing(store.read_tracked_events(TrackingToken::tail(), true).map(drop));
    assert_missing(
        store
            .follow_tracked_events(TrackingToken::tail(), true, Duration::from_millis(10))
            .map(drop),
    );
    assert_missing(store.store_snapshot(order_snapshot("order-1", 0)).await);
    assert_missing(store.read_snapshot(&order).await);

    assert_eq!(spy.call_count(), 0);
    assert_eq!(store.active_bindings(), 0);
}

#[tokio::test]
async fn test_provider_is_consulted_on_every_call() {
    // Arrange
    let (_repo, engine) = shared_engine();
    let current: Arc<Mutex<Option<TenantId>>> = Arc::new(Mutex::new(None));
    let source = Arc::clone(&current);
    let store = TenantEnforcedEventStore::new(
        engine,
        Arc::new(move || source.lock().unwrap().clone()),
    );

    // Act + Assert
    assert_missing(store.create_head_token().await);
    *current.lock().unwrap() = Some(tenant("acme"));
    assert!(store.create_head_token().await.is_ok());
    *current.lock().unwrap() = None;
    assert_missing(store.create_head_token().await);
}

// --- isolation ---

#[tokio::test]
async fn test_colliding_aggregate_ids_stay_isolated_per_tenant() {
    // Arrange
    let (_repo, engine) = shared_engine();
    let acme = TenantEnforcedEventStore::new(Arc::clone(&engine), provider("acme"));
    let globex = acme.with_provider(provider("globex"));

    // Act
    acme.append_events(order_event("order-1", 0).into())
        .await
        .unwrap();
    acme.append_events(order_event("order-1", 1).into())
        .await
        .unwrap();
    globex
        .append_events(order_event("order-1", 0).into())
        .await
        .unwrap();
    acme.store_snapshot(order_snapshot("order-1", 1))
        .await
        .unwrap();

    // Assert
    let acme_events = read_all(&acme, "order-1").await;
    let globex_events = read_all(&globex, "order-1").await;
    assert_eq!(acme_events.len(), 2);
    assert_eq!(globex_events.len(), 1);
    assert!(acme_events.iter().all(|e| e.tenant_id == tenant("acme")));
    assert!(globex_events.iter().all(|e| e.tenant_id == tenant("globex")));

    let globex_tracked: Vec<_> = globex
        .read_tracked_events(TrackingToken::tail(), true)
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(globex_tracked.len(), 1);
    assert!(
        globex
            .read_snapshot(&AggregateId::new("order-1"))
            .await
            .unwrap()
            .is_none()
    );
    assert_ne!(
        acme.create_head_token().await.unwrap(),
        globex.create_head_token().await.unwrap()
    );
}

#[tokio::test]
async fn test_stream_keeps_the_tenant_it_was_created_with() {
    // Arrange
    let (_repo, engine) = shared_engine();
    let acme = TenantEnforcedEventStore::new(Arc::clone(&engine), provider("acme"));
    let globex = acme.with_provider(provider("globex"));
    acme.append_events(order_event("order-1", 0).into())
        .await
        .unwrap();
    let stream = acme
        .read_events(&AggregateId::new("order-1"), SequenceNumber::FIRST)
        .unwrap();

    // Act
    globex
        .append_events(order_event("order-1", 0).into())
        .await
        .unwrap();
    let events: Vec<EventRecord> = stream.try_collect().await.unwrap();

    // Assert
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tenant_id, tenant("acme"));
}

// --- binding lifecycle ---

#[tokio::test]
async fn test_binding_is_cleared_after_failed_operation() {
    let engine = Arc::new(EventStorageEngine::new(Arc::new(
        FailingEventRepository::new(Failure::Backend),
    )));
    let store = TenantEnforcedEventStore::new(engine, provider("acme"));

    let result = store
        .append_events(order_event("order-1", 0).into())
        .await;

    assert!(result.is_err());
    assert_eq!(store.active_bindings(), 0);
}

#[tokio::test]
async fn test_binding_is_cleared_after_conflict() {
    let (_repo, engine) = shared_engine();
    let store = TenantEnforcedEventStore::new(engine, provider("acme"));
    store
        .append_events(order_event("order-1", 0).into())
        .await
        .unwrap();

    let result = store
        .append_events(order_event("order-1", 0).into())
        .await;

    assert!(result.unwrap_err().is_conflict());
    assert_eq!(store.active_bindings(), 0);
}

#[tokio::test]
async fn test_explicit_binding_counts_while_held() {
    let (_repo, engine) = shared_engine();
    let store = TenantEnforcedEventStore::new(engine, provider("acme"));

    let binding = store.bind().unwrap();
    let derived = store.with_provider(provider("globex"));
    let second = derived.bind().unwrap();

    assert_eq!(store.active_bindings(), 2);
    assert_eq!(binding.tenant().unwrap(), &tenant("acme"));
    assert_eq!(second.tenant().unwrap(), &tenant("globex"));
    drop(binding);
    drop(second);
    assert_eq!(store.active_bindings(), 0);
}

// --- concurrency ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_at_same_position_admit_exactly_one() {
    let (_repo, engine) = shared_engine();
    let store = TenantEnforcedEventStore::new(engine, provider("acme"));

    for round in 0..20 {
        // Arrange
        let aggregate = format!("order-{round}");
        let barrier = Arc::new(Barrier::new(2));
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                let aggregate = aggregate.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    store.append_events(order_event(&aggregate, 0).into()).await
                })
            })
            .collect();

        // Act
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        // Assert
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(StorageError::ConcurrencyConflict { .. })))
                .count(),
            1
        );
    }
    assert_eq!(store.active_bindings(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tenants_never_see_each_other() {
    // Arrange
    let (_repo, engine) = shared_engine();
    let root = TenantEnforcedEventStore::new(engine, Arc::new(TenantContext::none()));

    // Act
    let tasks: Vec<_> = (0..50)
        .map(|n| {
            let store = root.with_provider(provider(&format!("tenant-{n}")));
            tokio::spawn(async move {
                for seq in 0..5 {
                    store
                        .append_events(order_event("order-1", seq).into())
                        .await
                        .unwrap();
                }
                let events: Vec<EventRecord> = store
                    .read_events(&AggregateId::new("order-1"), SequenceNumber::FIRST)
                    .unwrap()
                    .try_collect()
                    .await
                    .unwrap();
                (n, events)
            })
        })
        .collect();

    // Assert
    for task in tasks {
        let (n, events) = task.await.unwrap();
        let expected = tenant(&format!("tenant-{n}"));
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.tenant_id == expected));
    }
    assert_eq!(root.active_bindings(), 0);
}
