//! Overhead and boundedness checks for tenant enforcement and paged reads.
//!
//! Timings use the in-memory repository so that they measure the engine and
//! enforcement layers, not a database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use tessera_core::{
    EngineConfig, EventBatch, EventStorageEngine, TenantContext, TenantEnforcedEventStore,
    TrackingToken,
};
use tessera_test_support::{InMemoryEventRepository, SpyEventRepository, order_event, tenant};

const ENFORCEMENT_BUDGET: Duration = Duration::from_millis(1);

fn acme_store() -> TenantEnforcedEventStore<EventStorageEngine<InMemoryEventRepository>> {
    let engine = EventStorageEngine::new(Arc::new(InMemoryEventRepository::new()));
    TenantEnforcedEventStore::new(
        Arc::new(engine),
        Arc::new(TenantContext::for_tenant(tenant("acme"))),
    )
}

#[test]
fn test_binding_overhead_is_within_budget() {
    // Arrange
    let store = acme_store();
    let iterations: u32 = 10_000;

    // Act
    let started = Instant::now();
    for _ in 0..iterations {
        let token = store.create_tail_token().unwrap();
        assert!(token.is_tail());
    }
    let average = started.elapsed() / iterations;

    // Assert
    assert!(
        average < ENFORCEMENT_BUDGET,
        "average enforcement overhead {average:?} exceeds {ENFORCEMENT_BUDGET:?}"
    );
    assert_eq!(store.active_bindings(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_binding_overhead_under_concurrency_stays_bounded() {
    // Arrange
    let store = acme_store();
    let tasks: u32 = 100;
    let iterations: u32 = 200;

    // Act
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                for _ in 0..iterations {
                    store.create_head_token().await.unwrap();
                }
                started.elapsed() / iterations
            })
        })
        .collect();
    let mut total = Duration::ZERO;
    for handle in handles {
        total += handle.await.unwrap();
    }
    let average = total / tasks;

    // Assert
    assert!(
        average < ENFORCEMENT_BUDGET * 5,
        "average per-call latency {average:?} under concurrency exceeds {:?}",
        ENFORCEMENT_BUDGET * 5
    );
    assert_eq!(store.active_bindings(), 0);
}

#[tokio::test]
async fn test_long_tracking_read_fetches_bounded_pages() {
    // Arrange
    let spy = Arc::new(SpyEventRepository::new(InMemoryEventRepository::new()));
    let engine = EventStorageEngine::new(Arc::clone(&spy))
        .with_config(EngineConfig::default().with_page_size(100));
    let store = TenantEnforcedEventStore::new(
        Arc::new(engine),
        Arc::new(TenantContext::for_tenant(tenant("acme"))),
    );
    for chunk in 0..50_u64 {
        let events = (0..100).map(|n| order_event("order-1", chunk * 100 + n)).collect();
        store
            .append_events(EventBatch::new(events).unwrap())
            .await
            .unwrap();
    }

    // Act
    let mut stream = store
        .read_tracked_events(TrackingToken::tail(), true)
        .unwrap();
    let mut seen = 0_usize;
    let mut last = TrackingToken::tail();
    while let Some(tracked) = stream.try_next().await.unwrap() {
        assert!(tracked.token > last);
        last = tracked.token;
        seen += 1;
    }

    // Assert
    assert_eq!(seen, 5_000);
    let page_reads = spy
        .calls()
        .into_iter()
        .filter(|call| *call == "read_tracked")
        .count();
    assert_eq!(page_reads, 51);
}
