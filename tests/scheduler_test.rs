mod common;

use std::sync::Arc;

use budgetkv::{
    request::pending::RequestState, EventError, FixedBudget, InMemoryBackend, KeyValueBackend,
    Operation, RequestCategory, RequestQueueManager,
};
use common::record_completions;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{sleep, Duration};

fn backend() -> Arc<dyn KeyValueBackend> {
    Arc::new(InMemoryBackend::new("scheduler-test"))
}

#[tokio::test(start_paused = true)]
async fn test_get_waits_until_budget_is_reported() {
    let budget = Arc::new(FixedBudget::new(10));
    budget.set(RequestCategory::Get, 0);
    let manager = RequestQueueManager::new(budget.clone());
    let seen = record_completions(manager.completions());

    let request_id = manager
        .submit(backend(), Operation::Get { key: "k1".to_string() })
        .await;

    // 予算ゼロの間はキューに残る
    sleep(Duration::from_millis(1600)).await;
    assert!(manager.stats().await.ticks >= 3);
    assert_eq!(manager.queue_len(RequestCategory::Get).await, 1);
    assert_eq!(
        manager.request_state(&request_id).await,
        Some(RequestState::Queued)
    );
    assert!(seen.lock().unwrap().is_empty());

    budget.set(RequestCategory::Get, 1);
    sleep(Duration::from_millis(600)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].request_id, request_id);
    // k1 was never written
    assert!(!seen[0].outcome.success);
    assert_eq!(manager.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_sets_in_one_tick_complete_once_each() {
    let manager = RequestQueueManager::new(Arc::new(FixedBudget::new(5)));
    let seen = record_completions(manager.completions());
    let store = backend();

    let a = manager
        .submit(
            store.clone(),
            Operation::Set {
                key: "a".to_string(),
                value: json!(1),
            },
        )
        .await;
    let b = manager
        .submit(
            store.clone(),
            Operation::Set {
                key: "b".to_string(),
                value: json!(2),
            },
        )
        .await;
    assert_ne!(a, b);

    sleep(Duration::from_millis(600)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for id in [&a, &b] {
        let matching: Vec<_> = seen.iter().filter(|c| &c.request_id == id).collect();
        assert_eq!(matching.len(), 1);
        assert!(matching[0].outcome.success);
    }
    assert_eq!(manager.stats().await.dispatched, 2);
    assert_eq!(manager.stats().await.completed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_loop_goes_idle_and_restarts_on_submit() {
    let manager = RequestQueueManager::new(Arc::new(FixedBudget::new(1)));
    let store = backend();
    assert!(!manager.is_running().await);

    manager
        .submit(store.clone(), Operation::Increment { key: "n".to_string(), delta: 1 })
        .await;
    assert!(manager.is_running().await);

    sleep(Duration::from_millis(1100)).await;
    assert!(!manager.is_running().await);

    let ticks = manager.stats().await.ticks;
    sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.stats().await.ticks, ticks);

    manager
        .submit(store, Operation::Increment { key: "n".to_string(), delta: 1 })
        .await;
    assert!(manager.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_independent_managers_do_not_share_state() {
    let first = RequestQueueManager::new(Arc::new(FixedBudget::new(0)));
    let second = RequestQueueManager::new(Arc::new(FixedBudget::new(1)));
    let store = backend();

    first
        .submit(store.clone(), Operation::Get { key: "x".to_string() })
        .await;
    let id = second
        .submit(store, Operation::Get { key: "x".to_string() })
        .await;

    sleep(Duration::from_millis(600)).await;
    assert_eq!(first.pending_count().await, 1);
    assert_eq!(second.pending_count().await, 0);
    // 採番はマネージャごと
    assert_eq!(id.as_str(), "R_1");
}

#[test]
fn test_destroyed_completion_bus_rejects_fire() {
    let manager = RequestQueueManager::new(Arc::new(FixedBudget::new(1)));
    let bus = manager.completions();
    bus.destroy();

    let result = bus.subscribe(|_| {});
    assert_eq!(result.unwrap_err(), EventError::Destroyed);
    assert!(bus.is_destroyed());
}
