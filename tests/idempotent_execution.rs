use reliable_exec::idempotency::{IdempotencyStatus, SqliteIdempotencyStore};
use reliable_exec::{
    IdempotencyConfig, IdempotencyCoordinator, IdempotencyError, IdempotencyKey, IdempotencyStore,
    IdempotentOutcome, InMemoryIdempotencyStore, ManualClock, UnixTimeMs,
};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
struct Order {
    id: String,
}

/// Places an order whose action blocks until the losing caller has returned.
async fn place_order<S: IdempotencyStore>(
    coordinator: &IdempotencyCoordinator<S>,
    key: &IdempotencyKey,
    executions: &AtomicUsize,
    release: &Notify,
) -> Result<IdempotentOutcome<Order>, IdempotencyError<Infallible>> {
    let outcome = coordinator
        .execute(
            key,
            Some(Duration::from_secs(120)),
            || async {
                executions.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<_, Infallible>(Order { id: "ord-1".into() })
            },
            |order| order.id.clone(),
        )
        .await;
    if matches!(outcome, Ok(ref o) if !o.executed()) {
        release.notify_one();
    }
    outcome
}

async fn concurrent_callers_execute_once<S: IdempotencyStore>(store: Arc<S>) {
    let coordinator = IdempotencyCoordinator::new(store, IdempotencyConfig::default()).unwrap();
    let key = IdempotencyKey::new("order:123").unwrap();
    let executions = AtomicUsize::new(0);
    let release = Notify::new();

    // 1. Two callers race on the same key
    let (a, b) = tokio::join!(
        place_order(&coordinator, &key, &executions, &release),
        place_order(&coordinator, &key, &executions, &release),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let (winner, loser) = if a.executed() { (a, b) } else { (b, a) };
    assert_eq!(winner.value(), Some(&Order { id: "ord-1".into() }));
    assert!(!loser.executed());
    assert_eq!(loser.existing_result_ref(), None);
    assert_eq!(loser, IdempotentOutcome::InProgress);

    // 2. A later caller gets the stored reference without running anything
    let replay = coordinator
        .execute(
            &key,
            None,
            || async { Ok::<Order, Infallible>(unreachable!("completed key re-executed")) },
            |order| order.id.clone(),
        )
        .await
        .unwrap();
    assert!(!replay.executed());
    assert_eq!(replay.existing_result_ref(), Some("ord-1"));

    let record = coordinator.store().find(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

#[tokio::test]
async fn concurrent_callers_in_memory() {
    concurrent_callers_execute_once(Arc::new(InMemoryIdempotencyStore::new())).await;
}

#[tokio::test]
async fn concurrent_callers_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteIdempotencyStore::open(dir.path().join("idempotency.db")).unwrap();
    concurrent_callers_execute_once(Arc::new(store)).await;
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("payment declined: {0}")]
struct Declined(String);

#[tokio::test]
async fn failed_action_owns_key_until_expiry() {
    let clock = Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)));
    let coordinator = IdempotencyCoordinator::with_clock(
        Arc::new(InMemoryIdempotencyStore::new()),
        IdempotencyConfig::default(),
        clock.clone(),
    )
    .unwrap();
    let key = IdempotencyKey::new("charge:42").unwrap();
    let ttl = Some(Duration::from_secs(60));

    // 1. The action error comes back verbatim and is recorded
    let err = coordinator
        .execute(
            &key,
            ttl,
            || async { Err::<u32, _>(Declined("insufficient funds".into())) },
            u32::to_string,
        )
        .await
        .unwrap_err();
    assert_eq!(err.into_action_error(), Some(Declined("insufficient funds".into())));

    let record = coordinator.store().find(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(
        record.last_error.as_deref(),
        Some("payment declined: insufficient funds")
    );

    // 2. Before expiry the key is still owned
    let strict = coordinator
        .execute_strict(&key, ttl, || async { Ok::<_, Declined>(7u32) }, u32::to_string)
        .await;
    assert!(matches!(strict, Err(IdempotencyError::AcquisitionConflict { .. })));

    // 3. After expiry a new caller may try again
    clock.advance(Duration::from_secs(61));
    let outcome = coordinator
        .execute(&key, ttl, || async { Ok::<_, Declined>(7u32) }, u32::to_string)
        .await
        .unwrap();
    assert_eq!(outcome, IdempotentOutcome::Executed(7));
    assert_eq!(coordinator.metrics().action_failures, 1);
}
