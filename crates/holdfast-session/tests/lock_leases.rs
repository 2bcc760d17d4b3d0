//! Lease lock behavior against the in-memory TTL map on virtual time

use assert_matches::assert_matches;
use futures::future::join_all;
use holdfast_core::{LockConfig, OwnerId, RetryPolicy};
use holdfast_session::{DistributedLock, LockError, LockStatus};
use holdfast_testkit::{init_tracing, FaultKind, FaultRule, StoreOp, TestStores};
use std::time::Duration;

const TTL: Duration = Duration::from_secs(9);

fn lock_over(stores: &TestStores, config: LockConfig) -> DistributedLock {
    let handles = stores.handles();
    DistributedLock::new(handles.leases, handles.time, RetryPolicy::none(), config)
}

fn test_lock(stores: &TestStores) -> DistributedLock {
    lock_over(
        stores,
        LockConfig {
            ttl: TTL,
            renew_interval: Duration::from_secs(3),
            acquire_wait: Duration::from_secs(2),
            acquire_poll: Duration::from_millis(200),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_have_one_winner() {
    init_tracing();
    let stores = TestStores::new();
    let lock = test_lock(&stores);

    let owners: Vec<OwnerId> = (0..8).map(|i| OwnerId(format!("owner-{i}"))).collect();
    let attempts = owners.iter().map(|owner| lock.acquire("players/locks/u1", owner, TTL));
    let results = join_all(attempts).await;

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert_matches!(err, LockError::Busy { .. });
        }
    }
}

#[tokio::test(start_paused = true)]
async fn released_lease_is_immediately_reacquirable() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";

    let a = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    lock.release(&a).await.unwrap();
    assert_eq!(a.status(), LockStatus::Released);
    assert!(!lock.is_locked(&a));

    let b = lock.acquire(key, &"b".into(), TTL).await.unwrap();
    assert!(b.is_locked());
}

#[tokio::test(start_paused = true)]
async fn expired_lease_is_reacquirable() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";

    let a = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    // Dropping the only handle stops renewal, as a crashed process would
    drop(a);

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_matches!(
        lock.acquire(key, &"b".into(), TTL).await,
        Err(LockError::Busy { .. })
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    let b = lock.acquire(key, &"b".into(), TTL).await.unwrap();
    assert!(b.is_locked());
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_the_lease_alive() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";

    let a = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(a.is_locked());
    assert_matches!(
        lock.acquire(key, &"b".into(), TTL).await,
        Err(LockError::Busy { .. })
    );
    lock.release(&a).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_renewals_lose_the_lock_once_the_ttl_lapses() {
    init_tracing();
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let a = lock
        .acquire("players/locks/u1", &"a".into(), TTL)
        .await
        .unwrap();
    let mut status = a.subscribe();

    stores
        .lease_faults
        .add(FaultRule::new(FaultKind::Throttle).op(StoreOp::UpdateConditional));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(a.is_locked(), "still inside the TTL");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!a.is_locked());
    assert_eq!(*status.borrow_and_update(), LockStatus::Lost);
    assert_matches!(lock.renew(&a).await, Err(LockError::Lost { .. }));
    assert_matches!(lock.ensure_held(&a).await, Err(LockError::Lost { .. }));
}

#[tokio::test(start_paused = true)]
async fn acquire_with_wait_picks_up_a_released_lease() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";

    let a = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    let holder = lock.clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        holder.release(&a).await.unwrap();
    });

    let b = lock
        .acquire_with_wait(key, &"b".into(), TTL, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(b.is_locked());
    releaser.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn acquire_with_wait_gives_up_when_the_holder_stays() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";

    let _a = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    let started = tokio::time::Instant::now();
    assert_matches!(
        lock.acquire_with_wait(key, &"b".into(), TTL, Duration::from_secs(2))
            .await,
        Err(LockError::Busy { .. })
    );
    assert!(started.elapsed() <= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn fatal_lease_errors_are_not_busy() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    stores.lease_faults.add(FaultRule::new(FaultKind::Fatal));

    let err = lock
        .acquire("players/locks/u1", &"a".into(), TTL)
        .await
        .unwrap_err();
    assert_matches!(err, LockError::Store { .. });
}

#[tokio::test(start_paused = true)]
async fn reentrant_handles_share_the_lease() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";

    let first = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    let second = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    lock.release(&second).await.unwrap();

    assert!(first.is_locked());
    assert!(stores.leases.expires_at_ms(key).await.is_some());
    assert_matches!(
        lock.acquire(key, &"b".into(), TTL).await,
        Err(LockError::Busy { .. })
    );

    // The shared handle keeps renewing past the original TTL
    tokio::time::sleep(TTL * 2).await;
    assert!(first.is_locked());

    lock.release(&first).await.unwrap();
    assert_eq!(stores.leases.expires_at_ms(key).await, None);
    let b = lock.acquire(key, &"b".into(), TTL).await.unwrap();
    assert!(b.is_locked());
}

#[tokio::test(start_paused = true)]
async fn lock_is_lost_as_soon_as_the_lease_expires() {
    let stores = TestStores::new();
    let lock = test_lock(&stores);
    let key = "players/locks/u1";
    let a = lock.acquire(key, &"a".into(), TTL).await.unwrap();
    let granted_until = stores.leases.expires_at_ms(key).await.unwrap();
    assert_eq!(a.expires_at_ms(), granted_until);

    stores
        .lease_faults
        .add(FaultRule::new(FaultKind::Throttle).op(StoreOp::UpdateConditional));
    tokio::time::sleep(TTL + Duration::from_millis(200)).await;

    assert_eq!(stores.leases.expires_at_ms(key).await, None);
    assert!(!a.is_locked());
    assert_eq!(a.status(), LockStatus::Lost);

    stores.lease_faults.heal();
    let b = lock.acquire(key, &"b".into(), TTL).await.unwrap();
    assert!(b.is_locked());
    assert!(!a.is_locked());
}
