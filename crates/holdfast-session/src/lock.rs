//! Distributed lease lock
//!
//! A lock is a [`LockLease`] entry in a remote TTL map. Acquisition is a
//! conditional write that succeeds only when no live lease exists or the
//! live lease already belongs to the caller. Expiry is enforced by the
//! backend, so a holder keeps exclusivity only by renewing before the TTL
//! runs out; a background task renews at `renew_interval`.
//!
//! If renewals keep failing until the last granted lease would have expired,
//! the handle turns [`LockStatus::Lost`] and stays that way: another process
//! may hold the lease by then, and everything guarded by the handle must fail
//! fast instead of retrying. A second task sleeps until the current deadline
//! so the transition happens when the lease expires, not at the next renewal
//! tick.
//!
//! Acquiring a lease the same owner already holds through this lock returns a
//! handle sharing the existing state. The lease is deleted only when the last
//! of those handles is released.

use crate::tasks::{BackgroundTask, Tick};
use holdfast_core::effects::{
    Conditional, ConditionalOutcome, LeaseMapEffects, PhysicalTimeEffects, RetryError,
    RetryPolicy, StoreError,
};
use holdfast_core::{HoldfastError, LockConfig, LockLease, OwnerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Errors raised by lock operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LockError {
    /// A live lease is held by another owner
    #[error("lease {key} is held by another owner")]
    Busy {
        /// Lease key
        key: String,
    },

    /// The lease is no longer ours
    #[error("lease {key} was lost")]
    Lost {
        /// Lease key
        key: String,
    },

    /// The lease map failed
    #[error("lease store failure on {key}: {source}")]
    Store {
        /// Lease key
        key: String,
        /// Failure after retries
        source: RetryError<StoreError>,
    },
}

impl LockError {
    /// Convert into the session-facing error for the record `record_key`
    pub fn into_session_error(self, record_key: &str) -> HoldfastError {
        match self {
            LockError::Busy { .. } => HoldfastError::busy(record_key),
            LockError::Lost { .. } => HoldfastError::closed(record_key),
            LockError::Store { source, .. } => source.into(),
        }
    }
}

/// Current state of a lock handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The lease is ours and has not expired
    Held,
    /// The lease expired or was taken over; terminal
    Lost,
    /// Given up by the holder; terminal
    Released,
}

struct HandleState {
    key: String,
    owner: OwnerId,
    ttl: Duration,
    expires_at_ms: AtomicU64,
    status: watch::Sender<LockStatus>,
    renewal: Mutex<Option<BackgroundTask>>,
    expiry: Mutex<Option<BackgroundTask>>,
}

impl HandleState {
    fn mark_lost(&self) {
        let changed = self.status.send_if_modified(|status| {
            if *status == LockStatus::Held {
                *status = LockStatus::Lost;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::error!(key = %self.key, owner = %self.owner, "Lease lost");
            self.signal_tasks();
        }
    }

    fn signal_tasks(&self) {
        for slot in [&self.renewal, &self.expiry] {
            if let Some(task) = slot.lock().as_ref() {
                task.signal();
            }
        }
    }

    async fn stop_tasks(&self) {
        let renewal = self.renewal.lock().take();
        let expiry = self.expiry.lock().take();
        for task in renewal.into_iter().chain(expiry) {
            task.stop().await;
        }
    }
}

/// Handles currently held through one [`DistributedLock`], by lease key
#[derive(Default)]
struct HeldLeases {
    entries: HashMap<String, HeldLease>,
}

struct HeldLease {
    state: Weak<HandleState>,
    holds: usize,
}

impl HeldLeases {
    /// Live held state for `key` owned by `owner`, counting one more hold
    fn join(&mut self, key: &str, owner: &OwnerId) -> Option<Arc<HandleState>> {
        let entry = self.entries.get_mut(key)?;
        let state = entry.state.upgrade()?;
        if &state.owner != owner || *state.status.borrow() != LockStatus::Held {
            return None;
        }
        entry.holds += 1;
        Some(state)
    }

    fn insert(&mut self, state: &Arc<HandleState>) {
        self.entries.insert(
            state.key.clone(),
            HeldLease {
                state: Arc::downgrade(state),
                holds: 1,
            },
        );
    }

    /// Drop one hold on `state`; true when no other handle still holds it
    fn leave(&mut self, state: &Arc<HandleState>) -> bool {
        let Some(entry) = self.entries.get_mut(&state.key) else {
            return true;
        };
        if !std::ptr::eq(entry.state.as_ptr(), Arc::as_ptr(state)) {
            return true;
        }
        entry.holds = entry.holds.saturating_sub(1);
        if entry.holds > 0 && *state.status.borrow() == LockStatus::Held {
            return false;
        }
        self.entries.remove(&state.key);
        true
    }
}

/// Handle to an acquired lease
#[derive(Clone)]
pub struct LockHandle {
    state: Arc<HandleState>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.state.key)
            .field("owner", &self.state.owner)
            .field("status", &self.status())
            .finish()
    }
}

impl LockHandle {
    /// Lease key
    pub fn key(&self) -> &str {
        &self.state.key
    }

    /// Owner the lease was granted to
    pub fn owner(&self) -> &OwnerId {
        &self.state.owner
    }

    /// Current status
    pub fn status(&self) -> LockStatus {
        *self.state.status.borrow()
    }

    /// True while the lease is held and unexpired.
    ///
    /// The expiry task turns the handle `Lost` at the deadline of the last
    /// granted lease, so this never outlives the lease itself.
    pub fn is_locked(&self) -> bool {
        self.status() == LockStatus::Held
    }

    /// Deadline of the last lease granted to us
    pub fn expires_at_ms(&self) -> u64 {
        self.state.expires_at_ms.load(Ordering::SeqCst)
    }

    /// Watch status transitions
    pub fn subscribe(&self) -> watch::Receiver<LockStatus> {
        self.state.status.subscribe()
    }
}

/// Lease lock over a TTL map
///
/// Clones share the record of held handles, so re-entry is tracked across
/// them.
#[derive(Clone)]
pub struct DistributedLock {
    leases: Arc<dyn LeaseMapEffects>,
    time: Arc<dyn PhysicalTimeEffects>,
    retry: RetryPolicy,
    config: LockConfig,
    held: Arc<Mutex<HeldLeases>>,
}

impl DistributedLock {
    /// Lock over `leases`, renewing on `time` as `config` says
    pub fn new(
        leases: Arc<dyn LeaseMapEffects>,
        time: Arc<dyn PhysicalTimeEffects>,
        retry: RetryPolicy,
        config: LockConfig,
    ) -> Self {
        Self {
            leases,
            time,
            retry,
            config,
            held: Arc::default(),
        }
    }

    /// Lease timings
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Try once to acquire `key` for `owner`.
    ///
    /// Re-acquiring a lease we already own succeeds and refreshes its expiry.
    /// The returned handle shares state with the handles already held, and
    /// each of them must be released before the lease is deleted.
    pub async fn acquire(
        &self,
        key: &str,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        let now = self.time.now_ms().await;
        let expires_at_ms = now.saturating_add(duration_ms(ttl));
        let payload = encode_lease(owner, expires_at_ms);

        let decide = |current: Option<&[u8]>| match current.map(decode_lease) {
            None => Conditional::Put(payload.clone()),
            Some(Some(lease)) if &lease.owner == owner => Conditional::Put(payload.clone()),
            // Unreadable or foreign lease: wait for the backend to expire it
            Some(_) => Conditional::Abort,
        };

        let outcome = self
            .retry
            .execute(|| self.leases.update_conditional(key, ttl, &decide))
            .await
            .map_err(|source| LockError::Store {
                key: key.to_string(),
                source,
            })?;

        match outcome {
            ConditionalOutcome::Written(_) => {
                let joined = self.held.lock().join(key, owner);
                if let Some(state) = joined {
                    state.expires_at_ms.fetch_max(expires_at_ms, Ordering::SeqCst);
                    tracing::debug!(key, owner = %owner, "Lease re-entered");
                    return Ok(LockHandle { state });
                }
                tracing::info!(key, owner = %owner, "Lease acquired");
                Ok(self.start_handle(key, owner, ttl, expires_at_ms))
            }
            ConditionalOutcome::Aborted | ConditionalOutcome::Removed => {
                tracing::debug!(key, owner = %owner, "Lease busy");
                Err(LockError::Busy {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Acquire, polling while the lease is busy for up to `wait`
    pub async fn acquire_with_wait(
        &self,
        key: &str,
        owner: &OwnerId,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockHandle, LockError> {
        let deadline = self.time.now_ms().await.saturating_add(duration_ms(wait));
        loop {
            match self.acquire(key, owner, ttl).await {
                Err(LockError::Busy { .. }) => {
                    let now = self.time.now_ms().await;
                    if now.saturating_add(duration_ms(self.config.acquire_poll)) > deadline {
                        return Err(LockError::Busy {
                            key: key.to_string(),
                        });
                    }
                    self.time.sleep(self.config.acquire_poll).await;
                }
                other => return other,
            }
        }
    }

    /// Extend the lease by its TTL.
    ///
    /// Fails with `Lost` if the handle is no longer held or the live lease
    /// belongs to someone else (or has already expired).
    pub async fn renew(&self, handle: &LockHandle) -> Result<(), LockError> {
        let state = &handle.state;
        if !handle.is_locked() {
            return Err(LockError::Lost {
                key: state.key.clone(),
            });
        }

        let now = self.time.now_ms().await;
        let remaining = handle.expires_at_ms().saturating_sub(now);
        if remaining == 0 {
            state.mark_lost();
            return Err(LockError::Lost {
                key: state.key.clone(),
            });
        }

        let expires_at_ms = now.saturating_add(duration_ms(state.ttl));
        let payload = encode_lease(&state.owner, expires_at_ms);
        let decide = |current: Option<&[u8]>| match current.and_then(decode_lease) {
            Some(lease) if lease.owner == state.owner => Conditional::Put(payload.clone()),
            _ => Conditional::Abort,
        };

        // Never keep retrying past the point where the lease has expired anyway
        let budget = Duration::from_millis(remaining).min(self.retry.max_elapsed);
        let outcome = self
            .retry
            .clone()
            .with_max_elapsed(budget)
            .execute(|| self.leases.update_conditional(&state.key, state.ttl, &decide))
            .await
            .map_err(|source| LockError::Store {
                key: state.key.clone(),
                source,
            })?;

        match outcome {
            ConditionalOutcome::Written(_) => {
                state.expires_at_ms.store(expires_at_ms, Ordering::SeqCst);
                tracing::debug!(key = %state.key, expires_at_ms, "Lease renewed");
                Ok(())
            }
            ConditionalOutcome::Aborted | ConditionalOutcome::Removed => {
                state.mark_lost();
                Err(LockError::Lost {
                    key: state.key.clone(),
                })
            }
        }
    }

    /// Check the handle against the clock, declaring it lost once the last
    /// granted lease has expired
    pub async fn ensure_held(&self, handle: &LockHandle) -> Result<(), LockError> {
        if handle.is_locked() && self.time.now_ms().await < handle.expires_at_ms() {
            return Ok(());
        }
        handle.state.mark_lost();
        Err(LockError::Lost {
            key: handle.key().to_string(),
        })
    }

    /// Stop renewing and delete the lease if it is still ours.
    ///
    /// Releasing one of several re-entrant handles only drops its hold. A
    /// failed delete is returned to the caller; the lease then simply
    /// expires through its TTL.
    pub async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let state = &handle.state;
        if !self.held.lock().leave(state) {
            tracing::debug!(
                key = %state.key,
                owner = %state.owner,
                "Lease still held by another handle"
            );
            return Ok(());
        }
        state.stop_tasks().await;

        let was_held = state.status.send_if_modified(|status| {
            let held = *status == LockStatus::Held;
            *status = LockStatus::Released;
            held
        });
        if !was_held {
            return Ok(());
        }

        let decide = |current: Option<&[u8]>| match current.and_then(decode_lease) {
            Some(lease) if lease.owner == state.owner => Conditional::Remove,
            _ => Conditional::Abort,
        };
        self.retry
            .execute(|| self.leases.update_conditional(&state.key, state.ttl, &decide))
            .await
            .map_err(|source| LockError::Store {
                key: state.key.clone(),
                source,
            })?;

        tracing::info!(key = %state.key, owner = %state.owner, "Lease released");
        Ok(())
    }

    /// Same as [`LockHandle::is_locked`]
    pub fn is_locked(&self, handle: &LockHandle) -> bool {
        handle.is_locked()
    }

    fn start_handle(
        &self,
        key: &str,
        owner: &OwnerId,
        ttl: Duration,
        expires_at_ms: u64,
    ) -> LockHandle {
        let (status, _) = watch::channel(LockStatus::Held);
        let state = Arc::new(HandleState {
            key: key.to_string(),
            owner: owner.clone(),
            ttl,
            expires_at_ms: AtomicU64::new(expires_at_ms),
            status,
            renewal: Mutex::new(None),
            expiry: Mutex::new(None),
        });
        self.held.lock().insert(&state);

        let weak: Weak<HandleState> = Arc::downgrade(&state);
        let expiry = BackgroundTask::spawn_cancellable(watch_expiry(
            self.time.clone(),
            weak.clone(),
        ));
        *state.expiry.lock() = Some(expiry);

        let lock = self.clone();
        let renewal = BackgroundTask::spawn_interval(
            self.time.clone(),
            self.config.renew_interval,
            move || {
                let weak = weak.clone();
                let lock = lock.clone();
                async move {
                    let Some(state) = weak.upgrade() else {
                        return Tick::Stop;
                    };
                    lock.renew_tick(LockHandle { state }).await
                }
            },
        );
        *state.renewal.lock() = Some(renewal);

        LockHandle { state }
    }

    async fn renew_tick(&self, handle: LockHandle) -> Tick {
        match self.renew(&handle).await {
            Ok(()) => Tick::Continue,
            Err(LockError::Lost { .. }) | Err(LockError::Busy { .. }) => Tick::Stop,
            Err(err) => {
                let now = self.time.now_ms().await;
                if now >= handle.expires_at_ms() {
                    handle.state.mark_lost();
                    return Tick::Stop;
                }
                tracing::warn!(
                    key = %handle.key(),
                    error = %err,
                    remaining_ms = handle.expires_at_ms() - now,
                    "Lease renewal failed; will retry"
                );
                Tick::Continue
            }
        }
    }
}

/// Sleep until the current lease deadline, re-reading it after renewals,
/// and declare the handle lost once it passes
async fn watch_expiry(time: Arc<dyn PhysicalTimeEffects>, weak: Weak<HandleState>) {
    loop {
        let now = time.now_ms().await;
        let deadline = {
            let Some(state) = weak.upgrade() else {
                return;
            };
            if *state.status.borrow() != LockStatus::Held {
                return;
            }
            let deadline = state.expires_at_ms.load(Ordering::SeqCst);
            if now >= deadline {
                state.mark_lost();
                return;
            }
            deadline
        };
        time.sleep(Duration::from_millis(deadline - now)).await;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

fn encode_lease(owner: &OwnerId, expires_at_ms: u64) -> Vec<u8> {
    let lease = LockLease {
        owner: owner.clone(),
        expires_at_ms,
    };
    // Serializing a struct of a string and an integer cannot fail
    serde_json::to_vec(&lease).unwrap_or_default()
}

fn decode_lease(bytes: &[u8]) -> Option<LockLease> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_effects::{MemoryLeaseMap, RealTimeHandler};

    fn lock() -> (DistributedLock, MemoryLeaseMap) {
        let time: Arc<dyn PhysicalTimeEffects> = Arc::new(RealTimeHandler::new());
        let leases = MemoryLeaseMap::new(time.clone());
        let lock = DistributedLock::new(
            Arc::new(leases.clone()),
            time,
            RetryPolicy::none(),
            LockConfig::default(),
        );
        (lock, leases)
    }

    #[tokio::test]
    async fn second_owner_is_busy_until_release() {
        let (lock, _) = lock();
        let ttl = Duration::from_secs(60);
        let a = lock.acquire("k", &"a".into(), ttl).await.unwrap();

        let err = lock.acquire("k", &"b".into(), ttl).await.unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));

        lock.release(&a).await.unwrap();
        assert_eq!(a.status(), LockStatus::Released);
        let b = lock.acquire("k", &"b".into(), ttl).await.unwrap();
        assert!(b.is_locked());
        lock.release(&b).await.unwrap();
    }

    #[tokio::test]
    async fn same_owner_reenters() {
        let (lock, leases) = lock();
        let ttl = Duration::from_secs(60);
        let owner: OwnerId = "a".into();
        let first = lock.acquire("k", &owner, ttl).await.unwrap();
        let second = lock.acquire("k", &owner, ttl).await.unwrap();
        assert!(first.is_locked() && second.is_locked());

        // The first handle keeps the lease alive after the second lets go
        lock.release(&second).await.unwrap();
        assert!(first.is_locked());
        assert!(leases.get("k").await.unwrap().is_some());
        let err = lock.acquire("k", &"b".into(), ttl).await.unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));

        lock.release(&first).await.unwrap();
        assert_eq!(first.status(), LockStatus::Released);
        assert_eq!(leases.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reentry_after_release_starts_a_fresh_handle() {
        let (lock, _) = lock();
        let ttl = Duration::from_secs(60);
        let owner: OwnerId = "a".into();
        let first = lock.acquire("k", &owner, ttl).await.unwrap();
        lock.release(&first).await.unwrap();

        let second = lock.acquire("k", &owner, ttl).await.unwrap();
        assert!(second.is_locked());
        assert_eq!(first.status(), LockStatus::Released);
        lock.release(&second).await.unwrap();
    }

    #[tokio::test]
    async fn lock_errors_map_to_session_errors() {
        let (lock, _) = lock();
        let ttl = Duration::from_secs(60);
        let _a = lock.acquire("k", &"a".into(), ttl).await.unwrap();
        let err = lock.acquire("k", &"b".into(), ttl).await.unwrap_err();
        assert_eq!(err.into_session_error("u1"), HoldfastError::busy("u1"));

        let lost = LockError::Lost { key: "k".into() };
        assert_eq!(lost.into_session_error("u1"), HoldfastError::closed("u1"));
    }

    #[tokio::test]
    async fn renew_detects_foreign_lease() {
        let (lock, leases) = lock();
        let ttl = Duration::from_secs(60);
        let handle = lock.acquire("k", &"a".into(), ttl).await.unwrap();

        leases
            .set("k", encode_lease(&"intruder".into(), u64::MAX), ttl)
            .await
            .unwrap();

        let err = lock.renew(&handle).await.unwrap_err();
        assert!(matches!(err, LockError::Lost { .. }));
        assert_eq!(handle.status(), LockStatus::Lost);
    }

    #[tokio::test]
    async fn release_leaves_foreign_lease_alone() {
        let (lock, leases) = lock();
        let ttl = Duration::from_secs(60);
        let handle = lock.acquire("k", &"a".into(), ttl).await.unwrap();
        leases
            .set("k", encode_lease(&"other".into(), u64::MAX), ttl)
            .await
            .unwrap();

        lock.release(&handle).await.unwrap();
        let current = leases.get("k").await.unwrap().and_then(|b| decode_lease(&b));
        assert_eq!(current.map(|l| l.owner), Some("other".into()));
    }
}
