//! Fault injection for store handlers
//!
//! [`FaultyRecordStore`] and [`FaultyLeaseMap`] wrap a real handler and
//! consult a shared [`FaultInjector`] before every call. Rules match on the
//! operation and a key fragment, can let the first few matching calls through,
//! and fail either a fixed number of times or forever. Every call is counted
//! whether it failed or not.

use async_trait::async_trait;
use holdfast_core::effects::{
    ConditionalFn, ConditionalOutcome, LeaseMapEffects, RecordStoreEffects, StoreError, Version,
    Versioned,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Store operation a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// Point read
    Get,
    /// Unconditional write
    Set,
    /// Read-decide-write on the lease map
    UpdateConditional,
    /// Delete
    Remove,
}

/// Failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable throttling; the call is not applied
    Throttle,
    /// Retryable timeout; the call is not applied
    Timeout,
    /// Retryable timeout reported after the call was applied
    TimeoutAfterApply,
    /// Non-retryable backend failure; the call is not applied
    Fatal,
}

impl FaultKind {
    fn error(self, key: &str) -> StoreError {
        match self {
            FaultKind::Throttle => StoreError::throttled(key),
            FaultKind::Timeout | FaultKind::TimeoutAfterApply => StoreError::timeout(key),
            FaultKind::Fatal => StoreError::backend(format!("injected failure on {key}")),
        }
    }
}

/// One injection rule
#[derive(Debug, Clone)]
pub struct FaultRule {
    kind: FaultKind,
    op: Option<StoreOp>,
    key_fragment: Option<String>,
    skip: u32,
    remaining: Option<u32>,
}

impl FaultRule {
    /// Fail every call with `kind` until narrowed
    pub fn new(kind: FaultKind) -> Self {
        Self {
            kind,
            op: None,
            key_fragment: None,
            skip: 0,
            remaining: None,
        }
    }

    /// Only match calls of `op`
    pub fn op(mut self, op: StoreOp) -> Self {
        self.op = Some(op);
        self
    }

    /// Only match keys containing `fragment`
    pub fn key_contains(mut self, fragment: impl Into<String>) -> Self {
        self.key_fragment = Some(fragment.into());
        self
    }

    /// Let the first `n` matching calls through
    pub fn skip(mut self, n: u32) -> Self {
        self.skip = n;
        self
    }

    /// Fail `n` matching calls, then stop matching
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: StoreOp, key: &str) -> bool {
        self.op.map_or(true, |o| o == op)
            && self.key_fragment.as_deref().map_or(true, |f| key.contains(f))
            && self.remaining != Some(0)
    }
}

#[derive(Debug, Default)]
struct InjectorState {
    rules: Vec<FaultRule>,
    calls: HashMap<StoreOp, u32>,
    injected: u32,
}

/// Shared fault configuration and call counters
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    state: Arc<Mutex<InjectorState>>,
}

impl FaultInjector {
    /// Injector with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `rule` after the existing ones
    pub fn add(&self, rule: FaultRule) {
        self.state.lock().rules.push(rule);
    }

    /// Fail the next `n` calls of `op` with a retryable throttle
    pub fn throttle_next(&self, op: StoreOp, n: u32) {
        self.add(FaultRule::new(FaultKind::Throttle).op(op).times(n));
    }

    /// Remove every rule
    pub fn heal(&self) {
        self.state.lock().rules.clear();
    }

    /// Calls seen for `op`, including failed ones
    pub fn calls(&self, op: StoreOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Failures injected so far
    pub fn injected(&self) -> u32 {
        self.state.lock().injected
    }

    /// Zero the call and injection counters
    pub fn reset_counts(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.injected = 0;
    }

    /// Record a call and decide whether it fails
    fn check(&self, op: StoreOp, key: &str) -> Option<FaultKind> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;

        let rule = state.rules.iter_mut().find(|rule| rule.matches(op, key))?;
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        let kind = rule.kind;
        state.injected += 1;
        tracing::debug!(?op, key, ?kind, "Injecting store fault");
        Some(kind)
    }
}

/// Run `call` unless a fault fires first
async fn guarded<T, Fut>(
    faults: &FaultInjector,
    op: StoreOp,
    key: &str,
    call: impl FnOnce() -> Fut,
) -> Result<T, StoreError>
where
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match faults.check(op, key) {
        None => call().await,
        Some(FaultKind::TimeoutAfterApply) => {
            call().await?;
            Err(FaultKind::TimeoutAfterApply.error(key))
        }
        Some(kind) => Err(kind.error(key)),
    }
}

/// Record store wrapper with injected failures
#[derive(Clone)]
pub struct FaultyRecordStore<S> {
    inner: S,
    faults: FaultInjector,
}

impl<S> FaultyRecordStore<S> {
    /// Wrap `inner` behind `faults`
    pub fn new(inner: S, faults: FaultInjector) -> Self {
        Self { inner, faults }
    }

    /// Wrapped handler
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RecordStoreEffects> RecordStoreEffects for FaultyRecordStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        guarded(&self.faults, StoreOp::Get, key, || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<Version, StoreError> {
        guarded(&self.faults, StoreOp::Set, key, || self.inner.set(key, value)).await
    }

    async fn update_conditional(
        &self,
        key: &str,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError> {
        guarded(&self.faults, StoreOp::UpdateConditional, key, || {
            self.inner.update_conditional(key, update)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        guarded(&self.faults, StoreOp::Remove, key, || self.inner.remove(key)).await
    }
}

/// Lease map wrapper with injected failures
#[derive(Clone)]
pub struct FaultyLeaseMap<S> {
    inner: S,
    faults: FaultInjector,
}

impl<S> FaultyLeaseMap<S> {
    /// Wrap `inner` behind `faults`
    pub fn new(inner: S, faults: FaultInjector) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl<S: LeaseMapEffects> LeaseMapEffects for FaultyLeaseMap<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        guarded(&self.faults, StoreOp::Get, key, || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        guarded(&self.faults, StoreOp::Set, key, || self.inner.set(key, value, ttl)).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        guarded(&self.faults, StoreOp::Remove, key, || self.inner.remove(key)).await
    }

    async fn update_conditional(
        &self,
        key: &str,
        ttl: Duration,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError> {
        guarded(&self.faults, StoreOp::UpdateConditional, key, || {
            self.inner.update_conditional(key, ttl, update)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_effects::MemoryRecordStore;

    #[tokio::test]
    async fn rules_skip_then_fail_a_fixed_number_of_times() {
        let faults = FaultInjector::new();
        faults.add(
            FaultRule::new(FaultKind::Throttle)
                .op(StoreOp::Set)
                .skip(1)
                .times(2),
        );
        let store = FaultyRecordStore::new(MemoryRecordStore::new(), faults.clone());

        assert!(store.set("k", b"1".to_vec()).await.is_ok());
        assert!(store.set("k", b"2".to_vec()).await.is_err());
        assert!(store.set("k", b"3".to_vec()).await.is_err());
        assert!(store.set("k", b"4".to_vec()).await.is_ok());
        assert_eq!(faults.calls(StoreOp::Set), 4);
        assert_eq!(faults.injected(), 2);
    }

    #[tokio::test]
    async fn timeout_after_apply_still_writes() {
        let faults = FaultInjector::new();
        faults.add(FaultRule::new(FaultKind::TimeoutAfterApply).times(1));
        let store = FaultyRecordStore::new(MemoryRecordStore::new(), faults);

        let err = store.set("k", b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v");
    }

    #[tokio::test]
    async fn key_filter_limits_matches() {
        let faults = FaultInjector::new();
        faults.add(FaultRule::new(FaultKind::Fatal).key_contains("/tx/"));
        let store = FaultyRecordStore::new(MemoryRecordStore::new(), faults);

        assert!(store.set("s/records/a", b"v".to_vec()).await.is_ok());
        assert!(store.set("s/tx/1", b"false".to_vec()).await.is_err());
    }
}
