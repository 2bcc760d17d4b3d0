//! In-memory TTL lease map handler
//!
//! Expiry is evaluated lazily against the injected clock: an entry whose
//! deadline has passed reads as absent and is dropped on the next write to
//! the map.

use async_trait::async_trait;
use holdfast_core::effects::{
    Conditional, ConditionalFn, ConditionalOutcome, LeaseMapEffects, PhysicalTimeEffects,
    StoreError, Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct LeaseEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
}

impl LeaseEntry {
    fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// In-memory TTL map backed by a clock effect
#[derive(Clone)]
pub struct MemoryLeaseMap {
    entries: Arc<RwLock<HashMap<String, LeaseEntry>>>,
    time: Arc<dyn PhysicalTimeEffects>,
    writes: Arc<std::sync::atomic::AtomicU64>,
}

impl MemoryLeaseMap {
    /// Empty map expiring entries against `time`
    pub fn new(time: Arc<dyn PhysicalTimeEffects>) -> Self {
        Self {
            entries: Arc::default(),
            time,
            writes: Arc::default(),
        }
    }

    /// Expiry deadline of the live entry at `key`, if any
    pub async fn expires_at_ms(&self, key: &str) -> Option<u64> {
        let now = self.time.now_ms().await;
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at_ms)
    }

    fn deadline(now_ms: u64, ttl: Duration) -> u64 {
        now_ms.saturating_add(ttl.as_millis().try_into().unwrap_or(u64::MAX))
    }

    fn next_version(&self) -> Version {
        Version(
            self.writes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                + 1,
        )
    }
}

#[async_trait]
impl LeaseMapEffects for MemoryLeaseMap {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.time.now_ms().await;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let now = self.time.now_ms().await;
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.to_string(),
            LeaseEntry {
                value,
                expires_at_ms: Self::deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.time.now_ms().await;
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn update_conditional(
        &self,
        key: &str,
        ttl: Duration,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError> {
        let now = self.time.now_ms().await;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        if entries.len() < before {
            tracing::trace!(expired = before - entries.len(), "Purged expired leases");
        }

        let decision = update(entries.get(key).map(|e| e.value.as_slice()));
        match decision {
            Conditional::Abort => Ok(ConditionalOutcome::Aborted),
            Conditional::Put(value) => {
                entries.insert(
                    key.to_string(),
                    LeaseEntry {
                        value,
                        expires_at_ms: Self::deadline(now, ttl),
                    },
                );
                Ok(ConditionalOutcome::Written(self.next_version()))
            }
            Conditional::Remove => {
                entries.remove(key);
                Ok(ConditionalOutcome::Removed)
            }
        }
    }
}
