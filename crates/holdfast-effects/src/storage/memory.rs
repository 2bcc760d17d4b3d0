//! In-memory record store handler

use async_trait::async_trait;
use holdfast_core::effects::{
    Conditional, ConditionalFn, ConditionalOutcome, RecordStoreEffects, StoreError, Version,
    Versioned,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Entries {
    data: HashMap<String, Versioned>,
    next_version: u64,
}

impl Entries {
    fn write(&mut self, key: &str, value: Vec<u8>) -> Version {
        self.next_version += 1;
        let version = Version(self.next_version);
        self.data.insert(key.to_string(), Versioned { value, version });
        version
    }
}

/// In-memory versioned record store.
///
/// Enforces an optional per-entry size limit the way a remote backend would,
/// rejecting oversized writes with [`StoreError::PayloadTooLarge`]. Clones
/// share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    entries: Arc<RwLock<Entries>>,
    max_value_bytes: Option<usize>,
}

impl MemoryRecordStore {
    /// Create an unbounded memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory store rejecting entries larger than `limit` bytes
    pub fn with_max_value_bytes(limit: usize) -> Self {
        Self {
            entries: Arc::default(),
            max_value_bytes: Some(limit),
        }
    }

    /// Keys currently stored under `prefix`, sorted
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.data.len()
    }

    /// True when no entries are stored
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_size(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        match self.max_value_bytes {
            Some(limit) if value.len() > limit => {
                tracing::debug!(key, size = value.len(), limit, "Rejecting oversized entry");
                Err(StoreError::PayloadTooLarge {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                })
            }
            _ => Ok(()),
        }
    }
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: "empty key".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RecordStoreEffects for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        check_key(key)?;
        let entries = self.entries.read().await;
        Ok(entries.data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<Version, StoreError> {
        check_key(key)?;
        self.check_size(key, &value)?;
        let mut entries = self.entries.write().await;
        Ok(entries.write(key, value))
    }

    async fn update_conditional(
        &self,
        key: &str,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError> {
        check_key(key)?;
        let mut entries = self.entries.write().await;
        let decision = update(entries.data.get(key).map(|v| v.value.as_slice()));
        match decision {
            Conditional::Abort => Ok(ConditionalOutcome::Aborted),
            Conditional::Put(value) => {
                self.check_size(key, &value)?;
                Ok(ConditionalOutcome::Written(entries.write(key, value)))
            }
            Conditional::Remove => {
                entries.data.remove(key);
                Ok(ConditionalOutcome::Removed)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        check_key(key)?;
        let mut entries = self.entries.write().await;
        Ok(entries.data.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_increase_per_write() {
        let store = MemoryRecordStore::new();
        let v1 = store.set("a", b"1".to_vec()).await.unwrap();
        let v2 = store.set("a", b"2".to_vec()).await.unwrap();
        assert!(v2 > v1);
        let read = store.get("a").await.unwrap().unwrap();
        assert_eq!(read.value, b"2");
        assert_eq!(read.version, v2);
    }

    #[tokio::test]
    async fn conditional_update_sees_current_value() {
        let store = MemoryRecordStore::new();
        store.set("a", b"old".to_vec()).await.unwrap();

        let outcome = store
            .update_conditional("a", &|current| match current {
                Some(b"old") => Conditional::Put(b"new".to_vec()),
                _ => Conditional::Abort,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, ConditionalOutcome::Written(_)));

        let outcome = store
            .update_conditional("a", &|current| match current {
                Some(b"old") => Conditional::Put(b"newer".to_vec()),
                _ => Conditional::Abort,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ConditionalOutcome::Aborted);
        assert_eq!(store.get("a").await.unwrap().unwrap().value, b"new");
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let store = MemoryRecordStore::with_max_value_bytes(4);
        let err = store.set("a", vec![0; 5]).await.unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { size: 5, limit: 4, .. }));
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_key_is_invalid() {
        let store = MemoryRecordStore::new();
        assert!(matches!(
            store.get("").await,
            Err(StoreError::InvalidKey { .. })
        ));
    }
}
