//! Orphaned artifact cleanup
//!
//! Shards and stale transaction markers that an interrupted commit could not
//! delete are queued here and retried on later drains. A failed drain leaks
//! storage; it never affects the visible record.

use holdfast_core::effects::{RetryPolicy, StoreError};
use holdfast_core::OrphanEntry;
use std::collections::VecDeque;
use std::future::Future;

/// What a deleter did with one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Every key of the entry is gone
    Deleted,
    /// The entry must not be deleted yet; keep it without counting an attempt
    Deferred,
    /// The artifacts are referenced again; drop the entry without deleting
    Retained,
}

/// Insertion-ordered queue of artifacts awaiting deletion
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanQueue {
    entries: VecDeque<OrphanEntry>,
    max_attempts: u32,
}

impl OrphanQueue {
    /// Empty queue dropping entries after `max_attempts` failures
    pub fn new(max_attempts: u32) -> Self {
        Self::from_entries(Vec::new(), max_attempts)
    }

    /// Rebuild a queue from its persisted entries
    pub fn from_entries(entries: Vec<OrphanEntry>, max_attempts: u32) -> Self {
        Self {
            entries: entries.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue an entry; entries without keys are ignored
    pub fn enqueue(&mut self, entry: OrphanEntry) {
        if entry.keys.is_empty() {
            return;
        }
        tracing::debug!(kind = ?entry.kind, keys = entry.keys.len(), "Queued orphaned artifacts");
        self.entries.push_back(entry);
    }

    /// Move every entry of `other` to the back of this queue
    pub fn append(&mut self, other: OrphanQueue) {
        self.entries.extend(other.entries);
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in queue order, for persistence
    pub fn snapshot(&self) -> Vec<OrphanEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Take every entry out, leaving an empty queue with the same limits
    pub fn take(&mut self) -> OrphanQueue {
        OrphanQueue {
            entries: std::mem::take(&mut self.entries),
            max_attempts: self.max_attempts,
        }
    }

    /// Try to delete every queued entry once, each call wrapped in `retry`.
    ///
    /// Deleted entries leave the queue. Failed entries stay in place with
    /// their attempt count bumped, and are dropped with a warning once they
    /// reach the attempt limit. Returns the number of entries deleted.
    pub async fn drain<F, Fut>(&mut self, retry: &RetryPolicy, mut deleter: F) -> usize
    where
        F: FnMut(&OrphanEntry) -> Fut,
        Fut: Future<Output = Result<Cleanup, StoreError>>,
    {
        let mut removed = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());

        while let Some(mut entry) = self.entries.pop_front() {
            match retry.execute(|| deleter(&entry)).await {
                Ok(Cleanup::Deleted) => removed += 1,
                Ok(Cleanup::Deferred) => kept.push_back(entry),
                Ok(Cleanup::Retained) => {
                    tracing::debug!(
                        kind = ?entry.kind,
                        "Queued artifacts are live; dropping entry"
                    );
                }
                Err(err) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.max_attempts {
                        tracing::warn!(
                            kind = ?entry.kind,
                            keys = ?entry.keys,
                            attempts = entry.attempts,
                            error = %err,
                            "Abandoning orphaned artifacts"
                        );
                    } else {
                        tracing::warn!(
                            kind = ?entry.kind,
                            attempts = entry.attempts,
                            error = %err,
                            "Orphan cleanup failed; will retry"
                        );
                        kept.push_back(entry);
                    }
                }
            }
        }

        self.entries = kept;
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Drained orphan queue");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_core::ArtifactKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(key: &str) -> OrphanEntry {
        OrphanEntry::new(ArtifactKind::Shard, vec![key.to_string()], 0)
    }

    #[tokio::test]
    async fn drain_removes_successes_and_keeps_failures() {
        let mut queue = OrphanQueue::new(5);
        queue.enqueue(entry("a"));
        queue.enqueue(entry("bad"));
        queue.enqueue(entry("c"));

        let removed = queue
            .drain(&RetryPolicy::none(), |e| {
                let fail = e.keys[0] == "bad";
                async move {
                    if fail {
                        Err(StoreError::backend("denied"))
                    } else {
                        Ok(Cleanup::Deleted)
                    }
                }
            })
            .await;

        assert_eq!(removed, 2);
        let left = queue.snapshot();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].keys, vec!["bad".to_string()]);
        assert_eq!(left[0].attempts, 1);
    }

    #[tokio::test]
    async fn entries_are_abandoned_at_the_attempt_limit() {
        let mut queue = OrphanQueue::new(2);
        queue.enqueue(entry("x"));
        for _ in 0..2 {
            queue
                .drain(&RetryPolicy::none(), |_| async {
                    Err::<Cleanup, _>(StoreError::backend("denied"))
                })
                .await;
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn deferred_entries_keep_their_order_and_attempts() {
        let mut queue = OrphanQueue::new(2);
        queue.enqueue(entry("a"));
        queue.enqueue(entry("b"));
        let removed = queue
            .drain(&RetryPolicy::none(), |_| async { Ok(Cleanup::Deferred) })
            .await;
        assert_eq!(removed, 0);
        let keys: Vec<_> = queue.snapshot().into_iter().map(|e| e.keys[0].clone()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(queue.snapshot().iter().all(|e| e.attempts == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_one_drain() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut queue = OrphanQueue::new(3);
        queue.enqueue(entry("a"));
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);

        let counter = calls.clone();
        let removed = queue
            .drain(&policy, move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StoreError::throttled("a"))
                    } else {
                        Ok(Cleanup::Deleted)
                    }
                }
            })
            .await;

        assert_eq!(removed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retained_entries_leave_without_counting() {
        let mut queue = OrphanQueue::new(2);
        queue.enqueue(entry("live"));
        let removed = queue
            .drain(&RetryPolicy::none(), |_| async { Ok(Cleanup::Retained) })
            .await;
        assert_eq!(removed, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_entries_are_ignored() {
        let mut queue = OrphanQueue::new(1);
        queue.enqueue(OrphanEntry::new(ArtifactKind::Marker, Vec::new(), 0));
        assert!(queue.is_empty());
    }
}
