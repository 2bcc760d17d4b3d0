//! Commit protocol
//!
//! 1. write the marker for a fresh `tx_id` (pending)
//! 2. write the document: unchanged committed payload plus the pending
//!    reference carrying the patch. A patch that would push the document past
//!    the entry limit is written to its own shards first.
//! 3. confirm the lease is still ours
//! 4. delete the marker; the transaction is now committed
//! 5. finalize: write shards if needed, then the document with the new
//!    payload and no pending reference
//! 6. drain the orphan queue
//!
//! A crash before step 4 leaves a present marker and readers see the old
//! value. A crash after it leaves an absent marker and readers apply the
//! patch. Finalize failures are repaired by the next commit or load.

use super::state::{SessionPhase, Unfinalized};
use super::SessionInner;
use crate::orphan::Cleanup;
use holdfast_core::effects::StoreError;
use holdfast_core::{
    diff, ArtifactKind, CommittedSnapshot, HoldfastResult, OrphanEntry, Payload,
    PendingTransaction, StoredRecord, TxId,
};
use std::collections::HashSet;
use std::sync::Arc;

impl SessionInner {
    /// Commit the working copy. Callers hold `commit_gate`.
    pub(super) async fn commit(&self) -> HoldfastResult<()> {
        let entered_saving = {
            let mut state = self.state.lock();
            let active = state.phase == SessionPhase::Active;
            if active {
                state.phase = SessionPhase::Saving;
            }
            active
        };

        let result = self.commit_changes().await;

        if entered_saving {
            let mut state = self.state.lock();
            if state.phase == SessionPhase::Saving {
                state.phase = SessionPhase::Active;
            }
        }
        result
    }

    async fn commit_changes(&self) -> HoldfastResult<()> {
        let unfinalized = self.state.lock().unfinalized.clone();
        if let Some(unfinalized) = unfinalized {
            self.finalize(unfinalized).await?;
        }

        let (current, revision, base, payload, payload_migration_version) = {
            let state = self.state.lock();
            if !state.is_dirty() {
                return Ok(());
            }
            (
                state.current.clone(),
                state.revision,
                state.committed.value.clone(),
                state.payload.clone(),
                state.payload_migration_version,
            )
        };

        let tx_id = TxId::new();
        let patch = diff(&base, &current);
        let migration_version = self.ctx.migration_version();
        tracing::debug!(key = %self.key, tx_id = %tx_id, ops = patch.len(), "Committing");

        let retry = &self.ctx.config.retry;
        let records = self.ctx.stores.records.as_ref();

        if let Err(err) = self.reader.mark_pending(&tx_id).await {
            self.orphan_marker(&tx_id).await;
            return Err(err);
        }

        let pending = PendingTransaction::inline(
            tx_id,
            patch,
            (migration_version != payload_migration_version).then_some(migration_version),
        );
        let document = StoredRecord {
            committed: payload,
            pending: Some(pending),
            migration_version: payload_migration_version,
            orphans: self.state.lock().orphans.snapshot(),
        };
        let (bytes, spilled_patch) = match self.stage_pending(document).await {
            Ok(staged) => staged,
            Err(err) => {
                self.orphan_marker(&tx_id).await;
                return Err(err);
            }
        };
        if let Err(err) = retry
            .execute(|| records.set(&self.record_key, bytes.clone()))
            .await
        {
            self.orphan_marker(&tx_id).await;
            self.orphan_shards(spilled_patch).await;
            return Err(err.into());
        }

        if let Err(err) = self.lock.ensure_held(&self.handle).await {
            self.force_close();
            return Err(err.into_session_error(&self.key));
        }

        if let Err(err) = self.reader.mark_committed(&tx_id).await {
            // The delete may have landed; either way the next commit rewrites
            // the pending reference and these artifacts become garbage
            self.orphan_marker(&tx_id).await;
            self.orphan_shards(spilled_patch).await;
            return Err(err);
        }

        let unfinalized = Unfinalized {
            tx_id,
            value: current.clone(),
            migration_version,
            spilled_patch,
        };
        {
            let mut state = self.state.lock();
            state.committed = CommittedSnapshot {
                value: current,
                version: None,
            };
            state.saved_revision = revision;
            state.unfinalized = Some(unfinalized.clone());
        }
        tracing::info!(key = %self.key, tx_id = %tx_id, "Transaction committed");

        if let Err(err) = self.finalize(unfinalized).await {
            tracing::warn!(
                key = %self.key,
                tx_id = %tx_id,
                error = %err,
                "Finalize deferred to next save"
            );
        }
        self.drain_orphans().await;
        Ok(())
    }

    /// Fold a committed transaction into the stored payload
    async fn finalize(&self, unfinalized: Unfinalized) -> HoldfastResult<()> {
        let Unfinalized {
            tx_id,
            value,
            migration_version,
            spilled_patch,
        } = unfinalized;
        let retry = &self.ctx.config.retry;
        let records = self.ctx.stores.records.as_ref();

        let encoded = self.codec.encode(&self.key, &tx_id, &value)?;
        if let Err((err, written)) = self.codec.write_shards(records, retry, &encoded).await {
            let now = self.ctx.stores.time.now_ms().await;
            self.state
                .lock()
                .orphans
                .enqueue(OrphanEntry::new(ArtifactKind::Shard, written, now));
            return Err(err);
        }

        let now = self.ctx.stores.time.now_ms().await;
        let (replaced, mut orphans) = {
            let state = self.state.lock();
            (state.payload.clone(), state.orphans.clone())
        };
        let payload = encoded.payload();
        let superseded = OrphanEntry::new(
            ArtifactKind::Shard,
            replaced
                .shard_keys()
                .iter()
                .filter(|key| !payload.shard_keys().contains(*key))
                .cloned()
                .collect(),
            now,
        );
        let spilled = OrphanEntry::new(ArtifactKind::Shard, spilled_patch, now);
        orphans.enqueue(superseded.clone());
        orphans.enqueue(spilled.clone());

        let document = StoredRecord {
            committed: payload.clone(),
            pending: None,
            migration_version,
            orphans: orphans.snapshot(),
        };
        let bytes = document.encode()?;
        let version = match retry.execute(|| records.set(&self.record_key, bytes.clone())).await {
            Ok(version) => version,
            Err(err) => {
                // Shards of this attempt are not referenced by any document
                let now = self.ctx.stores.time.now_ms().await;
                self.state.lock().orphans.enqueue(OrphanEntry::new(
                    ArtifactKind::Shard,
                    payload.shard_keys().to_vec(),
                    now,
                ));
                return Err(err.into());
            }
        };

        let mut state = self.state.lock();
        state.payload = payload;
        state.payload_migration_version = migration_version;
        state.committed.version = Some(version);
        if state.unfinalized.as_ref().is_some_and(|u| u.tx_id == tx_id) {
            state.unfinalized = None;
        }
        state.orphans.enqueue(superseded);
        state.orphans.enqueue(spilled);
        tracing::debug!(key = %self.key, tx_id = %tx_id, "Transaction finalized");
        Ok(())
    }

    /// Encode the pending document, spilling the patch to shards when the
    /// document would not fit in one entry.
    ///
    /// Returns the document bytes and the spilled shard keys.
    async fn stage_pending(
        &self,
        mut document: StoredRecord,
    ) -> HoldfastResult<(Vec<u8>, Vec<String>)> {
        let bytes = document.encode()?;
        let limit = self.ctx.config.session.max_entry_bytes;
        let Some(pending) = document.pending.as_mut().filter(|_| bytes.len() > limit) else {
            return Ok((bytes, Vec::new()));
        };
        let Some(patch) = pending.patch.take() else {
            return Ok((bytes, Vec::new()));
        };

        let encoded = self.codec.spill_patch(&self.key, &pending.tx_id, &patch)?;
        let retry = &self.ctx.config.retry;
        let records = self.ctx.stores.records.as_ref();
        if let Err((err, written)) = self.codec.write_shards(records, retry, &encoded).await {
            self.orphan_shards(written).await;
            return Err(err);
        }
        let Payload::Sharded(manifest) = encoded.payload() else {
            return Ok((bytes, Vec::new()));
        };
        let spilled = manifest.shard_keys.clone();
        tracing::debug!(
            key = %self.key,
            tx_id = %pending.tx_id,
            document_bytes = bytes.len(),
            shards = spilled.len(),
            "Pending document over the entry limit; patch spilled"
        );
        pending.patch_shards = Some(manifest);

        match document.encode() {
            Ok(bytes) => Ok((bytes, spilled)),
            Err(err) => {
                self.orphan_shards(spilled).await;
                Err(err)
            }
        }
    }

    async fn orphan_marker(&self, tx_id: &TxId) {
        let now = self.ctx.stores.time.now_ms().await;
        let key = self.reader.marker_key(tx_id);
        self.state
            .lock()
            .orphans
            .enqueue(OrphanEntry::new(ArtifactKind::Marker, vec![key], now));
    }

    async fn orphan_shards(&self, keys: Vec<String>) {
        let now = self.ctx.stores.time.now_ms().await;
        self.state
            .lock()
            .orphans
            .enqueue(OrphanEntry::new(ArtifactKind::Shard, keys, now));
    }

    /// Keys the stored document still depends on
    async fn protected_keys(&self) -> HoldfastResult<ProtectedKeys> {
        let retry = &self.ctx.config.retry;
        let records = self.ctx.stores.records.as_ref();
        let mut protected = ProtectedKeys::default();
        let payload_keys = self.state.lock().payload.shard_keys().to_vec();
        protected.live.extend(payload_keys);

        if let Some(entry) = retry.execute(|| records.get(&self.record_key)).await? {
            let document = StoredRecord::decode(&entry.value)?;
            protected
                .live
                .extend(document.committed.shard_keys().iter().cloned());
            if let Some(pending) = document.pending {
                protected.named.insert(self.reader.marker_key(&pending.tx_id));
                protected
                    .named
                    .extend(pending.patch_shard_keys().iter().cloned());
            }
        }
        Ok(protected)
    }

    /// Best-effort deletion of queued artifacts; failures are logged
    pub(super) async fn drain_orphans(&self) {
        let mut queue = {
            let mut state = self.state.lock();
            if state.orphans.is_empty() {
                return;
            }
            state.orphans.take()
        };

        match self.protected_keys().await {
            Ok(protected) => {
                let protected = Arc::new(protected);
                let records = self.ctx.stores.records.clone();
                let markers = self.ctx.stores.markers.clone();
                queue
                    .drain(&self.ctx.config.retry, |entry| {
                        let keys = entry.keys.clone();
                        let store = match entry.kind {
                            ArtifactKind::Shard => records.clone(),
                            ArtifactKind::Marker => markers.clone(),
                        };
                        let protected = protected.clone();
                        async move {
                            // A pending reference must outlive its artifacts
                            if keys.iter().any(|key| protected.named.contains(key)) {
                                return Ok(Cleanup::Deferred);
                            }
                            if keys.iter().any(|key| protected.live.contains(key)) {
                                return Ok(Cleanup::Retained);
                            }
                            for key in &keys {
                                store.remove(key).await?;
                            }
                            Ok::<_, StoreError>(Cleanup::Deleted)
                        }
                    })
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    key = %self.key,
                    error = %err,
                    "Skipping orphan cleanup; document unreadable"
                );
            }
        }

        let mut state = self.state.lock();
        let newer = state.orphans.take();
        queue.append(newer);
        state.orphans = queue;
    }
}

/// Artifacts the stored document depends on
#[derive(Debug, Default)]
struct ProtectedKeys {
    /// Shards of a committed payload; queued entries for them are stale
    live: HashSet<String>,
    /// Marker and spilled patch of the pending reference; deletable once the
    /// document stops naming them
    named: HashSet<String>,
}
