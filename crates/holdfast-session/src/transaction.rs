//! Transaction markers and committed-state resolution
//!
//! A commit first writes its marker with the sentinel `false`, then records
//! the patch next to the pre-commit payload, then deletes the marker. The
//! deletion is the commit point: any reader that finds a pending reference
//! resolves it with a single marker read.
//!
//! - marker absent: the transaction committed; the patch is applied to the
//!   committed payload
//! - marker present: the transaction is in flight or was abandoned; the
//!   committed payload is the visible state
//!
//! Readers never see a half-applied commit: the two outcomes are exactly the
//! pre-commit and post-commit values.

use crate::shard::ShardCodec;
use holdfast_core::effects::{RecordStoreEffects, RetryPolicy};
use holdfast_core::{
    HoldfastError, HoldfastResult, Keyspace, MarkerState, Patch, PendingTransaction, TxId, Value,
};
use std::sync::Arc;

/// Outcome of resolving a committed payload against a pending transaction
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRead {
    /// Visible committed value
    pub value: Value,
    /// Marker state observed, or `None` when there was no pending reference
    pub marker: Option<MarkerState>,
}

/// Where spilled patches are read from
#[derive(Clone)]
struct PatchShards {
    records: Arc<dyn RecordStoreEffects>,
    codec: ShardCodec,
}

/// Reads and writes transaction markers
#[derive(Clone)]
pub struct TransactionReader {
    markers: Arc<dyn RecordStoreEffects>,
    keyspace: Keyspace,
    retry: RetryPolicy,
    patch_shards: Option<PatchShards>,
}

impl TransactionReader {
    /// Reader over `markers`; spilled patches cannot be resolved until
    /// [`TransactionReader::with_patch_shards`] is called
    pub fn new(
        markers: Arc<dyn RecordStoreEffects>,
        keyspace: Keyspace,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            markers,
            keyspace,
            retry,
            patch_shards: None,
        }
    }

    /// Resolve spilled patches from `records`
    pub fn with_patch_shards(
        mut self,
        records: Arc<dyn RecordStoreEffects>,
        codec: ShardCodec,
    ) -> Self {
        self.patch_shards = Some(PatchShards { records, codec });
        self
    }

    /// Marker key for `tx_id`
    pub fn marker_key(&self, tx_id: &TxId) -> String {
        self.keyspace.marker_key(tx_id)
    }

    /// Read the marker for `tx_id`
    pub async fn marker_state(&self, tx_id: &TxId) -> HoldfastResult<MarkerState> {
        let key = self.marker_key(tx_id);
        let entry = self.retry.execute(|| self.markers.get(&key)).await?;
        Ok(MarkerState::from_entry(
            entry.as_ref().map(|versioned| versioned.value.as_slice()),
        ))
    }

    /// Resolve the visible value, reporting which marker state was observed
    pub async fn read(
        &self,
        committed: &Value,
        pending: Option<&PendingTransaction>,
    ) -> HoldfastResult<ResolvedRead> {
        let Some(pending) = pending else {
            return Ok(ResolvedRead {
                value: committed.clone(),
                marker: None,
            });
        };

        let marker = self.marker_state(&pending.tx_id).await?;
        let value = match marker {
            MarkerState::Pending => {
                tracing::debug!(
                    tx_id = %pending.tx_id,
                    "Transaction not committed; using pre-commit state"
                );
                committed.clone()
            }
            MarkerState::Committed => {
                let patch = self.committed_patch(pending).await?;
                tracing::debug!(
                    tx_id = %pending.tx_id,
                    ops = patch.len(),
                    "Applying committed transaction"
                );
                patch.apply(committed)?
            }
        };

        Ok(ResolvedRead {
            value,
            marker: Some(marker),
        })
    }

    async fn committed_patch(&self, pending: &PendingTransaction) -> HoldfastResult<Patch> {
        if let Some(patch) = &pending.patch {
            return Ok(patch.clone());
        }
        match (&pending.patch_shards, &self.patch_shards) {
            (Some(manifest), Some(source)) => {
                source
                    .codec
                    .read_patch(source.records.as_ref(), &self.retry, manifest)
                    .await
            }
            _ => {
                tracing::error!(tx_id = %pending.tx_id, "Committed transaction carries no patch");
                Err(HoldfastError::CommitPendingWithoutPatch {
                    tx_id: pending.tx_id.to_string(),
                })
            }
        }
    }

    /// Resolve the visible value
    pub async fn read_tx(
        &self,
        committed: &Value,
        pending: Option<&PendingTransaction>,
    ) -> HoldfastResult<Value> {
        Ok(self.read(committed, pending).await?.value)
    }

    /// Write the pending sentinel for `tx_id`
    pub async fn mark_pending(&self, tx_id: &TxId) -> HoldfastResult<()> {
        let key = self.marker_key(tx_id);
        self.retry
            .execute(|| {
                self.markers
                    .set(&key, MarkerState::PENDING_SENTINEL.to_vec())
            })
            .await?;
        Ok(())
    }

    /// Delete the marker for `tx_id`, committing the transaction
    pub async fn mark_committed(&self, tx_id: &TxId) -> HoldfastResult<()> {
        let key = self.marker_key(tx_id);
        self.retry.execute(|| self.markers.remove(&key)).await?;
        Ok(())
    }
}
