//! Committed payload encoding
//!
//! Small values live inline in the record document. A value whose encoding
//! exceeds half the entry limit is split into fixed-size chunks stored under
//! per-transaction shard keys, and the document keeps only the manifest.
//! Shards are immutable once written: a new commit writes a new set and the
//! previous set becomes an orphan.
//!
//! The same chunking carries a pending patch that would not fit in the
//! document. Those shards live under their own prefix and become orphans as
//! soon as the transaction is finalized or rolled back.

use holdfast_core::effects::{RecordStoreEffects, RetryPolicy};
use holdfast_core::{
    HoldfastError, HoldfastResult, Keyspace, Patch, Payload, ShardManifest, TxId, Value,
};

/// A payload ready to be written
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedPayload {
    /// Held in the document itself
    Inline(Value),
    /// Split across shard keys; the document keeps the manifest
    Sharded {
        /// Index recorded in the document
        manifest: ShardManifest,
        /// Shard contents, in manifest order
        chunks: Vec<Vec<u8>>,
    },
}

impl EncodedPayload {
    /// Payload to record in the document once any shards are written
    pub fn payload(&self) -> Payload {
        match self {
            EncodedPayload::Inline(value) => Payload::Inline(value.clone()),
            EncodedPayload::Sharded { manifest, .. } => Payload::Sharded(manifest.clone()),
        }
    }
}

/// Splits and reassembles committed values
#[derive(Debug, Clone)]
pub struct ShardCodec {
    keyspace: Keyspace,
    max_entry_bytes: usize,
}

impl ShardCodec {
    /// Codec splitting anything above `max_entry_bytes`
    pub fn new(keyspace: Keyspace, max_entry_bytes: usize) -> Self {
        Self {
            keyspace,
            max_entry_bytes: max_entry_bytes.max(1),
        }
    }

    /// Decide how `value` is stored for commit `tx_id` of record `key`
    pub fn encode(&self, key: &str, tx_id: &TxId, value: &Value) -> HoldfastResult<EncodedPayload> {
        let bytes = serde_json::to_vec(value)?;
        if bytes.len() <= self.max_entry_bytes / 2 {
            return Ok(EncodedPayload::Inline(value.clone()));
        }

        tracing::debug!(key, tx_id = %tx_id, bytes = bytes.len(), "Sharding payload");
        Ok(self.split(bytes, |index| self.keyspace.shard_key(key, tx_id, index)))
    }

    /// Split an encoded patch into shards, whatever its size
    pub fn spill_patch(
        &self,
        key: &str,
        tx_id: &TxId,
        patch: &Patch,
    ) -> HoldfastResult<EncodedPayload> {
        let bytes = serde_json::to_vec(patch)?;
        tracing::debug!(key, tx_id = %tx_id, bytes = bytes.len(), "Spilling patch to shards");
        Ok(self.split(bytes, |index| self.keyspace.patch_shard_key(key, tx_id, index)))
    }

    fn split(&self, bytes: Vec<u8>, shard_key: impl Fn(usize) -> String) -> EncodedPayload {
        let chunks: Vec<Vec<u8>> = bytes
            .chunks(self.max_entry_bytes)
            .map(<[u8]>::to_vec)
            .collect();
        EncodedPayload::Sharded {
            manifest: ShardManifest {
                shard_keys: (0..chunks.len()).map(shard_key).collect(),
                total_bytes: bytes.len(),
            },
            chunks,
        }
    }

    /// Write the shards of `encoded`, if any.
    ///
    /// On failure the keys already written are returned with the error so the
    /// caller can queue them for cleanup.
    pub async fn write_shards(
        &self,
        store: &dyn RecordStoreEffects,
        retry: &RetryPolicy,
        encoded: &EncodedPayload,
    ) -> Result<(), (HoldfastError, Vec<String>)> {
        let EncodedPayload::Sharded { manifest, chunks } = encoded else {
            return Ok(());
        };

        let mut written = Vec::with_capacity(chunks.len());
        for (shard_key, chunk) in manifest.shard_keys.iter().zip(chunks) {
            // A timed-out write may have landed, so count the key as written
            written.push(shard_key.clone());
            if let Err(err) = retry.execute(|| store.set(shard_key, chunk.clone())).await {
                return Err((err.into(), written));
            }
        }
        Ok(())
    }

    /// Load the value held by `payload`
    pub async fn read_payload(
        &self,
        store: &dyn RecordStoreEffects,
        retry: &RetryPolicy,
        payload: &Payload,
    ) -> HoldfastResult<Value> {
        let manifest = match payload {
            Payload::Inline(value) => return Ok(value.clone()),
            Payload::Sharded(manifest) => manifest,
        };
        let bytes = self.read_bytes(store, retry, manifest).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load a patch spilled by [`ShardCodec::spill_patch`]
    pub async fn read_patch(
        &self,
        store: &dyn RecordStoreEffects,
        retry: &RetryPolicy,
        manifest: &ShardManifest,
    ) -> HoldfastResult<Patch> {
        let bytes = self.read_bytes(store, retry, manifest).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_bytes(
        &self,
        store: &dyn RecordStoreEffects,
        retry: &RetryPolicy,
        manifest: &ShardManifest,
    ) -> HoldfastResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(manifest.total_bytes);
        for shard_key in &manifest.shard_keys {
            let shard = retry
                .execute(|| store.get(shard_key))
                .await?
                .ok_or_else(|| HoldfastError::codec(format!("missing shard {shard_key}")))?;
            bytes.extend_from_slice(&shard.value);
        }
        if bytes.len() != manifest.total_bytes {
            return Err(HoldfastError::codec(format!(
                "sharded payload is {} bytes, manifest says {}",
                bytes.len(),
                manifest.total_bytes
            )));
        }
        Ok(bytes)
    }
}
