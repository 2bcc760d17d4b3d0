//! Persistent domain types
//!
//! Everything in this module is written to a remote store and therefore
//! serializable. The record entry for a key holds a [`StoredRecord`]; leases
//! hold a [`LockLease`]; transaction markers hold the sentinel `false`.

use crate::effects::Version;
use crate::errors::{HoldfastError, HoldfastResult};
use crate::patch::Patch;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one commit attempt; also the marker key suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub Uuid);

impl TxId {
    /// Fresh random transaction id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a lock holder; unique per session instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    /// Fresh random owner id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease entry stored in the TTL map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Holder of the lease
    pub owner: OwnerId,
    /// Deadline the holder asked for
    pub expires_at_ms: u64,
}

/// Resolved state of a transaction marker
///
/// The marker store encodes this as absent (committed) or the sentinel
/// `false` (pending or rolled back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// Marker absent
    Committed,
    /// Marker holds the sentinel
    Pending,
}

impl MarkerState {
    /// Sentinel bytes written while a transaction is pending
    pub const PENDING_SENTINEL: &'static [u8] = b"false";

    /// Interpret a marker read
    pub fn from_entry(entry: Option<&[u8]>) -> Self {
        match entry {
            None => MarkerState::Committed,
            Some(_) => MarkerState::Pending,
        }
    }
}

/// A commit in flight.
///
/// The pre-commit state is the `committed` payload of the same
/// [`StoredRecord`]; applying the patch to it yields the post-commit state.
/// A patch too large for the document is written to shards first and only
/// its manifest is kept here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Transaction id; names the marker
    pub tx_id: TxId,
    /// Patch from the committed payload to the post-commit state
    pub patch: Option<Patch>,
    /// Shards holding the encoded patch when `patch` is not inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_shards: Option<ShardManifest>,
    /// Migration version of the post-commit state, when it differs from
    /// the document's
    #[serde(default)]
    pub migration_version: Option<u32>,
}

impl PendingTransaction {
    /// Pending reference carrying `patch` inline
    pub fn inline(tx_id: TxId, patch: Patch, migration_version: Option<u32>) -> Self {
        Self {
            tx_id,
            patch: Some(patch),
            patch_shards: None,
            migration_version,
        }
    }

    /// Shard keys holding the patch, if it was spilled
    pub fn patch_shard_keys(&self) -> &[String] {
        match &self.patch_shards {
            Some(manifest) => &manifest.shard_keys,
            None => &[],
        }
    }
}

/// Index of a value split across shard keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    /// Shard keys in concatenation order
    pub shard_keys: Vec<String>,
    /// Length of the reassembled encoding
    pub total_bytes: usize,
}

/// Committed payload: either held inline or split into shards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Value held in the document
    Inline(Value),
    /// Value split across shard keys
    Sharded(ShardManifest),
}

impl Payload {
    /// Shard keys owned by this payload, if any
    pub fn shard_keys(&self) -> &[String] {
        match self {
            Payload::Inline(_) => &[],
            Payload::Sharded(manifest) => &manifest.shard_keys,
        }
    }
}

/// Which store an orphaned artifact lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Shard entries in the record store
    Shard,
    /// Stale transaction markers in the marker store
    Marker,
}

/// Artifacts queued for best-effort deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanEntry {
    /// Keys to delete
    pub keys: Vec<String>,
    /// Which store the keys live in
    pub kind: ArtifactKind,
    /// When the artifacts were orphaned
    pub discovered_at_ms: u64,
    /// Failed deletion attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl OrphanEntry {
    /// Entry with no failed attempts
    pub fn new(kind: ArtifactKind, keys: Vec<String>, discovered_at_ms: u64) -> Self {
        Self {
            keys,
            kind,
            discovered_at_ms,
            attempts: 0,
        }
    }
}

/// Document stored at a record key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Last finalized payload
    pub committed: Payload,
    /// Commit in flight or awaiting finalize
    #[serde(default)]
    pub pending: Option<PendingTransaction>,
    /// Migration version of `committed`
    #[serde(default)]
    pub migration_version: u32,
    /// Artifacts awaiting deletion
    #[serde(default)]
    pub orphans: Vec<OrphanEntry>,
}

impl StoredRecord {
    /// Document holding `value` inline with nothing pending
    pub fn inline(value: Value, migration_version: u32) -> Self {
        Self {
            committed: Payload::Inline(value),
            pending: None,
            migration_version,
            orphans: Vec::new(),
        }
    }

    /// JSON encoding written to the record store
    pub fn encode(&self) -> HoldfastResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(HoldfastError::from)
    }

    /// Parse a stored document
    pub fn decode(bytes: &[u8]) -> HoldfastResult<Self> {
        serde_json::from_slice(bytes).map_err(HoldfastError::from)
    }
}

/// Last value known to have durably committed
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedSnapshot {
    /// Committed value
    pub value: Value,
    /// Store version of the document, when known
    pub version: Option<Version>,
}

/// Key derivation for one named store
///
/// Every physical key is prefixed with the store name so several logical
/// stores can share one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    name: String,
}

impl Keyspace {
    /// Keyspace of the store `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the record document
    pub fn record_key(&self, key: &str) -> String {
        format!("{}/records/{key}", self.name)
    }

    /// Key of the lease guarding `key`
    pub fn lease_key(&self, key: &str) -> String {
        format!("{}/locks/{key}", self.name)
    }

    /// Key of the transaction marker
    pub fn marker_key(&self, tx_id: &TxId) -> String {
        format!("{}/tx/{tx_id}", self.name)
    }

    /// Key of one payload shard
    pub fn shard_key(&self, key: &str, tx_id: &TxId, index: usize) -> String {
        format!("{}/shards/{key}/{tx_id}/{index}", self.name)
    }

    /// Shard key for part of a patch too large to sit in the document
    pub fn patch_shard_key(&self, key: &str, tx_id: &TxId, index: usize) -> String {
        format!("{}/patches/{key}/{tx_id}/{index}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stored_record_round_trips_through_json() {
        let record = StoredRecord {
            committed: Payload::Inline(Value::from(json!({"coins": 1}))),
            pending: Some(PendingTransaction::inline(TxId::new(), Patch::new(), Some(3))),
            migration_version: 2,
            orphans: vec![OrphanEntry::new(ArtifactKind::Marker, vec!["m".into()], 5)],
        };
        let bytes = record.encode().unwrap();
        assert_eq!(StoredRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn spilled_patch_lists_its_shards() {
        let pending = PendingTransaction {
            tx_id: TxId::new(),
            patch: None,
            patch_shards: Some(ShardManifest {
                shard_keys: vec!["p/0".into(), "p/1".into()],
                total_bytes: 10,
            }),
            migration_version: None,
        };
        assert_eq!(pending.patch_shard_keys(), ["p/0", "p/1"]);
        let inline = PendingTransaction::inline(TxId::new(), Patch::new(), None);
        assert!(inline.patch_shard_keys().is_empty());

        // Inline references keep the document format unchanged
        let bytes = serde_json::to_vec(&inline).unwrap();
        assert!(!String::from_utf8(bytes).unwrap().contains("patch_shards"));
    }

    #[test]
    fn missing_optional_fields_default() {
        let bytes = br#"{"committed":{"kind":"inline","data":{"a":1}}}"#;
        let record = StoredRecord::decode(bytes).unwrap();
        assert_eq!(record.pending, None);
        assert_eq!(record.migration_version, 0);
        assert!(record.orphans.is_empty());
    }

    #[test]
    fn marker_state_follows_presence() {
        assert_eq!(MarkerState::from_entry(None), MarkerState::Committed);
        assert_eq!(
            MarkerState::from_entry(Some(MarkerState::PENDING_SENTINEL)),
            MarkerState::Pending
        );
    }

    #[test]
    fn keyspace_prefixes_every_key() {
        let ks = Keyspace::new("players");
        let tx = TxId::new();
        assert_eq!(ks.record_key("u1"), "players/records/u1");
        assert_eq!(ks.lease_key("u1"), "players/locks/u1");
        assert!(ks.marker_key(&tx).starts_with("players/tx/"));
        assert!(ks.shard_key("u1", &tx, 3).ends_with("/3"));
        assert!(ks.patch_shard_key("u1", &tx, 0).starts_with("players/patches/u1/"));
    }
}
