//! In-memory session state

use crate::orphan::OrphanQueue;
use holdfast_core::{CommittedSnapshot, Payload, TxId, Value};

/// Lifecycle of a session
///
/// `Loading → Active ⇄ Saving → Closing → Closed`. Lock loss moves an
/// active or saving session straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Lock held, record being read
    Loading,
    /// Open; no commit running
    Active,
    /// Open; a commit is running
    Saving,
    /// Unloading
    Closing,
    /// Lock released or lost; terminal
    Closed,
}

impl SessionPhase {
    /// Whether callers may still read, mutate and save
    pub fn is_open(self) -> bool {
        matches!(self, SessionPhase::Active | SessionPhase::Saving)
    }
}

/// A transaction past its commit point whose document still holds the
/// pre-commit payload and the pending reference
#[derive(Debug, Clone)]
pub(crate) struct Unfinalized {
    pub tx_id: TxId,
    pub value: Value,
    pub migration_version: u32,
    /// Shards of a spilled patch, garbage once the document is finalized
    pub spilled_patch: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub phase: SessionPhase,
    /// Working copy seen by `get()` and mutated by `update()`
    pub current: Value,
    /// Last durably committed value; the base of the next diff
    pub committed: CommittedSnapshot,
    /// Payload currently referenced by the stored document
    pub payload: Payload,
    /// Migration version of `payload`
    pub payload_migration_version: u32,
    pub revision: u64,
    pub saved_revision: u64,
    /// Whether a change callback has fired since load
    pub notified: bool,
    pub unfinalized: Option<Unfinalized>,
    pub orphans: OrphanQueue,
}

impl SessionState {
    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    pub fn is_saved(&self) -> bool {
        !self.is_dirty() && self.unfinalized.is_none()
    }
}
