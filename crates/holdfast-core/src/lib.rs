//! # Holdfast Core - Foundation
//!
//! **Purpose**: Value model, structural reconcile/diff, persistent domain
//! types, effect traits and the retry policy shared by every holdfast crate.
//!
//! # Architecture Constraints
//!
//! - YES Pure functions over record values (reconcile, diff, patch)
//! - YES Effect trait definitions (record store, lease map, time)
//! - YES Retry classification and bounded backoff
//! - NO effect handler implementations (use `holdfast-effects`)
//! - NO lock or session orchestration (that's `holdfast-session`)

#![forbid(unsafe_code)]

/// Runtime configuration
pub mod config;

/// Effect trait definitions
pub mod effects;

/// Unified error type
pub mod errors;

/// Patches and patch application
pub mod patch;

/// Structural reconcile, template application and diff
pub mod reconcile;

/// Persistent domain types
pub mod types;

/// Persistent record values
pub mod value;

pub use config::{HoldfastConfig, LockConfig, SessionConfig};
pub use effects::{
    LeaseMapEffects, PhysicalTimeEffects, RecordStoreEffects, RetryPolicy, StoreError,
};
pub use errors::{HoldfastError, HoldfastResult};
pub use patch::{Patch, PatchError, PatchOp};
pub use reconcile::{apply_template, diff, reconcile, Reconciled};
pub use types::{
    ArtifactKind, CommittedSnapshot, Keyspace, LockLease, MarkerState, OrphanEntry, OwnerId,
    Payload, PendingTransaction, ShardManifest, StoredRecord, TxId,
};
pub use value::{Map, Value};
