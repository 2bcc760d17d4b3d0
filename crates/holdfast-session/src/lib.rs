//! # Holdfast Session - Domain Layer
//!
//! **Purpose**: Lease locks, the transaction marker protocol and record
//! sessions on top of the effect traits from `holdfast-core`.
//!
//! # Architecture Constraints
//!
//! - YES Lock, commit and recovery orchestration
//! - YES Cancellable background tasks owned by their lock or session
//! - YES Depends only on effect traits; handlers are injected via
//!   [`SessionContext`]
//! - NO concrete store clients (use `holdfast-effects`)
//! - NO process-wide state
//!
//! # Usage
//!
//! ```rust,ignore
//! let ctx = SessionContext::builder("players", stores)
//!     .template(json!({"coins": 0, "inventory": {}}))
//!     .schema(|v| v.get("coins").and_then(Value::as_i64).is_some())
//!     .build()?;
//! let store = SessionStore::new(ctx);
//!
//! let session = store.load("user-1").await?;
//! session.update(|data| { data.insert("coins", 10); }).await?;
//! session.save().await?;
//! session.unload().await?;
//! ```

#![forbid(unsafe_code)]

/// Session context and injected dependencies
pub mod context;
/// Distributed lease lock
pub mod lock;
/// Orphaned artifact queue
pub mod orphan;
/// Record sessions
pub mod session;
/// Payload sharding
pub mod shard;
/// Session store façade
pub mod store;
/// Cancellable background tasks
pub mod tasks;
/// Transaction markers and committed-state resolution
pub mod transaction;

pub use context::{
    ChangedCallback, MigrationStep, SchemaFn, SessionContext, SessionContextBuilder, StoreHandles,
};
pub use lock::{DistributedLock, LockError, LockHandle, LockStatus};
pub use orphan::{Cleanup, OrphanQueue};
pub use session::{Session, SessionPhase};
pub use shard::{EncodedPayload, ShardCodec};
pub use store::SessionStore;
pub use tasks::{BackgroundTask, Tick};
pub use transaction::{ResolvedRead, TransactionReader};
