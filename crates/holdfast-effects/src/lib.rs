//! # Holdfast Effects - Handlers
//!
//! Stateless and in-memory implementations of the effect traits defined in
//! `holdfast-core`:
//!
//! - [`MemoryRecordStore`]: versioned byte store with a per-entry size limit
//! - [`MemoryLeaseMap`]: TTL map whose expiry follows an injected clock
//! - [`RealTimeHandler`]: system clock and tokio sleep
//!
//! Remote-service clients implement the same traits outside this workspace.

#![forbid(unsafe_code)]

pub mod storage;
pub mod time;

pub use storage::{MemoryLeaseMap, MemoryRecordStore};
pub use time::RealTimeHandler;
