//! # Holdfast Testkit - Test Infrastructure
//!
//! Shared fixtures for holdfast tests:
//!
//! - [`faults`]: store wrappers that inject throttling, timeouts and fatal
//!   errors on chosen operations and keys
//! - [`clock`]: a clock driven by the tokio timer for paused-time tests
//! - [`fixtures`]: in-memory backends and a player record context
//! - [`logging`]: one-shot `tracing` subscriber setup
//!
//! ```toml
//! [dev-dependencies]
//! holdfast-testkit = { path = "../holdfast-testkit" }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod faults;
pub mod fixtures;
pub mod logging;

pub use clock::TokioClock;
pub use faults::{FaultInjector, FaultKind, FaultRule, FaultyLeaseMap, FaultyRecordStore, StoreOp};
pub use fixtures::{
    player_builder, player_context, player_schema, player_template, TestStores, PLAYERS,
};
pub use logging::init_tracing;
