//! Effect trait definitions
//!
//! Pure interfaces for every side effect the session layer performs. This
//! module defines **what** can be done; `holdfast-effects` and
//! `holdfast-testkit` provide handlers that define **how**.
//!
//! - **Store**: versioned record store and TTL lease map
//! - **Time**: wall clock and sleep
//! - **Reliability**: retry classification and bounded backoff
//!
//! Session code is parameterized by these traits and receives concrete
//! handlers through its context, never through process-wide state.

pub mod reliability;
pub mod store;
pub mod time;

pub use reliability::{BackoffStrategy, RetryClass, RetryClassify, RetryError, RetryPolicy};
pub use store::{
    Conditional, ConditionalFn, ConditionalOutcome, LeaseMapEffects, RecordStoreEffects,
    StoreError, Version, Versioned,
};
pub use time::PhysicalTimeEffects;
