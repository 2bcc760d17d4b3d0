//! Remote record store and TTL lease map interfaces
//!
//! # Effect Classification
//!
//! - **Category**: Infrastructure Effect
//! - **Implementation**: `holdfast-effects` (in-memory), remote clients elsewhere
//! - **Usage**: session commit protocol, transaction markers, shards, leases
//!
//! Both stores are plain byte stores. The only atomic primitive is
//! `update_conditional`, which re-reads the current entry and applies the
//! caller's decision without interleaving another writer. Nothing else is
//! transactional.

use super::reliability::{RetryClass, RetryClassify};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque per-key version token assigned by the store on every write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A stored value with its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Stored bytes
    pub value: Vec<u8>,
    /// Version assigned by the write that stored them
    pub version: Version,
}

/// Decision returned by an `update_conditional` callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional {
    /// Leave the entry untouched
    Abort,
    /// Replace the entry
    Put(Vec<u8>),
    /// Delete the entry
    Remove,
}

/// Outcome of an `update_conditional` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOutcome {
    /// The callback aborted; nothing was written
    Aborted,
    /// The entry was written at this version
    Written(Version),
    /// The entry was deleted (or was already absent)
    Removed,
}

/// Callback deciding a conditional update from the current entry
pub type ConditionalFn<'a> = dyn Fn(Option<&[u8]>) -> Conditional + Send + Sync + 'a;

/// Errors reported by a remote store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    /// Request rejected by the shared rate budget
    #[error("request throttled for {key}")]
    Throttled { key: String },

    /// Request timed out; it may or may not have been applied
    #[error("request timed out for {key}")]
    Timeout { key: String },

    /// Backend temporarily unreachable
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// A conditional write lost a race with another writer
    #[error("conflicting write on {key}")]
    Conflict { key: String },

    /// Value exceeds the per-key size limit
    #[error("payload of {size} bytes for {key} exceeds limit of {limit}")]
    PayloadTooLarge { key: String, size: usize, limit: usize },

    /// Key rejected by the backend
    #[error("invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Any other non-retryable backend failure
    #[error("backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Throttling on `key`
    pub fn throttled(key: impl Into<String>) -> Self {
        Self::Throttled { key: key.into() }
    }

    /// Timed-out call on `key`; it may still have applied
    pub fn timeout(key: impl Into<String>) -> Self {
        Self::Timeout { key: key.into() }
    }

    /// Backend temporarily unreachable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Non-retryable backend failure
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

impl RetryClassify for StoreError {
    fn retry_class(&self) -> RetryClass {
        match self {
            Self::Throttled { .. }
            | Self::Timeout { .. }
            | Self::Unavailable { .. }
            | Self::Conflict { .. } => RetryClass::Retryable,
            Self::PayloadTooLarge { .. } | Self::InvalidKey { .. } | Self::Backend { .. } => {
                RetryClass::Fatal
            }
        }
    }
}

/// Versioned key-value store holding records, shards and transaction markers
#[async_trait]
pub trait RecordStoreEffects: Send + Sync {
    /// Read an entry
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditionally write an entry
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<Version, StoreError>;

    /// Atomically re-read an entry and apply the callback's decision
    async fn update_conditional(
        &self,
        key: &str,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError>;

    /// Delete an entry; returns whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

/// Map of short-lived entries whose expiry is enforced by the backend
#[async_trait]
pub trait LeaseMapEffects: Send + Sync {
    /// Read a live entry; expired entries read as absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write an entry that expires after `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Delete an entry; returns whether a live entry existed
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically re-read the live entry and apply the callback's decision.
    /// A `Put` refreshes the expiry to `ttl` from now.
    async fn update_conditional(
        &self,
        key: &str,
        ttl: Duration,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError>;
}

#[async_trait]
impl<T: RecordStoreEffects + ?Sized> RecordStoreEffects for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<Version, StoreError> {
        (**self).set(key, value).await
    }

    async fn update_conditional(
        &self,
        key: &str,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError> {
        (**self).update_conditional(key, update).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        (**self).remove(key).await
    }
}

#[async_trait]
impl<T: LeaseMapEffects + ?Sized> LeaseMapEffects for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        (**self).remove(key).await
    }

    async fn update_conditional(
        &self,
        key: &str,
        ttl: Duration,
        update: &ConditionalFn<'_>,
    ) -> Result<ConditionalOutcome, StoreError> {
        (**self).update_conditional(key, ttl, update).await
    }
}
