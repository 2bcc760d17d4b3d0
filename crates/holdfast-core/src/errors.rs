//! Unified error type for holdfast operations
//!
//! Backend failures are described by [`StoreError`]; everything a session
//! caller can observe is a [`HoldfastError`]. Transient store failures never
//! reach callers directly: the retry layer absorbs them and only an exhausted
//! budget surfaces, as [`HoldfastError::StoreTransient`].

use crate::effects::reliability::RetryError;
use crate::effects::StoreError;
use crate::patch::PatchError;

/// Caller-facing error taxonomy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HoldfastError {
    /// The lease for this key is held by another owner; raised by a single
    /// acquisition attempt, while a load that waited reports `LockUnavailable`
    #[error("Busy: lock for {key} is held by another owner")]
    Busy {
        /// Record key
        key: String,
    },

    /// The session could not obtain its lock
    #[error("Lock unavailable for {key}: {reason}")]
    LockUnavailable {
        /// Record key
        key: String,
        /// Why acquisition gave up
        reason: String,
    },

    /// The session is closed (unloaded or lock lost)
    #[error("Session for {key} is closed")]
    SessionClosed {
        /// Record key
        key: String,
    },

    /// Caller-supplied data was rejected by the schema predicate
    #[error("Schema validation failed for {key}")]
    SchemaValidationFailed {
        /// Record key
        key: String,
    },

    /// Retryable store failure that outlived the retry budget
    #[error("Store call failed after {attempts} attempts (retries exhausted): {last}")]
    StoreTransient {
        /// Attempts performed, including the first
        attempts: u32,
        /// Last observed failure
        last: StoreError,
    },

    /// Non-retryable store failure
    #[error("Store error: {0}")]
    StoreFatal(StoreError),

    /// A committed transaction has no patch to apply; bookkeeping is corrupt
    #[error("Transaction {tx_id} committed but carries no patch")]
    CommitPendingWithoutPatch {
        /// Transaction id
        tx_id: String,
    },

    /// A stored document could not be encoded or decoded
    #[error("Codec error: {message}")]
    Codec {
        /// Error message describing the codec failure
        message: String,
    },

    /// A migration step failed or the stored data is newer than this build
    #[error("Migration '{step}' failed: {message}")]
    Migration {
        /// Step name
        step: String,
        /// Error message from the step
        message: String,
    },

    /// A stored patch does not apply to its committed base
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {message}")]
    Config {
        /// Error message describing the invalid setting
        message: String,
    },
}

impl HoldfastError {
    /// A single acquisition attempt found another owner's lease
    pub fn busy(key: impl Into<String>) -> Self {
        Self::Busy { key: key.into() }
    }

    /// Lock acquisition gave up
    pub fn lock_unavailable(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LockUnavailable {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The session for `key` is closed
    pub fn closed(key: impl Into<String>) -> Self {
        Self::SessionClosed { key: key.into() }
    }

    /// The schema predicate rejected a value for `key`
    pub fn schema_rejected(key: impl Into<String>) -> Self {
        Self::SchemaValidationFailed { key: key.into() }
    }

    /// Stored bytes could not be decoded
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Migration `step` failed
    pub fn migration(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Invalid configuration
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for errors after which the session can no longer be used
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionClosed { .. } | Self::LockUnavailable { .. }
        )
    }
}

impl From<RetryError<StoreError>> for HoldfastError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Fatal(e) => Self::StoreFatal(e),
            RetryError::Exhausted { attempts, last, .. } => Self::StoreTransient { attempts, last },
        }
    }
}

impl From<serde_json::Error> for HoldfastError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}

/// Standard result type for holdfast operations
pub type HoldfastResult<T> = Result<T, HoldfastError>;
