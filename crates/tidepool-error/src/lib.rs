//! Error type shared by every tidepool crate.
//!
//! One enum, structured variants for the cases callers are expected to match
//! on, context fields for the rest. `TxRestart` deserves a special note: it is
//! not a failure but the contract telling the caller to re-issue the
//! transaction with a fresh epoch, so it must never be logged at error level.

use thiserror::Error;

/// Primary error type for tidepool operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A caller-supplied argument is malformed or out of range.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// The addressed record, key, object or container does not exist.
    #[error("not found")]
    NotFound,

    /// The record being created already exists.
    #[error("already exists")]
    Exists,

    /// Volatile memory allocation failed.
    #[error("out of memory")]
    NoMemory,

    /// The persistent heap has no space left for the request.
    #[error("no space left in pool: requested {requested} bytes")]
    NoSpace { requested: u64 },

    /// The resource is held by someone else; retry later.
    #[error("resource busy")]
    Busy,

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-media metadata failed validation.
    #[error("corrupted pool metadata: {detail}")]
    Corrupt { detail: String },

    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timedout,

    /// Client and server environment settings disagree.
    #[error("incompatible agent configuration: {detail}")]
    AgentIncompat { detail: String },

    /// Remote clock offset exceeds the configured epsilon.
    #[error("remote HLC ahead by {offset_ns} ns, beyond the synchronization bound")]
    HlcSync { offset_ns: u64 },

    /// The transaction must be re-issued with a fresh epoch.
    ///
    /// This is the normal concurrency-control signal, not a failure.
    #[error("transaction restart required")]
    TxRestart,

    /// The transaction target is blocked by another in-flight transaction.
    #[error("transaction busy")]
    TxBusy,

    /// The operation is still running; poll again.
    #[error("operation in progress")]
    InProgress,

    /// The caller may not perform this operation on the target.
    #[error("permission denied: {detail}")]
    NoPermission { detail: String },

    /// A counter or timestamp left its representable range.
    #[error("value out of representable range: {detail}")]
    Overflow { detail: String },

    /// Fewer bytes than required were available.
    #[error("truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The handle does not refer to a live object.
    #[error("stale or invalid handle")]
    NoHandle,

    /// No management system is reachable.
    #[error("no system available")]
    NoSystem,

    /// The requested interface has been retired.
    #[error("deprecated interface: {name}, use {replacement}")]
    Deprecated { name: String, replacement: String },
}

impl StoreError {
    /// `true` when the caller is expected to retry with a fresh epoch.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        matches!(self, StoreError::TxRestart)
    }

    /// Shorthand constructor for [`StoreError::InvalidArgument`].
    pub fn invalid(detail: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// Shorthand constructor for [`StoreError::Corrupt`].
    pub fn corrupt(detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            detail: detail.into(),
        }
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, StoreError>;
