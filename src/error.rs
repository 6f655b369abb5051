//! Error types for `queue-index`.

use std::path::PathBuf;

/// Result type for queue-index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors returned by the `queue-index` crate.
///
/// Corrupt journal/segment records and missing segment files are *not*
/// errors: parsers keep the valid prefix and a missing file reads as an
/// empty segment. What propagates is the fatal stuff: I/O failures on open
/// handles, unreadable recovery-terms payloads, and illegal state
/// transitions surfaced in release builds (debug builds panic instead).
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// I/O error on an open journal/segment handle. The owning queue is
    /// expected to crash and rely on recovery at the next start.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing the index itself wrote is unreadable in a context where
    /// stopping at the corruption is not allowed.
    #[error("format error: {0}")]
    Format(String),

    /// Recovery-terms encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Recovery-terms decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Illegal lifecycle transition (duplicate publish, ack of an
    /// unpublished sequence id, operation after terminate).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not supported by the storage backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Lock acquisition failed (concurrent access conflict).
    #[error("lock failed on {resource}: {reason}")]
    LockFailed {
        /// What we were trying to lock.
        resource: String,
        /// Human-readable reason (poisoned lock, OS error, etc.).
        reason: String,
    },

    /// Resource not found (file/queue directory/etc).
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested path does not exist.
    #[error("missing path: {0}")]
    MissingPath(PathBuf),
}
