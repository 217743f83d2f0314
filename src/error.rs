//! Crate-wide error type.
//!
//! Every fallible operation in `roltdb` returns [`Result<T>`]. I/O errors
//! from the underlying file are fatal for the enclosing transaction and
//! propagate as [`RoltError::Io`]; corruption detected in a meta page, a
//! WAL record, or a node header is reported as [`RoltError::Corruption`]
//! and never silently repaired. `get`/cursor misses are not errors at all
//! -- they surface as `Option::None`, per spec.

use std::fmt;

pub type Result<T> = std::result::Result<T, RoltError>;

#[derive(thiserror::Error, Debug)]
pub enum RoltError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a writable transaction is already in progress")]
    TxConflict,

    #[error("transaction handle is no longer valid")]
    TxNotValid,

    #[error("bucket {0} not found")]
    BucketNotFound(DebugBytes),

    #[error("bucket {0} already exists")]
    BucketExists(DebugBytes),

    #[error("key already exists")]
    KeyExists,

    #[error("key or value exceeds the configured size limit")]
    KeyValueTooLarge,

    #[error("database was opened read-only")]
    ReadOnly,

    #[error("value at this key is not a bucket")]
    IncompatibleValue,
}

/// Wraps a byte sequence so it can be embedded in an error message without
/// forcing callers to pick a lossy `String` conversion themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugBytes(pub Vec<u8>);

impl fmt::Display for DebugBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&[u8]> for DebugBytes {
    fn from(s: &[u8]) -> Self {
        DebugBytes(s.to_vec())
    }
}
