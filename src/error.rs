//! Error types for the view computation cache.

use std::io;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the view computation cache.
///
/// Absence is never an error: a key without an id, or an id without a
/// payload, is reported as `Ok(None)`.
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier allocation errors.
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Binary store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Value codec errors.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote server answered with a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// The backend does not offer this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Identifier allocation errors.
///
/// Any of these means no id was handed out for the key.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// The mapping could not be durably recorded.
    #[error("failed to record mapping: {0}")]
    WriteFailed(String),

    /// The stored mapping is unreadable.
    #[error("corrupt mapping: {0}")]
    Corrupt(String),

    /// The id space is exhausted.
    #[error("identifier space exhausted")]
    Exhausted,

    /// The remote allocator returned a response that does not match the request.
    #[error("lookup response mismatch: expected {expected} ids, got {actual}")]
    ResponseMismatch { expected: usize, actual: usize },
}

/// Binary store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store has been deleted.
    #[error("store deleted: {0}")]
    Deleted(String),

    /// RocksDB backend error.
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(feature = "rocksdb-storage")]
impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Store(StoreError::RocksDb(e.into_string()))
    }
}
