//! Purge queue error types

use thiserror::Error;

/// Purge queue error
#[derive(Error, Debug)]
pub enum PurgeError {
    /// Journal I/O or format failure
    #[error("Journal error: {0}")]
    Journal(String),

    /// No journal exists yet
    #[error("Journal not found")]
    JournalNotFound,

    /// Push attempted before the queue was opened
    #[error("Purge queue is read-only")]
    ReadOnly,

    /// A readable waiter is already registered on the journal
    #[error("Journal already has a readable waiter")]
    WaiterBusy,

    /// The queue or journal has been shut down
    #[error("Purge queue is shut down")]
    ShutDown,

    /// `open` or `create` called on a queue that already has its journal
    #[error("Purge queue already opened")]
    AlreadyOpen,

    /// A pushed item cannot be executed
    #[error("Invalid purge item: {0}")]
    InvalidItem(String),

    /// `init` called twice
    #[error("Purge queue already initialized")]
    AlreadyInitialized,

    /// Operation requires `init` first
    #[error("Purge queue not initialized")]
    NotInitialized,

    /// Backend object operation failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// A queue entry could not be decoded
    #[error("Corrupt entry ending at {position:#x}: {source}")]
    Corrupt {
        position: u64,
        #[source]
        source: reclaim_common::Error,
    },

    /// Error from the common layer
    #[error(transparent)]
    Common(#[from] reclaim_common::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for purge queue operations
pub type PurgeResult<T> = Result<T, PurgeError>;

impl PurgeError {
    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
