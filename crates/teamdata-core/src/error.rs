use thiserror::Error;

/// Ways in which a process lock or write lock can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockFailure {
    /// Someone else holds the lock. `holder` identifies them when known.
    #[error("already locked by {}", .holder.as_deref().unwrap_or("another owner"))]
    AlreadyLocked { holder: Option<String> },

    /// A locked operation was attempted without holding the lock.
    #[error("the lock is not held")]
    NotLocked,

    /// The lock could not be verified; it may or may not still be held.
    #[error("lock state is uncertain: {0}")]
    Uncertain(String),

    /// Local filesystem permissions prevent locking.
    #[error("cannot lock read-only files: {path}")]
    ReadOnly { path: String },

    /// The server refused to lock a read-only URL.
    #[error("the server collection is read-only")]
    ReadOnlyUrl,

    /// Contention was resolved by relaying a message to the current holder.
    #[error("lock message was delivered to the current holder")]
    SentMessage { response: Option<String> },

    /// The lock file could not be created.
    #[error("unable to create lock: {0}")]
    CannotCreate(String),

    /// Any other lock failure reported by a server.
    #[error("lock failure: {0}")]
    Other(String),
}

/// Errors produced by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Lock(#[from] LockFailure),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl SyncError {
    /// The lock failure carried by this error, if any.
    pub fn lock_failure(&self) -> Option<&LockFailure> {
        match self {
            SyncError::Lock(failure) => Some(failure),
            _ => None,
        }
    }

    /// Network and disk failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Io(_) | SyncError::Http(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
