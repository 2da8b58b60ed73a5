/// Message posted to a handler when a previously held lock has been lost.
pub const LOCK_LOST_MESSAGE: &str = "lockWasLost";

/// A message delivered to the owner of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMessage {
    /// Description of the lock the message concerns (a path or URL).
    pub lock_source: String,
    pub message: String,
}

impl LockMessage {
    pub fn new(lock_source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            lock_source: lock_source.into(),
            message: message.into(),
        }
    }

    pub fn is_lock_lost(&self) -> bool {
        self.message == LOCK_LOST_MESSAGE
    }
}

/// Receives messages about a held lock.
///
/// Used both for notifications (lock lost) and for requests relayed from
/// other processes that want the lock; the returned text is sent back to
/// the requester.
pub trait LockMessageHandler: Send + Sync {
    fn handle_message(&self, message: &LockMessage) -> Option<String>;
}
