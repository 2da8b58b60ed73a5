use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::lock::LockMessageHandler;

/// Where a backup produced by [`WorkingDirectory::do_backup`] can be retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupLocator {
    File(PathBuf),
    Url(String),
}

impl fmt::Display for BackupLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupLocator::File(path) => write!(f, "{}", path.display()),
            BackupLocator::Url(url) => f.write_str(url),
        }
    }
}

/// A local copy of a collection that one process edits under lock.
///
/// Typical session: `acquire_process_lock` -> `prepare` -> optionally
/// `acquire_write_lock`, edit files in `directory()`, `flush_data` ->
/// `release_locks`.
#[async_trait]
pub trait WorkingDirectory: Send + Sync {
    /// Human-readable name of the target (path or URL).
    fn description(&self) -> String;

    /// The location this working directory was opened for (path or URL).
    fn target_location(&self) -> String;

    /// The directory callers read and write.
    fn directory(&self) -> PathBuf;

    /// A value stored alongside the working copy, surviving restarts.
    async fn metadata(&self, name: &str) -> Result<Option<String>>;

    /// Store or, with `None`, remove a metadata value.
    async fn set_metadata(&self, name: &str, value: Option<&str>) -> Result<()>;

    /// Take the exclusive process lock on the staging area.
    ///
    /// When the lock is held elsewhere and `message` is given, the message is
    /// relayed to the holder and `LockFailure::SentMessage` is returned.
    async fn acquire_process_lock(
        &self,
        message: Option<&str>,
        handler: Option<Arc<dyn LockMessageHandler>>,
    ) -> Result<()>;

    /// Make the working copy ready for reading. Idempotent.
    async fn prepare(&self) -> Result<()>;

    /// Refresh a read-only working copy from its source.
    async fn update(&self) -> Result<()>;

    /// Obtain exclusive write permission for `owner`.
    async fn acquire_write_lock(
        &self,
        handler: Option<Arc<dyn LockMessageHandler>>,
        owner: &str,
    ) -> Result<()>;

    /// Fail unless the write lock is still held.
    async fn assert_write_lock(&self) -> Result<()>;

    /// Release the write lock only. Never fails.
    async fn release_write_lock(&self);

    /// Push local changes to their durable destination.
    ///
    /// Returns whether anything was pushed.
    async fn flush_data(&self) -> Result<bool>;

    /// Archive the current contents under `qualifier` (e.g. "startup").
    async fn do_backup(&self, qualifier: &str) -> Result<BackupLocator>;

    /// Release the write lock, then the process lock, then clean up.
    ///
    /// Safe to call more than once. Never fails.
    async fn release_locks(&self);
}
