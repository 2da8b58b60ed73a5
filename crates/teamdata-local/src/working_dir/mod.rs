mod compressed;
mod local;

pub use compressed::{CompressedWorkingDirectory, OBFUSCATED_EXTENSION};
pub use local::LocalWorkingDirectory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use teamdata_core::{
    CollectionStrategy, LockFailure, LockMessageHandler, Result, BACKUP_DIR_NAME,
    METADATA_DIR_NAME, PROCESS_LOCK_FILENAME,
};
use tokio::fs;
use tracing::{debug, instrument};

use crate::backup::DirectoryBackup;
use crate::concurrency_lock::FileConcurrencyLock;
use crate::identity::working_directory_id;
use crate::metadata::MetadataStore;

/// Settings shared by every working directory.
#[derive(Debug, Clone)]
pub struct WorkingDirectoryOptions {
    /// Parent of the per-location staging folders.
    pub working_dir_parent: PathBuf,
    /// When false, process locks are never taken.
    pub process_lock_enabled: bool,
}

impl WorkingDirectoryOptions {
    pub fn new(working_dir_parent: impl Into<PathBuf>) -> Self {
        Self {
            working_dir_parent: working_dir_parent.into(),
            process_lock_enabled: true,
        }
    }
}

/// State common to all working directory variants: the staging folder keyed
/// by location and purpose, its process lock and its metadata.
#[derive(Debug)]
pub struct WorkingDirectoryBase {
    target: String,
    strategy: Arc<dyn CollectionStrategy>,
    working_dir: PathBuf,
    process_lock: FileConcurrencyLock,
    process_lock_enabled: bool,
    metadata: MetadataStore,
}

impl WorkingDirectoryBase {
    pub fn new(
        target: &str,
        strategy: Arc<dyn CollectionStrategy>,
        options: &WorkingDirectoryOptions,
    ) -> Self {
        let id = format!(
            "{}-{}",
            strategy.purpose().as_str(),
            working_directory_id(target)
        );
        let working_dir = options.working_dir_parent.join(id);
        Self {
            target: target.to_string(),
            strategy,
            process_lock: FileConcurrencyLock::new(working_dir.join(PROCESS_LOCK_FILENAME)),
            process_lock_enabled: options.process_lock_enabled,
            metadata: MetadataStore::new(working_dir.join(METADATA_DIR_NAME)),
            working_dir,
        }
    }

    /// The target path or URL this working directory stands for.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn strategy(&self) -> &Arc<dyn CollectionStrategy> {
        &self.strategy
    }

    /// The private staging folder.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    #[instrument(skip(self, handler), level = "debug", fields(target = %self.target))]
    pub async fn acquire_process_lock(
        &self,
        message: Option<&str>,
        handler: Option<Arc<dyn LockMessageHandler>>,
    ) -> Result<()> {
        fs::create_dir_all(&self.working_dir).await.map_err(|e| {
            LockFailure::CannotCreate(format!("{}: {}", self.working_dir.display(), e))
        })?;

        if !self.process_lock_enabled {
            debug!("Process locking disabled, skipping");
            return Ok(());
        }
        self.process_lock.acquire(message, handler, None).await
    }

    /// Whether the process lock is held (always true when locking is disabled).
    pub async fn has_process_lock(&self) -> bool {
        !self.process_lock_enabled || self.process_lock.is_held().await
    }

    pub async fn assert_process_lock(&self) -> Result<()> {
        if !self.process_lock_enabled {
            return Ok(());
        }
        self.process_lock.assert_valid().await
    }

    pub async fn release_process_lock(&self) {
        self.process_lock.release().await;
    }

    /// Delete the staging folder if it holds nothing but empty metadata.
    pub async fn remove_working_dir_if_empty(&self) {
        self.metadata.remove_if_empty().await;
        if fs::remove_dir(&self.working_dir).await.is_ok() {
            debug!("Removed empty working dir {}", self.working_dir.display());
        }
    }

    /// Backups of `source` written to its `backup` subfolder.
    pub fn backup_handler(&self, source: &Path) -> DirectoryBackup {
        DirectoryBackup::new(source, source.join(BACKUP_DIR_NAME), self.strategy.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamdata_core::{DashboardStrategy, TeamDataStrategy};
    use tempfile::TempDir;

    #[test]
    fn test_staging_folder_is_keyed_by_location_and_purpose() {
        let temp_dir = TempDir::new().unwrap();
        let options = WorkingDirectoryOptions::new(temp_dir.path());

        let a = WorkingDirectoryBase::new(
            "https://server/DataBridge/abc",
            Arc::new(DashboardStrategy),
            &options,
        );
        let b = WorkingDirectoryBase::new(
            "http://server/DataBridge/abc",
            Arc::new(DashboardStrategy),
            &options,
        );
        let c = WorkingDirectoryBase::new(
            "http://server/DataBridge/abc",
            Arc::new(TeamDataStrategy),
            &options,
        );

        assert_eq!(a.working_dir(), b.working_dir());
        assert_ne!(a.working_dir(), c.working_dir());
        assert!(a.working_dir().starts_with(temp_dir.path()));
    }

    #[tokio::test]
    async fn test_disabled_process_lock() {
        let temp_dir = TempDir::new().unwrap();
        let mut options = WorkingDirectoryOptions::new(temp_dir.path());
        options.process_lock_enabled = false;

        let first = WorkingDirectoryBase::new("/data/x", Arc::new(DashboardStrategy), &options);
        let second = WorkingDirectoryBase::new("/data/x", Arc::new(DashboardStrategy), &options);
        first.acquire_process_lock(None, None).await.unwrap();
        second.acquire_process_lock(None, None).await.unwrap();
        assert!(first.has_process_lock().await);
        assert!(!first.working_dir().join(PROCESS_LOCK_FILENAME).exists());
    }
}
