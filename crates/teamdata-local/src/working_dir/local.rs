use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use teamdata_core::{
    BackupLocator, CollectionStrategy, LockFailure, LockMessageHandler, Result, WorkingDirectory,
};
use tracing::{info, instrument};
use walkdir::WalkDir;

use super::{WorkingDirectoryBase, WorkingDirectoryOptions};
use crate::concurrency_lock::FileConcurrencyLock;

/// A working directory that edits the target directory in place.
///
/// The staging folder only hosts the process lock; the write lock is a lock
/// file inside the target, and is refused when any member file is read-only.
#[derive(Debug)]
pub struct LocalWorkingDirectory {
    base: WorkingDirectoryBase,
    target: PathBuf,
    write_lock: FileConcurrencyLock,
}

impl LocalWorkingDirectory {
    pub fn new(
        target: impl Into<PathBuf>,
        strategy: Arc<dyn CollectionStrategy>,
        options: &WorkingDirectoryOptions,
    ) -> Self {
        let target = target.into();
        let base = WorkingDirectoryBase::new(&target.to_string_lossy(), strategy.clone(), options);

        let approve_dir = target.clone();
        let write_lock = FileConcurrencyLock::new(target.join(strategy.lock_filename()))
            .with_approver(Arc::new(move || check_writable(&approve_dir, strategy.as_ref())));

        Self {
            base,
            target,
            write_lock,
        }
    }

    pub fn base(&self) -> &WorkingDirectoryBase {
        &self.base
    }
}

/// Fail with `ReadOnly` when the directory or any member file is read-only.
fn check_writable(dir: &Path, strategy: &dyn CollectionStrategy) -> Result<()> {
    if let Ok(meta) = std::fs::metadata(dir) {
        if meta.permissions().readonly() {
            return Err(LockFailure::ReadOnly {
                path: dir.display().to_string(),
            }
            .into());
        }
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = rel.to_string_lossy().replace('\\', "/");
        if !strategy.includes(&name) {
            continue;
        }
        let readonly = entry
            .metadata()
            .map(|m| m.permissions().readonly())
            .unwrap_or(false);
        if readonly {
            return Err(LockFailure::ReadOnly { path: name }.into());
        }
    }
    Ok(())
}

#[async_trait]
impl WorkingDirectory for LocalWorkingDirectory {
    fn description(&self) -> String {
        self.target.display().to_string()
    }

    fn target_location(&self) -> String {
        self.target.display().to_string()
    }

    fn directory(&self) -> PathBuf {
        self.target.clone()
    }

    async fn metadata(&self, name: &str) -> Result<Option<String>> {
        self.base.metadata().get(name).await
    }

    async fn set_metadata(&self, name: &str, value: Option<&str>) -> Result<()> {
        self.base.metadata().set(name, value).await
    }

    async fn acquire_process_lock(
        &self,
        message: Option<&str>,
        handler: Option<Arc<dyn LockMessageHandler>>,
    ) -> Result<()> {
        self.base.acquire_process_lock(message, handler).await
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self, handler), level = "debug", fields(target = %self.target.display()))]
    async fn acquire_write_lock(
        &self,
        handler: Option<Arc<dyn LockMessageHandler>>,
        owner: &str,
    ) -> Result<()> {
        self.write_lock.acquire(None, handler, Some(owner)).await?;
        info!("{} acquired write lock on {}", owner, self.target.display());
        Ok(())
    }

    async fn assert_write_lock(&self) -> Result<()> {
        self.write_lock.assert_valid().await
    }

    async fn release_write_lock(&self) {
        self.write_lock.release().await;
    }

    async fn flush_data(&self) -> Result<bool> {
        // edits already live in the target
        Ok(false)
    }

    async fn do_backup(&self, qualifier: &str) -> Result<BackupLocator> {
        let path = self.base.backup_handler(&self.target).backup(qualifier).await?;
        Ok(BackupLocator::File(path))
    }

    async fn release_locks(&self) {
        self.write_lock.release().await;
        self.base.release_process_lock().await;
        self.base.remove_working_dir_if_empty().await;
    }
}
