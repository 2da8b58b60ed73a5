use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use teamdata_core::{
    BackupLocator, CollectionStrategy, LockMessageHandler, NameFilter, PatternFilter, Purpose,
    Result, SyncError,
    WorkingDirectory, BACKUP_DIR_NAME, PROCESS_LOCK_FILENAME,
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{WorkingDirectoryBase, WorkingDirectoryOptions};
use crate::archive::{
    archive_entry_count, read_archive, replace_file, set_file_modified, xor_in_place,
    ArchiveBuilder,
};
use crate::file_collection::check_resource_name;

/// Archives with this extension are XOR-masked over the whole byte stream.
///
/// This is a file-format convention, not a security measure.
pub const OBFUSCATED_EXTENSION: &str = "pdash";
const XOR_MASK: u8 = 0x55;

static LOCK_FILES: LazyLock<Result<PatternFilter>> =
    LazyLock::new(|| PatternFilter::new(["*.lock"]));

/// A working directory whose target is a single zip archive.
///
/// `prepare` extracts the archive into a fresh temporary directory and
/// `flush_data` zips it back up, replacing the archive atomically. Editing is
/// single-user, so write-lock operations do nothing.
pub struct CompressedWorkingDirectory {
    base: WorkingDirectoryBase,
    archive: PathBuf,
    extracted: Mutex<Option<TempDir>>,
}

impl std::fmt::Debug for CompressedWorkingDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedWorkingDirectory")
            .field("archive", &self.archive)
            .finish()
    }
}

impl CompressedWorkingDirectory {
    /// Only personal datasets can be edited as archives.
    pub fn new(
        archive: impl Into<PathBuf>,
        strategy: Arc<dyn CollectionStrategy>,
        options: &WorkingDirectoryOptions,
    ) -> Result<Self> {
        if strategy.purpose() != Purpose::Dashboard {
            return Err(SyncError::Unsupported(format!(
                "Compressed working directories cannot hold {} data",
                strategy.purpose().as_str()
            )));
        }
        let archive = archive.into();
        Ok(Self {
            base: WorkingDirectoryBase::new(&archive.to_string_lossy(), strategy, options),
            archive,
            extracted: Mutex::new(None),
        })
    }

    pub fn base(&self) -> &WorkingDirectoryBase {
        &self.base
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    fn is_obfuscated(&self) -> bool {
        self.archive
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(OBFUSCATED_EXTENSION))
    }

    fn extracted_path(&self) -> Option<PathBuf> {
        self.extracted
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|d| d.path().to_path_buf()))
    }

    fn extract(archive: &Path, obfuscated: bool, dest: &Path) -> Result<usize> {
        let mut bytes = match std::fs::read(archive) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Archive {} does not exist yet", archive.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        if obfuscated {
            xor_in_place(&mut bytes, XOR_MASK);
        }

        let not_an_archive = || {
            SyncError::InvalidArchive(format!("{} is not a zip archive", archive.display()))
        };
        match archive_entry_count(&bytes) {
            Ok(0) | Err(SyncError::InvalidArchive(_)) => return Err(not_an_archive()),
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        let entries = read_archive(&bytes)?;
        for entry in &entries {
            check_resource_name(entry.name.trim_end_matches('/'))
                .map_err(|_| SyncError::InvalidArchive(format!("Bad entry '{}'", entry.name)))?;
            let path = dest.join(&entry.name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &entry.data)?;
            set_file_modified(&path, entry.modified)?;
        }
        Ok(entries.len())
    }

    fn is_excluded(name: &str, strategy: &dyn CollectionStrategy) -> bool {
        name.eq_ignore_ascii_case(strategy.lock_filename())
            || name.eq_ignore_ascii_case(PROCESS_LOCK_FILENAME)
            || LOCK_FILES.as_ref().is_ok_and(|files| files.matches(name))
            || name.starts_with(&format!("{}/", BACKUP_DIR_NAME))
    }

    /// Zip `source` into `archive`. Returns `None` when the archive already
    /// holds exactly these files and was left alone.
    fn compress(
        source: &Path,
        archive: &Path,
        obfuscated: bool,
        strategy: &dyn CollectionStrategy,
    ) -> Result<Option<usize>> {
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry.map_err(|e| SyncError::Io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(source) else {
                continue;
            };
            let name = rel.to_string_lossy().replace('\\', "/");
            if !Self::is_excluded(&name, strategy) {
                files.push((name, entry.path().to_path_buf()));
            }
        }
        files.sort();

        let mut builder = ArchiveBuilder::new();
        for (name, path) in &files {
            builder.add_file(name, path)?;
        }
        let mut bytes = builder.finish()?;
        if Self::archive_holds(archive, &bytes, obfuscated) {
            return Ok(None);
        }
        if obfuscated {
            xor_in_place(&mut bytes, XOR_MASK);
        }
        replace_file(archive, &bytes)?;
        Ok(Some(files.len()))
    }

    /// Whether the archive on disk has the same entries as `plain`.
    fn archive_holds(archive: &Path, plain: &[u8], obfuscated: bool) -> bool {
        let Ok(mut existing) = std::fs::read(archive) else {
            return false;
        };
        if obfuscated {
            xor_in_place(&mut existing, XOR_MASK);
        }
        match (read_archive(&existing), read_archive(plain)) {
            (Ok(mut old), Ok(mut new)) => {
                old.sort_by(|a, b| a.name.cmp(&b.name));
                new.sort_by(|a, b| a.name.cmp(&b.name));
                old == new
            }
            _ => false,
        }
    }
}

#[async_trait]
impl WorkingDirectory for CompressedWorkingDirectory {
    fn description(&self) -> String {
        self.archive.display().to_string()
    }

    fn target_location(&self) -> String {
        self.archive.display().to_string()
    }

    fn directory(&self) -> PathBuf {
        self.extracted_path()
            .unwrap_or_else(|| self.base.working_dir().to_path_buf())
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

    #[instrument(skip(self), level = "debug", fields(archive = %self.archive.display()))]
    async fn prepare(&self) -> Result<()> {
        if self.extracted_path().is_some() {
            return Ok(());
        }

        let temp = tempfile::Builder::new()
            .prefix("teamdata-")
            .tempdir()
            .map_err(|e| SyncError::Io(format!("Failed to create extraction dir: {}", e)))?;
        let archive = self.archive.clone();
        let dest = temp.path().to_path_buf();
        let obfuscated = self.is_obfuscated();
        let count = tokio::task::spawn_blocking(move || Self::extract(&archive, obfuscated, &dest))
            .await
            .map_err(|e| SyncError::Io(format!("Extraction task failed: {}", e)))??;

        info!(
            "Extracted {} files from {} into {}",
            count,
            self.archive.display(),
            temp.path().display()
        );
        if let Ok(mut guard) = self.extracted.lock() {
            if guard.is_none() {
                *guard = Some(temp);
            }
        }
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }

    async fn acquire_write_lock(
        &self,
        _handler: Option<Arc<dyn LockMessageHandler>>,
        _owner: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn assert_write_lock(&self) -> Result<()> {
        Ok(())
    }

    async fn release_write_lock(&self) {}

    #[instrument(skip(self), level = "debug", fields(archive = %self.archive.display()))]
    async fn flush_data(&self) -> Result<bool> {
        let Some(source) = self.extracted_path() else {
            return Err(SyncError::InvalidState(format!(
                "{} has not been prepared",
                self.archive.display()
            )));
        };
        let archive = self.archive.clone();
        let obfuscated = self.is_obfuscated();
        let strategy = self.base.strategy().clone();
        let saved = tokio::task::spawn_blocking(move || {
            Self::compress(&source, &archive, obfuscated, strategy.as_ref())
        })
        .await
        .map_err(|e| SyncError::Io(format!("Compression task failed: {}", e)))??;

        match saved {
            Some(count) => {
                info!("Saved {} files to {}", count, self.archive.display());
                Ok(true)
            }
            None => {
                debug!("{} is unchanged", self.archive.display());
                Ok(false)
            }
        }
    }

    async fn do_backup(&self, qualifier: &str) -> Result<BackupLocator> {
        let Some(source) = self.extracted_path() else {
            return Err(SyncError::InvalidState(format!(
                "{} has not been prepared",
                self.archive.display()
            )));
        };
        let backup_dir = self
            .archive
            .parent()
            .map(|p| p.join(BACKUP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR_NAME));
        let path = crate::backup::DirectoryBackup::new(
            source,
            backup_dir,
            self.base.strategy().clone(),
        )
        .backup(qualifier)
        .await?;
        Ok(BackupLocator::File(path))
    }

    async fn release_locks(&self) {
        let extracted = self.extracted.lock().ok().and_then(|mut guard| guard.take());
        if let Some(dir) = extracted {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
        }
        self.base.release_process_lock().await;
        self.base.remove_working_dir_if_empty().await;
    }
}
