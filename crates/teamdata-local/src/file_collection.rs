use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use teamdata_core::{
    CollectionStrategy, NameFilter, ResourceCollection, Result, SyncError,
};
use tokio::fs;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::archive::{replace_file, set_file_modified, system_time_ms};

/// Checksum cached against the file state it was computed from.
#[derive(Debug, Clone, Copy)]
struct CachedChecksum {
    modified: i64,
    len: u64,
    checksum: u64,
}

/// A resource collection backed by a directory on disk.
///
/// Which files belong to the collection is decided by the strategy. Checksums
/// are Adler-32 and are cached until the file's size or modification time
/// changes.
pub struct FileResourceCollection {
    directory: PathBuf,
    strategy: Arc<dyn CollectionStrategy>,
    checksums: DashMap<String, CachedChecksum>,
}

impl std::fmt::Debug for FileResourceCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileResourceCollection")
            .field("directory", &self.directory)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl FileResourceCollection {
    pub fn new(directory: impl Into<PathBuf>, strategy: Arc<dyn CollectionStrategy>) -> Self {
        Self {
            directory: directory.into(),
            strategy,
            checksums: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn strategy(&self) -> &Arc<dyn CollectionStrategy> {
        &self.strategy
    }

    /// Path of a resource on disk, after validating its name.
    pub fn resource_path(&self, name: &str) -> Result<PathBuf> {
        check_resource_name(name)?;
        Ok(self.directory.join(name))
    }

    /// A name filter reporting resources that look damaged on disk.
    pub fn corruption_check(&self) -> Arc<dyn NameFilter> {
        let directory = self.directory.clone();
        let strategy = self.strategy.clone();
        Arc::new(move |name: &str| {
            check_resource_name(name).is_ok()
                && strategy.is_file_possibly_corrupt(&directory.join(name))
        })
    }

    /// Blocking scan of the directory for member files.
    fn scan_names(directory: &Path, strategy: &dyn CollectionStrategy) -> Vec<String> {
        WalkDir::new(directory)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(directory).ok()?;
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                (check_resource_name(&name).is_ok() && strategy.includes(&name)).then_some(name)
            })
            .collect()
    }
}

/// Reject names that could escape the collection directory.
pub fn check_resource_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('\\')
        || name.contains(':')
        || name.starts_with('/')
        || name.split('/').any(|part| part == "..")
    {
        return Err(SyncError::Protocol(format!(
            "Invalid resource name '{}'",
            name
        )));
    }
    Ok(())
}

fn adler32(data: &[u8]) -> u64 {
    let mut hasher = adler2::Adler32::new();
    hasher.write_slice(data);
    u64::from(hasher.checksum())
}

#[async_trait]
impl ResourceCollection for FileResourceCollection {
    #[instrument(skip(self), level = "debug")]
    async fn list_resource_names(&self) -> Result<Vec<String>> {
        let directory = self.directory.clone();
        let strategy = self.strategy.clone();
        let names = tokio::task::spawn_blocking(move || {
            Self::scan_names(&directory, strategy.as_ref())
        })
        .await
        .map_err(|e| SyncError::Io(format!("Directory scan failed: {}", e)))?;
        Ok(names)
    }

    async fn last_modified(&self, name: &str) -> Result<i64> {
        let path = self.resource_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.modified().map(system_time_ms).unwrap_or(0)),
            Ok(_) => Ok(0),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(SyncError::Io(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn checksum(&self, name: &str) -> Result<Option<u64>> {
        let path = self.resource_path(name)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified().map(system_time_ms).unwrap_or(0);

        if let Some(cached) = self.checksums.get(name) {
            if cached.modified == modified && cached.len == meta.len() {
                return Ok(Some(cached.checksum));
            }
        }

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checksum = adler32(&data);
        self.checksums.insert(
            name.to_string(),
            CachedChecksum {
                modified,
                len: meta.len(),
                checksum,
            },
        );
        Ok(Some(checksum))
    }

    async fn read_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resource_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_resource(&self, name: &str, data: &[u8], modified: Option<i64>) -> Result<()> {
        let path = self.resource_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            replace_file(&path, &data)?;
            if let Some(ms) = modified.filter(|ms| *ms > 0) {
                set_file_modified(&path, ms)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Io(format!("Write task failed: {}", e)))??;

        self.checksums.remove(name);
        debug!("Wrote resource {}", name);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_resource(&self, name: &str) -> Result<()> {
        let path = self.resource_path(name)?;
        self.checksums.remove(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted resource {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn validate(&self) -> Result<()> {
        match fs::metadata(&self.directory).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(SyncError::NotFound(format!(
                "Directory {} does not exist",
                self.directory.display()
            ))),
        }
    }

    fn recheck_all_file_timestamps(&self) {
        self.checksums.clear();
    }

    fn accepts(&self, name: &str) -> bool {
        check_resource_name(name).is_ok() && self.strategy.includes(name)
    }
}
