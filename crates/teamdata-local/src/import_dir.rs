use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use teamdata_core::{ImportDirectory, Result, SyncError};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::archive::{file_modified_ms, set_file_modified};

async fn check_directory(dir: &Path) -> Result<()> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(SyncError::NotFound(format!(
            "Import directory {} is unavailable",
            dir.display()
        ))),
    }
}

/// Whether a directory exists and contains at least one entry.
pub fn has_contents(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// A plain local directory read in place.
#[derive(Debug, Clone)]
pub struct LocalImportDirectory {
    dir: PathBuf,
}

impl LocalImportDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ImportDirectory for LocalImportDirectory {
    fn directory(&self) -> PathBuf {
        self.dir.clone()
    }

    fn remote_location(&self) -> Option<String> {
        None
    }

    fn description(&self) -> String {
        self.dir.display().to_string()
    }

    async fn validate(&self) -> Result<()> {
        check_directory(&self.dir).await
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }
}

/// A local directory that copies itself into a cache folder on each update,
/// so the data stays readable when the original location goes away.
#[derive(Debug, Clone)]
pub struct CachingLocalImportDirectory {
    source: PathBuf,
    cache: PathBuf,
}

impl CachingLocalImportDirectory {
    pub fn new(source: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            cache: cache.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache
    }
}

/// Mirror the top-level files of `source` into `dest`, copying changed files
/// and deleting files that no longer exist in the source.
fn mirror_files(source: &Path, dest: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut seen = HashSet::new();
    let mut copied = 0;

    for entry in WalkDir::new(source).min_depth(1).max_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_os_string();
        let target = dest.join(&name);
        let modified = file_modified_ms(entry.path());
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let unchanged = std::fs::metadata(&target)
            .map(|m| m.len() == len && file_modified_ms(&target) == modified)
            .unwrap_or(false);
        if !unchanged {
            std::fs::copy(entry.path(), &target)?;
            set_file_modified(&target, modified)?;
            copied += 1;
        }
        seen.insert(name);
    }

    for entry in std::fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && !seen.contains(&entry.file_name()) {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(copied)
}

#[async_trait]
impl ImportDirectory for CachingLocalImportDirectory {
    fn directory(&self) -> PathBuf {
        self.source.clone()
    }

    fn remote_location(&self) -> Option<String> {
        None
    }

    fn description(&self) -> String {
        self.source.display().to_string()
    }

    async fn validate(&self) -> Result<()> {
        check_directory(&self.source).await
    }

    #[instrument(skip(self), level = "debug", fields(source = %self.source.display()))]
    async fn update(&self) -> Result<()> {
        self.validate().await?;
        let (source, cache) = (self.source.clone(), self.cache.clone());
        let copied = tokio::task::spawn_blocking(move || mirror_files(&source, &cache))
            .await
            .map_err(|e| SyncError::Io(format!("Cache refresh failed: {}", e)))??;
        debug!("Refreshed cache, {} files copied", copied);
        Ok(())
    }
}

/// A previously cached copy of a location, served read-only.
#[derive(Debug, Clone)]
pub struct CachedImportDirectory {
    location: String,
    cache: PathBuf,
}

impl CachedImportDirectory {
    pub fn new(location: impl Into<String>, cache: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            cache: cache.into(),
        }
    }

    /// A cache is worth using only once something has been stored in it.
    pub fn is_viable(&self) -> bool {
        has_contents(&self.cache)
    }
}

#[async_trait]
impl ImportDirectory for CachedImportDirectory {
    fn directory(&self) -> PathBuf {
        self.cache.clone()
    }

    fn remote_location(&self) -> Option<String> {
        None
    }

    fn description(&self) -> String {
        format!("{} (cached)", self.location)
    }

    async fn validate(&self) -> Result<()> {
        check_directory(&self.cache).await
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }
}
