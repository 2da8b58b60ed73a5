use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use teamdata_core::{CollectionStrategy, Result, SyncError};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::archive::{replace_file, ArchiveBuilder};

const BACKUP_PREFIX: &str = "pdash-";
const DEFAULT_RETAIN: usize = 20;

/// Zips the member files of a directory into a backup folder.
///
/// Backups are named `pdash-<yyyyMMddHHmmss>-<qualifier>.zip`; only the most
/// recent `retain` backups are kept.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    source: PathBuf,
    backup_dir: PathBuf,
    strategy: Arc<dyn CollectionStrategy>,
    retain: usize,
}

impl DirectoryBackup {
    pub fn new(
        source: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        strategy: Arc<dyn CollectionStrategy>,
    ) -> Self {
        Self {
            source: source.into(),
            backup_dir: backup_dir.into(),
            strategy,
            retain: DEFAULT_RETAIN,
        }
    }

    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Write a new backup and return its path.
    #[instrument(skip(self), level = "debug")]
    pub async fn backup(&self, qualifier: &str) -> Result<PathBuf> {
        let this = self.clone();
        let qualifier = sanitize_qualifier(qualifier);
        let path = tokio::task::spawn_blocking(move || this.backup_blocking(&qualifier))
            .await
            .map_err(|e| SyncError::Io(format!("Backup task failed: {}", e)))??;
        info!("Wrote backup {}", path.display());
        Ok(path)
    }

    fn backup_blocking(&self, qualifier: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)?;

        let mut names: Vec<(String, PathBuf)> = WalkDir::new(&self.source)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| !e.path().starts_with(&self.backup_dir))
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&self.source).ok()?;
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                self.strategy
                    .includes(&name)
                    .then(|| (name, e.path().to_path_buf()))
            })
            .collect();
        names.sort();

        let mut builder = ArchiveBuilder::new();
        for (name, path) in &names {
            builder.add_file(name, path)?;
        }
        let bytes = builder.finish()?;

        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let mut dest = self
            .backup_dir
            .join(format!("{}{}-{}.zip", BACKUP_PREFIX, stamp, qualifier));
        let mut n = 1;
        while dest.exists() {
            dest = self
                .backup_dir
                .join(format!("{}{}-{}-{}.zip", BACKUP_PREFIX, stamp, qualifier, n));
            n += 1;
        }
        replace_file(&dest, &bytes)?;
        debug!("Backed up {} files", names.len());

        self.prune();
        Ok(dest)
    }

    /// Existing backups, oldest first.
    pub fn list_backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.backup_dir) else {
            return Vec::new();
        };
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".zip"))
            })
            .collect();
        backups.sort();
        backups
    }

    fn prune(&self) {
        let backups = self.list_backups();
        if backups.len() <= self.retain {
            return;
        }
        for old in &backups[..backups.len() - self.retain] {
            if let Err(e) = std::fs::remove_file(old) {
                warn!("Failed to prune backup {}: {}", old.display(), e);
            }
        }
    }
}

fn sanitize_qualifier(qualifier: &str) -> String {
    let cleaned: String = qualifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}
