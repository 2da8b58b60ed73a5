use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use teamdata_core::{Result, SyncError};
use tokio::fs;
use tracing::debug;

use crate::archive::replace_file;

/// Small named text values, one UTF-8 file per name.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    directory: PathBuf,
}

impl MetadataStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', ':']) || name.starts_with('.') {
            return Err(SyncError::InvalidState(format!(
                "Invalid metadata name '{}'",
                name
            )));
        }
        Ok(self.directory.join(name))
    }

    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(format!(
                "Failed to read metadata {}: {}",
                name, e
            ))),
        }
    }

    /// Store a value; `None` removes it.
    pub async fn set(&self, name: &str, value: Option<&str>) -> Result<()> {
        let path = self.path(name)?;
        match value {
            Some(value) => {
                fs::create_dir_all(&self.directory).await?;
                let data = value.as_bytes().to_vec();
                tokio::task::spawn_blocking(move || replace_file(&path, &data))
                    .await
                    .map_err(|e| SyncError::Io(format!("Metadata write failed: {}", e)))??;
                debug!("Saved metadata {}", name);
            }
            None => match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    /// Remove the metadata directory if nothing is stored in it.
    pub async fn remove_if_empty(&self) {
        let _ = fs::remove_dir(&self.directory).await;
    }
}
