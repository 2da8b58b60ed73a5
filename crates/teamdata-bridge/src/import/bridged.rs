use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use teamdata_core::{CollectionStrategy, ImportDirectory, Result, SyncError};
use teamdata_local::FileResourceCollection;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::client::ResourceBridgeClient;

/// Updates closer together than this are skipped.
const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// A read-only local mirror of a server collection.
///
/// The mirror folder doubles as the cache for the URL, so the last copy stays
/// readable once the server goes away.
#[derive(Debug)]
pub struct BridgedImportDirectory {
    remote_url: String,
    directory: PathBuf,
    client: ResourceBridgeClient,
    last_update: Mutex<Option<Instant>>,
}

impl BridgedImportDirectory {
    pub fn new(
        remote_url: &str,
        directory: impl Into<PathBuf>,
        strategy: Arc<dyn CollectionStrategy>,
    ) -> Result<Self> {
        let directory = directory.into();
        let collection = Arc::new(FileResourceCollection::new(&directory, strategy.clone()));
        let client = ResourceBridgeClient::new(collection, remote_url, strategy.sync_down_only())?;
        Ok(Self {
            remote_url: remote_url.to_string(),
            directory,
            client,
            last_update: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ImportDirectory for BridgedImportDirectory {
    fn directory(&self) -> PathBuf {
        self.directory.clone()
    }

    fn remote_location(&self) -> Option<String> {
        Some(self.remote_url.clone())
    }

    fn description(&self) -> String {
        self.remote_url.clone()
    }

    async fn validate(&self) -> Result<()> {
        match tokio::fs::metadata(&self.directory).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(SyncError::NotFound(format!(
                "No local copy of {}",
                self.remote_url
            ))),
        }
    }

    #[instrument(skip(self), level = "debug", fields(url = %self.remote_url))]
    async fn update(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if last_update.is_some_and(|at| at.elapsed() < MIN_UPDATE_INTERVAL) {
            debug!("Skipping update, last one was too recent");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.directory).await?;
        let changed = self.client.sync_down(None).await?;
        *last_update = Some(Instant::now());
        debug!("Updated import directory, changed: {}", changed);
        Ok(())
    }
}
