use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use teamdata_core::{
    BackupLocator, CollectionStrategy, LockFailure, LockMessageHandler, ResourceCollection,
    Result, SyncDownFilter, SyncError, SyncFilter, WorkingDirectory,
};
use teamdata_local::archive::now_ms;
use teamdata_local::{
    FileResourceCollection, MetadataStore, WorkingDirectoryBase, WorkingDirectoryOptions,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::ResourceBridgeClient;
use crate::registry::LockRegistry;
use crate::worker::{Worker, WorkerHandle, WorkerSettings, WorkerTarget};

/// Metadata entry holding the time of the last successful sync-up.
pub const SYNC_TIMESTAMP_KEY: &str = "syncUpTimestamp";
/// Metadata entry holding this working directory's unique id.
pub const WORKING_DIR_GUID_KEY: &str = "workingDirGUID";

const SYNC_DOWN_ATTEMPTS: usize = 5;
const FLUSH_ATTEMPTS: usize = 5;

async fn last_sync_timestamp(metadata: &MetadataStore) -> Option<i64> {
    match metadata.get(SYNC_TIMESTAMP_KEY).await {
        Ok(value) => value.and_then(|v| v.trim().parse().ok()),
        Err(e) => {
            warn!("Unable to read sync timestamp: {}", e);
            None
        }
    }
}

async fn save_sync_timestamp(metadata: &MetadataStore) -> Result<()> {
    metadata
        .set(SYNC_TIMESTAMP_KEY, Some(&now_ms().to_string()))
        .await
}

/// Drives the background worker against the server lock of one collection.
struct BridgeWorkerTarget {
    client: Arc<ResourceBridgeClient>,
    metadata: MetadataStore,
}

#[async_trait]
impl WorkerTarget for BridgeWorkerTarget {
    fn lock_source(&self) -> String {
        self.client.remote_url().to_string()
    }

    async fn ping_lock(&self) -> Result<()> {
        self.client.ping_lock().await
    }

    async fn sync_up(&self) -> Result<bool> {
        self.client.sync_up(None).await
    }

    async fn save_default_excluded_files(&self) -> Result<()> {
        self.client.save_default_excluded_files().await
    }

    async fn save_sync_timestamp(&self) -> Result<()> {
        save_sync_timestamp(&self.metadata).await
    }
}

/// A held server write lock and everything tied to it.
struct WriteSession {
    worker: WorkerHandle,
    registration: Option<u64>,
}

/// A working directory mirroring a collection on a team server.
///
/// Data lives in the local staging folder. `prepare` pulls it down, edits are
/// pushed by `flush_data` and, while the write lock is held, by a background
/// worker that also keeps the lock alive.
pub struct BridgedWorkingDirectory {
    base: WorkingDirectoryBase,
    remote_url: String,
    origin: Option<PathBuf>,
    collection: Arc<FileResourceCollection>,
    client: Arc<ResourceBridgeClient>,
    settings: WorkerSettings,
    allow_update_when_locked: AtomicBool,
    tree_lock: Arc<Mutex<()>>,
    session: Mutex<Option<WriteSession>>,
    registry: Option<Arc<LockRegistry>>,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for BridgedWorkingDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedWorkingDirectory")
            .field("remote_url", &self.remote_url)
            .field("working_dir", &self.base.working_dir())
            .finish()
    }
}

impl BridgedWorkingDirectory {
    /// `origin` is the local directory whose pointer file led to this URL,
    /// if any; it only affects the description.
    pub fn new(
        remote_url: &str,
        origin: Option<PathBuf>,
        strategy: Arc<dyn CollectionStrategy>,
        options: &WorkingDirectoryOptions,
        settings: WorkerSettings,
        registry: Option<Arc<LockRegistry>>,
    ) -> Result<Arc<Self>> {
        let base = WorkingDirectoryBase::new(remote_url, strategy.clone(), options);
        let collection = Arc::new(FileResourceCollection::new(
            base.working_dir(),
            strategy.clone(),
        ));
        let client = Arc::new(ResourceBridgeClient::new(
            collection.clone(),
            remote_url,
            strategy.sync_down_only(),
        )?);

        Ok(Arc::new_cyclic(|self_ref| Self {
            base,
            remote_url: remote_url.to_string(),
            origin,
            collection,
            client,
            settings,
            allow_update_when_locked: AtomicBool::new(false),
            tree_lock: Arc::new(Mutex::new(())),
            session: Mutex::new(None),
            registry,
            self_ref: self_ref.clone(),
        }))
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    pub fn client(&self) -> &Arc<ResourceBridgeClient> {
        &self.client
    }

    pub fn base(&self) -> &WorkingDirectoryBase {
        &self.base
    }

    /// Allow `update` to pull server changes even while the write lock is
    /// held, at the risk of overwriting unflushed edits.
    pub fn set_allow_update_when_locked(&self, allow: bool) {
        self.allow_update_when_locked.store(allow, Ordering::SeqCst);
    }

    /// Hold this to keep sync passes out of the directory while editing it.
    pub async fn lock_tree(&self) -> MutexGuard<'_, ()> {
        self.tree_lock.lock().await
    }

    pub async fn is_write_locked(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Unique id of this copy of the data, created on first use.
    async fn working_dir_guid(&self) -> Result<String> {
        if let Some(guid) = self.metadata(WORKING_DIR_GUID_KEY).await? {
            let guid = guid.trim().to_string();
            if !guid.is_empty() {
                return Ok(guid);
            }
        }
        let guid = Uuid::new_v4().to_string();
        self.set_metadata(WORKING_DIR_GUID_KEY, Some(&guid)).await?;
        Ok(guid)
    }

    /// Sync down until nothing changes, giving up after a fixed number of
    /// attempts. Caller holds the tree lock.
    async fn sync_down_until_stable(&self) -> Result<()> {
        let filter = last_sync_timestamp(self.base.metadata()).await.map(|ts| {
            SyncDownFilter::new(ts).with_corruption_check(self.collection.corruption_check())
        });
        let filter = filter.as_ref().map(|f| f as &dyn SyncFilter);

        let mut last_error = None;
        for attempt in 1..=SYNC_DOWN_ATTEMPTS {
            match self.client.sync_down(filter).await {
                Ok(false) => return Ok(()),
                Ok(true) => debug!("Sync down attempt {} changed files", attempt),
                Err(e) if e.is_transient() => {
                    debug!("Sync down attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::Io(match last_error {
            Some(e) => format!("Unable to sync down {}: {}", self.remote_url, e),
            None => format!("Unable to sync down {}: data kept changing", self.remote_url),
        }))
    }

    async fn local_backup(&self, qualifier: &str) -> Result<PathBuf> {
        self.base
            .backup_handler(self.base.working_dir())
            .backup(qualifier)
            .await
    }

    /// Book-keeping after a flush that left nothing to push.
    async fn finish_flush(&self) {
        let worker = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.worker.worker().clone());
        if let Some(worker) = worker {
            worker.reset_flush_countdown();
        }
        if let Err(e) = self.client.save_default_excluded_files().await {
            debug!("Unable to save excluded files: {}", e);
        }
        if let Err(e) = save_sync_timestamp(self.base.metadata()).await {
            warn!("Unable to record sync time: {}", e);
        }
    }
}

#[async_trait]
impl WorkingDirectory for BridgedWorkingDirectory {
    fn description(&self) -> String {
        match &self.origin {
            Some(origin) => format!("{} ({})", origin.display(), self.remote_url),
            None => self.remote_url.clone(),
        }
    }

    fn target_location(&self) -> String {
        self.remote_url.clone()
    }

    fn directory(&self) -> PathBuf {
        self.base.working_dir().to_path_buf()
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

    #[instrument(skip(self), level = "debug", fields(url = %self.remote_url))]
    async fn prepare(&self) -> Result<()> {
        if !self.base.has_process_lock().await {
            return Err(LockFailure::NotLocked.into());
        }
        let _tree = self.tree_lock.lock().await;

        let has_data = !self.collection.list_resource_names().await?.is_empty();
        if has_data {
            if let Err(e) = self.local_backup("startup").await {
                warn!("Startup backup of {} failed: {}", self.remote_url, e);
            }
        }

        self.sync_down_until_stable().await?;
        info!("Prepared {} in {}", self.remote_url, self.base.working_dir().display());
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        if !self.base.has_process_lock().await {
            return Err(SyncError::InvalidState(format!(
                "{} must hold the process lock to update",
                self.remote_url
            )));
        }
        if self.is_write_locked().await && !self.allow_update_when_locked.load(Ordering::SeqCst) {
            return Err(SyncError::InvalidState(format!(
                "{} is write-locked; flush instead of updating",
                self.remote_url
            )));
        }
        let _tree = self.tree_lock.lock().await;
        self.sync_down_until_stable().await
    }

    #[instrument(skip(self, handler), level = "debug", fields(url = %self.remote_url))]
    async fn acquire_write_lock(
        &self,
        handler: Option<Arc<dyn LockMessageHandler>>,
        owner: &str,
    ) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let guid = self.working_dir_guid().await?;
        self.client.set_extra_lock_data(Some(guid)).await;
        self.client.acquire_lock(owner).await?;

        let target = Arc::new(BridgeWorkerTarget {
            client: self.client.clone(),
            metadata: self.base.metadata().clone(),
        });
        let worker = Arc::new(Worker::new(
            target,
            handler,
            self.settings,
            self.tree_lock.clone(),
        ));
        let registration = match (&self.registry, self.self_ref.upgrade()) {
            (Some(registry), Some(me)) => Some(registry.register(me)),
            _ => None,
        };

        *session = Some(WriteSession {
            worker: worker.spawn(),
            registration,
        });
        Ok(())
    }

    async fn assert_write_lock(&self) -> Result<()> {
        if !self.is_write_locked().await {
            return Err(LockFailure::NotLocked.into());
        }
        self.client.assert_lock().await
    }

    async fn release_write_lock(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.worker.stop().await;
            if let (Some(registry), Some(id)) = (&self.registry, session.registration) {
                registry.deregister(id);
            }
        }
        self.client.release_lock().await;
    }

    #[instrument(skip(self), level = "debug", fields(url = %self.remote_url))]
    async fn flush_data(&self) -> Result<bool> {
        let _tree = self.tree_lock.lock().await;

        let mut changed = false;
        let mut last_error = None;
        for attempt in 1..=FLUSH_ATTEMPTS {
            match self.client.sync_up(None).await {
                Ok(true) => changed = true,
                Ok(false) => {
                    self.finish_flush().await;
                    return Ok(changed);
                }
                Err(e) if e.is_transient() => {
                    debug!("Flush attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::Io(match last_error {
            Some(e) => format!("Unable to flush {}: {}", self.remote_url, e),
            None => format!("Unable to flush {}: data kept changing", self.remote_url),
        }))
    }

    async fn do_backup(&self, qualifier: &str) -> Result<BackupLocator> {
        if self.is_write_locked().await {
            match self.client.do_backup(qualifier).await {
                Ok(url) => return Ok(BackupLocator::Url(url)),
                Err(e) => warn!("Server backup of {} failed: {}", self.remote_url, e),
            }
        }
        Ok(BackupLocator::File(self.local_backup(qualifier).await?))
    }

    async fn release_locks(&self) {
        self.release_write_lock().await;
        self.base.release_process_lock().await;
    }
}
