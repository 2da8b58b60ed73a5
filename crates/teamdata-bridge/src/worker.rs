use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teamdata_core::{
    LockFailure, LockMessage, LockMessageHandler, Result, SyncError, LOCK_LOST_MESSAGE,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop` waits for an in-flight tick before abandoning it.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Timing of the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub tick: Duration,
    /// Ticks between automatic sync-ups.
    pub flush_frequency: u32,
    /// Sync-ups between uploads of the default excluded files.
    pub full_flush_frequency: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            flush_frequency: 5,
            full_flush_frequency: 12,
        }
    }
}

/// What the worker drives: a server lock to keep alive and data to push.
#[async_trait]
pub trait WorkerTarget: Send + Sync {
    /// Name reported in lock messages.
    fn lock_source(&self) -> String;

    async fn ping_lock(&self) -> Result<()>;

    async fn sync_up(&self) -> Result<bool>;

    async fn save_default_excluded_files(&self) -> Result<()>;

    async fn save_sync_timestamp(&self) -> Result<()>;
}

/// Keeps a write lock alive and periodically pushes local changes while the
/// lock is held.
pub struct Worker {
    target: Arc<dyn WorkerTarget>,
    handler: Option<Arc<dyn LockMessageHandler>>,
    settings: WorkerSettings,
    tree_lock: Arc<Mutex<()>>,
    flush_countdown: AtomicU32,
    full_flush_countdown: AtomicU32,
    lock_lost: AtomicBool,
}

impl Worker {
    pub fn new(
        target: Arc<dyn WorkerTarget>,
        handler: Option<Arc<dyn LockMessageHandler>>,
        settings: WorkerSettings,
        tree_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            target,
            handler,
            settings,
            tree_lock,
            flush_countdown: AtomicU32::new(settings.flush_frequency.max(1)),
            full_flush_countdown: AtomicU32::new(settings.full_flush_frequency.max(1)),
            lock_lost: AtomicBool::new(false),
        }
    }

    /// Push the next automatic sync-up a full cycle away.
    pub fn reset_flush_countdown(&self) {
        self.flush_countdown
            .store(self.settings.flush_frequency.max(1), Ordering::SeqCst);
    }

    /// Whether the server reported the lock as lost.
    pub fn lock_lost(&self) -> bool {
        self.lock_lost.load(Ordering::SeqCst)
    }

    /// Run one cycle: ping the lock and, every `flush_frequency` ticks, sync
    /// up. Returns whether a sync-up ran.
    pub async fn tick(&self) -> bool {
        match self.run_cycle().await {
            Ok(synced) => synced,
            Err(e) => {
                self.handle_error(e);
                false
            }
        }
    }

    async fn run_cycle(&self) -> Result<bool> {
        self.target.ping_lock().await?;

        let remaining = self.flush_countdown.load(Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 {
            self.flush_countdown.store(remaining, Ordering::SeqCst);
            return Ok(false);
        }
        self.reset_flush_countdown();

        let _tree = self.tree_lock.lock().await;
        let changed = self.target.sync_up().await?;
        if changed {
            self.target.save_sync_timestamp().await?;
        }
        debug!("Background sync-up finished, changed: {}", changed);

        let remaining = self
            .full_flush_countdown
            .load(Ordering::SeqCst)
            .saturating_sub(1);
        if remaining == 0 {
            self.full_flush_countdown
                .store(self.settings.full_flush_frequency.max(1), Ordering::SeqCst);
            if let Err(e) = self.target.save_default_excluded_files().await {
                debug!("Unable to save excluded files: {}", e);
            }
        } else {
            self.full_flush_countdown.store(remaining, Ordering::SeqCst);
        }
        Ok(true)
    }

    fn handle_error(&self, e: SyncError) {
        match e {
            SyncError::Lock(LockFailure::Uncertain(reason)) => {
                debug!("Lock state uncertain: {}", reason);
            }
            SyncError::Lock(failure) => {
                if self.lock_lost.swap(true, Ordering::SeqCst) {
                    return;
                }
                warn!("Lost write lock on {}: {}", self.target.lock_source(), failure);
                if let Some(handler) = &self.handler {
                    let message = LockMessage::new(self.target.lock_source(), LOCK_LOST_MESSAGE);
                    handler.handle_message(&message);
                }
            }
            SyncError::Io(reason) | SyncError::Http(reason) => {
                debug!("Background sync deferred: {}", reason);
            }
            other => warn!("Background sync failed: {}", other),
        }
    }

    /// Start ticking on a background task.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let worker = self.clone();
        let task = tokio::spawn(async move {
            info!("Worker started for {}", worker.target.lock_source());
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(worker.settings.tick) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                worker.tick().await;
            }
            debug!("Worker stopped for {}", worker.target.lock_source());
        });

        WorkerHandle {
            worker: self,
            stop: stop_tx,
            task,
        }
    }
}

/// A running worker. Dropping the handle stops it after the current tick.
pub struct WorkerHandle {
    worker: Arc<Worker>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Signal the worker and wait for any in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(STOP_GRACE, self.task).await.is_err() {
            warn!("Worker did not stop in time, aborting");
            abort.abort();
        }
    }
}
