use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use teamdata_core::WorkingDirectory;
use tracing::{debug, info, warn};

/// Something holding locks that must be let go before the process exits.
#[async_trait]
pub trait Releasable: Send + Sync {
    fn describe(&self) -> String;

    async fn release(&self);
}

#[async_trait]
impl<T: WorkingDirectory + ?Sized> Releasable for T {
    fn describe(&self) -> String {
        self.description()
    }

    async fn release(&self) {
        self.release_locks().await;
    }
}

/// Process-wide list of lock holders, released together on shutdown.
#[derive(Default)]
pub struct LockRegistry {
    entries: DashMap<u64, Arc<dyn Releasable>>,
    next_id: AtomicU64,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, holder: Arc<dyn Releasable>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("Registered lock holder {} ({})", id, holder.describe());
        self.entries.insert(id, holder);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every registered holder. Called once when the process shuts
    /// down.
    pub async fn release_all(&self) {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            // removed first so a holder deregistering itself does not block
            let Some((_, holder)) = self.entries.remove(&id) else {
                continue;
            };
            info!("Releasing locks on {}", holder.describe());
            holder.release().await;
        }
    }
}

/// Scoped ownership of a working directory's locks.
///
/// Call [`release`](Self::release) for an orderly shutdown. A guard dropped
/// without it releases the locks on a background task.
pub struct SessionGuard {
    directory: Option<Arc<dyn WorkingDirectory>>,
}

impl SessionGuard {
    pub fn new(directory: Arc<dyn WorkingDirectory>) -> Self {
        Self {
            directory: Some(directory),
        }
    }

    pub fn directory(&self) -> Option<&Arc<dyn WorkingDirectory>> {
        self.directory.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(directory) = self.directory.take() {
            directory.release_locks().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(directory) = self.directory.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    directory.release_locks().await;
                });
            }
            Err(_) => warn!(
                "No runtime to release locks on {}",
                directory.description()
            ),
        }
    }
}
