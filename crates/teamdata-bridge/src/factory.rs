use std::path::Path;
use std::sync::Arc;

use teamdata_core::{strategy_for, Purpose, Result, WorkingDirectory};
use teamdata_local::{
    is_url_format, CompressedWorkingDirectory, LocalWorkingDirectory, WorkingDirectoryOptions,
};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::import::ImportDirectoryFactory;
use crate::registry::LockRegistry;
use crate::selector::TeamServerSelector;
use crate::working_dir::BridgedWorkingDirectory;
use crate::worker::WorkerSettings;

/// Extensions of files that are edited as compressed working directories.
pub const COMPRESSED_EXTENSIONS: &[&str] = &["pdbk", "pdash", "zip"];

fn is_compressed_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| COMPRESSED_EXTENSIONS.contains(&ext.as_str()))
}

/// Picks the working directory variant for a location.
pub struct WorkingDirectoryFactory {
    options: WorkingDirectoryOptions,
    settings: WorkerSettings,
    selector: Arc<TeamServerSelector>,
    registry: Arc<LockRegistry>,
}

impl WorkingDirectoryFactory {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let selector = TeamServerSelector::new(config.default_team_server.clone())?
            .with_disabled(config.disable_team_server);
        Ok(Self {
            options: config.working_dir_options(),
            settings: config.worker_settings(),
            selector: Arc::new(selector),
            registry: Arc::new(LockRegistry::new()),
        })
    }

    pub fn selector(&self) -> &Arc<TeamServerSelector> {
        &self.selector
    }

    /// Holders of server locks handed out by this factory.
    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// An import directory factory sharing this factory's server selector.
    pub fn import_factory(
        &self,
        config: &EngineConfig,
        purpose: Purpose,
    ) -> ImportDirectoryFactory {
        ImportDirectoryFactory::new(
            self.selector.clone(),
            strategy_for(purpose),
            config.import_cache_parent(),
        )
        .with_prefer_caches_for(config.prefer_caches_for.clone())
        .with_no_caches_for(config.no_caches_for.clone())
    }

    /// The working directory for a URL, a compressed file or a directory.
    ///
    /// A directory served by a team server is bridged to it, even when the
    /// server is currently unreachable.
    pub async fn get(
        &self,
        location: &str,
        purpose: Purpose,
    ) -> Result<Arc<dyn WorkingDirectory>> {
        let strategy = strategy_for(purpose);

        if is_url_format(location) {
            info!("Using team server collection {}", location);
            let bridged: Arc<dyn WorkingDirectory> = BridgedWorkingDirectory::new(
                location,
                None,
                strategy,
                &self.options,
                self.settings,
                Some(self.registry.clone()),
            )?;
            return Ok(bridged);
        }

        let path = Path::new(location);
        if is_compressed_file(path) {
            debug!("Using compressed dataset {}", path.display());
            return Ok(Arc::new(CompressedWorkingDirectory::new(
                path,
                strategy,
                &self.options,
            )?));
        }

        if let Some(url) = self.selector.get_server_url_offline_ok(path).await {
            info!("{} is served by {}", path.display(), url);
            let bridged: Arc<dyn WorkingDirectory> = BridgedWorkingDirectory::new(
                &url,
                Some(path.to_path_buf()),
                strategy,
                &self.options,
                self.settings,
                Some(self.registry.clone()),
            )?;
            return Ok(bridged);
        }

        debug!("Using local directory {}", path.display());
        Ok(Arc::new(LocalWorkingDirectory::new(
            path,
            strategy,
            &self.options,
        )))
    }
}
