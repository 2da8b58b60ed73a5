use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use teamdata_local::WorkingDirectoryOptions;

use crate::worker::WorkerSettings;

const APP_DIR_NAME: &str = "teamdata-sync";

/// Settings of the sync engine.
#[derive(Args, Debug, Clone)]
pub struct EngineConfig {
    /// Parent folder of the per-location staging folders
    #[arg(long, env = "TEAMDATA_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Folder holding cached copies of import directories
    #[arg(long, env = "TEAMDATA_IMPORT_CACHE_DIR")]
    pub import_cache_dir: Option<PathBuf>,

    /// Never take process locks
    #[arg(long, env = "TEAMDATA_DISABLE_PROCESS_LOCK")]
    pub disable_process_lock: bool,

    /// Never contact a team server; use data directories in place
    #[arg(long, env = "TEAMDATA_DISABLE_TEAM_SERVER")]
    pub disable_team_server: bool,

    /// Base URL of the team server that hosts directories by default
    #[arg(long, env = "TEAMDATA_DEFAULT_SERVER")]
    pub default_team_server: Option<String>,

    /// Seconds between background worker ticks
    #[arg(long, default_value = "60", env = "TEAMDATA_WORKER_TICK_SECS")]
    pub worker_tick_secs: u64,

    /// Worker ticks between automatic sync-ups
    #[arg(long, default_value = "5", env = "TEAMDATA_FLUSH_FREQUENCY")]
    pub flush_frequency: u32,

    /// Locations whose cached copy is used before trying the live location
    #[arg(long, env = "TEAMDATA_PREFER_CACHES_FOR", value_delimiter = ',')]
    pub prefer_caches_for: Vec<String>,

    /// Locations that are never copied into the import cache
    #[arg(long, env = "TEAMDATA_NO_CACHES_FOR", value_delimiter = ',')]
    pub no_caches_for: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            import_cache_dir: None,
            disable_process_lock: false,
            disable_team_server: false,
            default_team_server: None,
            worker_tick_secs: 60,
            flush_frequency: 5,
            prefer_caches_for: Vec::new(),
            no_caches_for: Vec::new(),
        }
    }
}

fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

impl EngineConfig {
    pub fn working_dir_parent(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| app_data_dir().join("working"))
    }

    pub fn import_cache_parent(&self) -> PathBuf {
        self.import_cache_dir
            .clone()
            .unwrap_or_else(|| app_data_dir().join("import-cache"))
    }

    pub fn working_dir_options(&self) -> WorkingDirectoryOptions {
        let mut options = WorkingDirectoryOptions::new(self.working_dir_parent());
        options.process_lock_enabled = !self.disable_process_lock;
        options
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            tick: Duration::from_secs(self.worker_tick_secs.max(1)),
            flush_frequency: self.flush_frequency.max(1),
            ..WorkerSettings::default()
        }
    }
}
