use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use teamdata_bridge::{
    EngineConfig, ResourceBridgeClient, SessionGuard, TeamServerSelector, WorkingDirectoryFactory,
};
use teamdata_core::{LockMessage, LockMessageHandler, Purpose};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "teamdata-sync")]
#[command(about = "Synchronize team data directories with a team server")]
struct Cli {
    #[command(flatten)]
    engine: EngineConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PurposeArg {
    Dashboard,
    TeamData,
}

impl From<PurposeArg> for Purpose {
    fn from(value: PurposeArg) -> Self {
        match value {
            PurposeArg::Dashboard => Purpose::Dashboard,
            PurposeArg::TeamData => Purpose::TeamData,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring a working copy of a location up to date and print its folder
    Prepare {
        location: String,
        #[arg(long, value_enum, default_value = "team-data")]
        purpose: PurposeArg,
    },
    /// Prepare, take the write lock and push local changes
    Flush {
        location: String,
        /// Name recorded as the lock owner
        #[arg(long)]
        owner: String,
        #[arg(long, value_enum, default_value = "team-data")]
        purpose: PurposeArg,
    },
    /// Back up a location and print where the backup went
    Backup {
        location: String,
        #[arg(long, default_value = "manual")]
        qualifier: String,
        #[arg(long, value_enum, default_value = "team-data")]
        purpose: PurposeArg,
    },
    /// Print the team server URL serving a directory, if any
    Probe {
        dir: PathBuf,
        /// Fall back to the pointer file when no server answers
        #[arg(long)]
        offline_ok: bool,
    },
    /// Resolve import locations and print the directory to read from
    Import {
        #[arg(required = true)]
        locations: Vec<String>,
        #[arg(long, value_enum, default_value = "team-data")]
        purpose: PurposeArg,
    },
    /// Upload one file to a server collection
    Upload {
        url: String,
        file: PathBuf,
        /// Resource name, defaults to the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete one file from a server collection
    Delete { url: String, name: String },
    /// Create a new collection on a server and print its id
    CreateCollection {
        url: String,
        collection_type: String,
        #[arg(long)]
        id: Option<String>,
    },
}

/// Logs lock messages from other processes.
struct LogLockMessages;

impl LockMessageHandler for LogLockMessages {
    fn handle_message(&self, message: &LockMessage) -> Option<String> {
        if message.is_lock_lost() {
            warn!("Write lock on {} was lost", message.lock_source);
        } else {
            info!("Lock message from {}: {}", message.lock_source, message.message);
        }
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let factory = WorkingDirectoryFactory::new(&cli.engine)?;

    let mut shutdown_rx = create_shutdown_signal();
    let result = tokio::select! {
        result = run(&cli, &factory) => result,
        _ = shutdown_rx.wait_for(|&v| v) => {
            info!("Interrupted, releasing locks");
            Ok(())
        }
    };

    factory.registry().release_all().await;
    result
}

async fn run(cli: &Cli, factory: &WorkingDirectoryFactory) -> anyhow::Result<()> {
    let handler: Arc<dyn LockMessageHandler> = Arc::new(LogLockMessages);

    match &cli.command {
        Command::Prepare { location, purpose } => {
            let wd = factory.get(location, (*purpose).into()).await?;
            let session = SessionGuard::new(wd.clone());
            wd.acquire_process_lock(None, Some(handler)).await?;
            let prepared = wd.prepare().await;
            session.release().await;
            prepared.with_context(|| format!("Unable to prepare {}", location))?;
            println!("{}", wd.directory().display());
        }
        Command::Flush {
            location,
            owner,
            purpose,
        } => {
            let wd = factory.get(location, (*purpose).into()).await?;
            let session = SessionGuard::new(wd.clone());
            let flushed = async {
                wd.acquire_process_lock(None, Some(handler.clone())).await?;
                wd.prepare().await?;
                wd.acquire_write_lock(Some(handler), owner).await?;
                wd.flush_data().await
            }
            .await;
            session.release().await;
            let pushed = flushed.with_context(|| format!("Unable to flush {}", location))?;
            info!("Flushed {} (changes pushed: {})", wd.description(), pushed);
        }
        Command::Backup {
            location,
            qualifier,
            purpose,
        } => {
            let wd = factory.get(location, (*purpose).into()).await?;
            let session = SessionGuard::new(wd.clone());
            let backup = async {
                wd.acquire_process_lock(None, Some(handler)).await?;
                wd.prepare().await?;
                wd.do_backup(qualifier).await
            }
            .await;
            session.release().await;
            println!("{}", backup?);
        }
        Command::Probe { dir, offline_ok } => {
            let selector: &TeamServerSelector = factory.selector();
            let url = if *offline_ok {
                selector.get_server_url_offline_ok(dir).await
            } else {
                selector.get_server_url(dir, None).await
            };
            match url {
                Some(url) => println!("{}", url),
                None => info!("{} is not served by a team server", dir.display()),
            }
        }
        Command::Import { locations, purpose } => {
            let imports = factory.import_factory(&cli.engine, (*purpose).into());
            let locations: Vec<&str> = locations.iter().map(String::as_str).collect();
            let import = imports
                .get(&locations)
                .await
                .context("No usable import location")?;
            println!("{}", import.directory().display());
        }
        Command::Upload { url, file, name } => {
            let name = match name {
                Some(name) => name.clone(),
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .context("Cannot derive a resource name from the file path")?,
            };
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let checksum = ResourceBridgeClient::upload_single_file(url, &name, data).await?;
            info!("Uploaded {} (checksum {:?})", name, checksum);
        }
        Command::Delete { url, name } => {
            ResourceBridgeClient::delete_single_file(url, name).await?;
            info!("Deleted {}", name);
        }
        Command::CreateCollection {
            url,
            collection_type,
            id,
        } => {
            let id =
                ResourceBridgeClient::create_new_collection(url, collection_type, id.as_deref())
                    .await?;
            println!("{}", id);
        }
    }
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
