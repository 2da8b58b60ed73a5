//! Team server side of the team data sync engine.
//!
//! This crate connects the filesystem layer to team servers:
//! - `ResourceBridgeClient`: Sync protocol client (hash, list, download, upload, locks)
//! - `TeamServerSelector`: Which server, if any, hosts a data directory
//! - `BridgedWorkingDirectory`: A working directory mirroring a server collection,
//!   kept alive and flushed by a background `Worker`
//! - `ImportDirectoryFactory`: Read-only mirrors of local or server data, with caching
//! - `WorkingDirectoryFactory`: Chooses the working directory variant for a location
//! - `LockRegistry` / `SessionGuard`: Lock release on shutdown

pub mod client;
pub mod config;
pub mod factory;
pub mod import;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod worker;
pub mod working_dir;

pub use client::ResourceBridgeClient;
pub use config::EngineConfig;
pub use factory::{WorkingDirectoryFactory, COMPRESSED_EXTENSIONS};
pub use import::{BridgedImportDirectory, ImportDirectoryFactory, ALL_LOCATIONS};
pub use registry::{LockRegistry, Releasable, SessionGuard};
pub use selector::{ServerProbe, TeamServerSelector, POINTER_FILENAME};
pub use worker::{Worker, WorkerHandle, WorkerSettings, WorkerTarget};
pub use working_dir::{BridgedWorkingDirectory, SYNC_TIMESTAMP_KEY, WORKING_DIR_GUID_KEY};
