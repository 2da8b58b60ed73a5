//! Core traits and types for the team data synchronization engine.
//!
//! This crate defines the abstractions shared between the filesystem and server-backed
//! implementations:
//! - `ResourceCollection`: Enumerable named files with timestamps and checksums
//! - `ResourceCollectionInfo` / `ResourceCollectionDiff`: Listing snapshots and their comparison
//! - `SyncFilter`: Per-resource decisions applied to a diff (conflict heuristic)
//! - `WorkingDirectory`: The unit callers lock, prepare, edit and flush
//! - `ImportDirectory`: Read-only mirrors of a collection
//! - `CollectionStrategy`: Which files belong to a collection and how it is locked

mod collection;
mod diff;
mod error;
mod filter;
mod import_dir;
mod listing;
mod lock;
mod strategy;
mod working_dir;

pub use collection::{
    java_string_hash, ResourceCollection, ResourceCollectionInfo, ResourceEntry,
};
pub use diff::ResourceCollectionDiff;
pub use error::{LockFailure, Result, SyncError};
pub use filter::{
    is_default_excluded, NameFilter, PatternFilter, SyncDownFilter, SyncFilter,
    DEFAULT_EXCLUDE_FILENAMES,
};
pub use import_dir::ImportDirectory;
pub use listing::{parse_listing, write_listing};
pub use lock::{LockMessage, LockMessageHandler, LOCK_LOST_MESSAGE};
pub use strategy::{
    strategy_for, CollectionStrategy, DashboardStrategy, Purpose, TeamDataStrategy,
    BACKUP_DIR_NAME, METADATA_DIR_NAME, PROCESS_LOCK_FILENAME,
};
pub use working_dir::{BackupLocator, WorkingDirectory};
