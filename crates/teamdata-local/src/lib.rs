//! Filesystem side of the team data sync engine.
//!
//! Provides the directory-backed resource collection, file-based process and
//! write locks, metadata and backups, and the working directory variants that
//! need no server: editing a directory in place and editing a zip archive.

pub mod archive;
mod backup;
mod concurrency_lock;
mod file_collection;
mod identity;
mod import_dir;
mod metadata;
mod working_dir;

pub use backup::DirectoryBackup;
pub use concurrency_lock::{FileConcurrencyLock, LockApprover, LockFileInfo};
pub use file_collection::{check_resource_name, FileResourceCollection};
pub use identity::{is_url_format, normalize_location, working_directory_id};
pub use import_dir::{
    has_contents, CachedImportDirectory, CachingLocalImportDirectory, LocalImportDirectory,
};
pub use metadata::MetadataStore;
pub use working_dir::{
    CompressedWorkingDirectory, LocalWorkingDirectory, WorkingDirectoryBase,
    WorkingDirectoryOptions, OBFUSCATED_EXTENSION,
};

/// Host name of this machine, used to identify lock holders.
pub fn local_host_name() -> String {
    concurrency_lock::local_host_name()
}
