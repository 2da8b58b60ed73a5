use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

/// A read-only mirror of a local or remote collection.
#[async_trait]
pub trait ImportDirectory: Send + Sync {
    /// Local directory holding the mirrored files.
    fn directory(&self) -> PathBuf;

    /// URL of the remote collection, when the mirror is backed by a server.
    fn remote_location(&self) -> Option<String>;

    fn description(&self) -> String;

    /// Check that the mirrored data can be read.
    async fn validate(&self) -> Result<()>;

    /// Bring the mirror up to date with its source.
    async fn update(&self) -> Result<()>;
}
