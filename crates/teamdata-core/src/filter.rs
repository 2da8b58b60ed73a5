use std::sync::Arc;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Result, SyncError};

/// Files that are excluded from listings, hashes and diffs.
///
/// They change constantly and are uploaded separately on a best-effort basis.
pub const DEFAULT_EXCLUDE_FILENAMES: &[&str] = &["log.txt", "histLog.txt"];

/// Whether a resource is one of the default excluded files.
pub fn is_default_excluded(name: &str) -> bool {
    DEFAULT_EXCLUDE_FILENAMES
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(name))
}

/// A predicate over resource names.
pub trait NameFilter: Send + Sync {
    fn matches(&self, name: &str) -> bool;
}

impl<F> NameFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, name: &str) -> bool {
        self(name)
    }
}

/// Matches names against a set of glob patterns, ignoring case.
///
/// `*` also matches `/`, so `backup/*` covers nested entries.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    patterns: Vec<String>,
    set: GlobSet,
}

impl PatternFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| SyncError::InvalidPattern(format!("{}: {}", pattern, e)))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| SyncError::InvalidPattern(e.to_string()))?;
        Ok(Self { patterns, set })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl NameFilter for PatternFilter {
    fn matches(&self, name: &str) -> bool {
        self.set.is_match(name)
    }
}

/// Decides, per resource, whether a sync pass should act on a difference.
pub trait SyncFilter: Send + Sync {
    /// `local` and `remote` are modification times, 0 when the side is absent.
    fn should_sync(&self, name: &str, local: i64, remote: i64) -> bool;
}

/// Conflict heuristic applied when pulling server state over a local copy.
///
/// `last_sync` is the time local changes were last known to be fully
/// uploaded. Local edits made after that point are kept; server changes made
/// after that point win.
#[derive(Clone)]
pub struct SyncDownFilter {
    last_sync: i64,
    corruption_check: Option<Arc<dyn NameFilter>>,
}

impl SyncDownFilter {
    pub fn new(last_sync: i64) -> Self {
        Self {
            last_sync,
            corruption_check: None,
        }
    }

    /// Local files reported as possibly corrupt are replaced even when older
    /// than the last sync.
    pub fn with_corruption_check(mut self, check: Arc<dyn NameFilter>) -> Self {
        self.corruption_check = Some(check);
        self
    }

    pub fn last_sync(&self) -> i64 {
        self.last_sync
    }
}

impl std::fmt::Debug for SyncDownFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDownFilter")
            .field("last_sync", &self.last_sync)
            .field("corruption_check", &self.corruption_check.is_some())
            .finish()
    }
}

impl SyncFilter for SyncDownFilter {
    fn should_sync(&self, name: &str, local: i64, remote: i64) -> bool {
        if local <= 0 {
            // nothing local to protect
            true
        } else if remote <= 0 {
            // deleted upstream; keep it only if edited since our last upload
            local <= self.last_sync
        } else if remote <= self.last_sync {
            self.corruption_check
                .as_ref()
                .is_some_and(|check| check.matches(name))
        } else {
            true
        }
    }
}
