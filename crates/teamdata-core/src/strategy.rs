use std::fmt::Debug;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::filter::{NameFilter, PatternFilter};

/// Name of the process lock file inside a working directory.
pub const PROCESS_LOCK_FILENAME: &str = "process.lock";

/// Subfolder holding backups.
pub const BACKUP_DIR_NAME: &str = "backup";

/// Subfolder holding metadata values.
pub const METADATA_DIR_NAME: &str = "metadata";

/// What a working directory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// A personal dataset.
    Dashboard,
    /// A team project's shared data directory.
    TeamData,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Dashboard => "dashboard",
            Purpose::TeamData => "teamdata",
        }
    }
}

/// Rules describing the files of one kind of collection.
pub trait CollectionStrategy: Send + Sync + Debug {
    fn purpose(&self) -> Purpose;

    /// Whether a resource name belongs to the collection.
    fn includes(&self, name: &str) -> bool;

    /// Name of the write-lock file kept in the collection directory.
    fn lock_filename(&self) -> &'static str;

    /// Names the lock owner never authors; the server copy always wins.
    fn sync_down_only(&self) -> Option<Arc<dyn NameFilter>>;

    /// Quick check for a damaged file (non-empty, starts with a NUL byte).
    fn is_file_possibly_corrupt(&self, path: &Path) -> bool {
        let Ok(mut file) = std::fs::File::open(path) else {
            return false;
        };
        let mut first = [0u8; 1];
        matches!(file.read(&mut first), Ok(1) if first[0] == 0)
    }
}

fn is_lock_or_temp(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".lock") || lower.ends_with(".tmp")
}

#[derive(Debug, Default)]
pub struct DashboardStrategy;

impl CollectionStrategy for DashboardStrategy {
    fn purpose(&self) -> Purpose {
        Purpose::Dashboard
    }

    fn includes(&self, name: &str) -> bool {
        !(name.eq_ignore_ascii_case(self.lock_filename())
            || name.eq_ignore_ascii_case(PROCESS_LOCK_FILENAME)
            || name.starts_with(&format!("{}/", BACKUP_DIR_NAME))
            || name.starts_with(&format!("{}/", METADATA_DIR_NAME))
            || is_lock_or_temp(name))
    }

    fn lock_filename(&self) -> &'static str {
        "dashlock.txt"
    }

    fn sync_down_only(&self) -> Option<Arc<dyn NameFilter>> {
        None
    }
}

const TEAM_DATA_PATTERNS: &[&str] = &["*.xml", "*.pdash", "*.txt", "*.json"];

static TEAM_DATA_FILES: LazyLock<Result<PatternFilter>> =
    LazyLock::new(|| PatternFilter::new(TEAM_DATA_PATTERNS.iter().copied()));

static SYNC_DOWN_ONLY_FILES: LazyLock<Result<PatternFilter>> =
    LazyLock::new(|| PatternFilter::new(["*-data.pdash"]));

#[derive(Debug, Default)]
pub struct TeamDataStrategy;

impl CollectionStrategy for TeamDataStrategy {
    fn purpose(&self) -> Purpose {
        Purpose::TeamData
    }

    fn includes(&self, name: &str) -> bool {
        !name.contains('/')
            && !is_lock_or_temp(name)
            && TEAM_DATA_FILES
                .as_ref()
                .is_ok_and(|files| files.matches(name))
    }

    fn lock_filename(&self) -> &'static str {
        "teamProject.lock"
    }

    fn sync_down_only(&self) -> Option<Arc<dyn NameFilter>> {
        SYNC_DOWN_ONLY_FILES
            .as_ref()
            .ok()
            .map(|files| Arc::new(files.clone()) as Arc<dyn NameFilter>)
    }
}

pub fn strategy_for(purpose: Purpose) -> Arc<dyn CollectionStrategy> {
    match purpose {
        Purpose::Dashboard => Arc::new(DashboardStrategy),
        Purpose::TeamData => Arc::new(TeamDataStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dashboard_includes() {
        let s = DashboardStrategy;
        assert!(s.includes("state"));
        assert!(s.includes("0.dat"));
        assert!(s.includes("cms/custom/page.xml"));
        assert!(!s.includes("dashlock.txt"));
        assert!(!s.includes("process.lock"));
        assert!(!s.includes("backup/pdash-startup.zip"));
        assert!(!s.includes("metadata/syncUpTimestamp"));
        assert!(!s.includes("state.tmp"));
    }

    #[test]
    fn test_team_data_includes() {
        let s = TeamDataStrategy;
        assert!(s.includes("projDump.xml"));
        assert!(s.includes("jdoe-data.pdash"));
        assert!(s.includes("settings.json"));
        assert!(!s.includes("teamProject.lock"));
        assert!(!s.includes("sub/projDump.xml"));
        assert!(!s.includes("image.png"));
    }

    #[test]
    fn test_team_data_patterns_compile() {
        assert!(TEAM_DATA_FILES.is_ok());
        assert!(SYNC_DOWN_ONLY_FILES.is_ok());
        assert!(TeamDataStrategy.includes("PROJDUMP.XML"));
    }

    #[test]
    fn test_team_data_sync_down_only() {
        let filter = TeamDataStrategy.sync_down_only().unwrap();
        assert!(filter.matches("jdoe-data.pdash"));
        assert!(!filter.matches("projDump.xml"));
        assert!(DashboardStrategy.sync_down_only().is_none());
    }

    #[test]
    fn test_possibly_corrupt() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.dat");
        let bad = dir.path().join("bad.dat");
        let empty = dir.path().join("empty.dat");
        std::fs::write(&good, b"a=1").unwrap();
        std::fs::write(&bad, [0u8, 0, 0, 0]).unwrap();
        std::fs::write(&empty, b"").unwrap();

        let s = DashboardStrategy;
        assert!(!s.is_file_possibly_corrupt(&good));
        assert!(s.is_file_possibly_corrupt(&bad));
        assert!(!s.is_file_possibly_corrupt(&empty));
        assert!(!s.is_file_possibly_corrupt(&dir.path().join("missing")));
    }
}
