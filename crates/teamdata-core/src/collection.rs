use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::NameFilter;

/// A set of named resources with modification times and checksums.
///
/// Resource names are relative paths using `/` as the separator. Timestamps
/// are milliseconds since the Unix epoch, with `0` meaning "absent".
#[async_trait]
pub trait ResourceCollection: Send + Sync {
    /// Names of all resources currently in the collection.
    async fn list_resource_names(&self) -> Result<Vec<String>>;

    /// Last modification time of a resource, or 0 if it does not exist.
    async fn last_modified(&self, name: &str) -> Result<i64>;

    /// Checksum of a resource, or None if it does not exist.
    async fn checksum(&self, name: &str) -> Result<Option<u64>>;

    /// Contents of a resource, or None if it does not exist.
    async fn read_resource(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace a resource, optionally stamping its modification time.
    async fn write_resource(&self, name: &str, data: &[u8], modified: Option<i64>) -> Result<()>;

    /// Delete a resource. Deleting a missing resource is not an error.
    async fn delete_resource(&self, name: &str) -> Result<()>;

    /// Check that the collection is usable (e.g. its directory exists).
    async fn validate(&self) -> Result<()>;

    /// Forget any cached timestamps/checksums so the next listing rescans.
    fn recheck_all_file_timestamps(&self);

    /// Whether a resource with this name may live in the collection.
    fn accepts(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEntry {
    pub checksum: Option<u64>,
    pub last_modified: i64,
}

/// Snapshot of a collection listing: name -> (checksum, last modified).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceCollectionInfo {
    entries: BTreeMap<String, ResourceEntry>,
}

impl ResourceCollectionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a collection, keeping only names accepted by `filter`.
    pub async fn scan(
        collection: &dyn ResourceCollection,
        filter: Option<&dyn NameFilter>,
    ) -> Result<Self> {
        let mut info = Self::new();
        for name in collection.list_resource_names().await? {
            if filter.is_some_and(|f| !f.matches(&name)) {
                continue;
            }
            let last_modified = collection.last_modified(&name).await?;
            let checksum = collection.checksum(&name).await?;
            // vanished between listing and stat
            if checksum.is_none() && last_modified == 0 {
                continue;
            }
            info.insert(name, checksum, last_modified);
        }
        Ok(info)
    }

    pub fn insert(&mut self, name: impl Into<String>, checksum: Option<u64>, last_modified: i64) {
        self.entries.insert(
            name.into(),
            ResourceEntry {
                checksum,
                last_modified,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ResourceEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn checksum(&self, name: &str) -> Option<u64> {
        self.entries.get(name).and_then(|e| e.checksum)
    }

    /// Modification time of a resource, or 0 when it is not listed.
    pub fn last_modified(&self, name: &str) -> i64 {
        self.entries.get(name).map_or(0, |e| e.last_modified)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResourceEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest modification time in the listing, or 0 for an empty listing.
    pub fn latest_modification(&self) -> i64 {
        self.entries
            .values()
            .map(|e| e.last_modified)
            .max()
            .unwrap_or(0)
    }

    /// A copy of this listing restricted to names accepted by `filter`.
    pub fn filtered(&self, filter: &dyn NameFilter) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(name, _)| filter.matches(name))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Order-independent hash of names and checksums.
    ///
    /// Names are folded in lowercase so that servers on case-insensitive
    /// filesystems produce the same value.
    pub fn listing_hashcode(&self) -> i64 {
        let mut hash: i64 = 0;
        for (name, entry) in &self.entries {
            hash ^= java_string_hash(&name.to_lowercase()) as i64;
            if let Some(sum) = entry.checksum {
                hash ^= sum as i64;
            }
        }
        hash
    }
}

/// 32-bit string hash over UTF-16 code units (`h = 31 * h + c`).
pub fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}
