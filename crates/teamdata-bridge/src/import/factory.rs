use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use teamdata_core::{CollectionStrategy, ImportDirectory};
use teamdata_local::{
    has_contents, is_url_format, normalize_location, working_directory_id, CachedImportDirectory,
    CachingLocalImportDirectory, LocalImportDirectory,
};
use tracing::{debug, info, instrument};

use super::bridged::BridgedImportDirectory;
use crate::selector::TeamServerSelector;

/// Matches every location in the cache preference lists.
pub const ALL_LOCATIONS: &str = "*";

fn matches_token(tokens: &[String], location: &str) -> bool {
    let location = location.to_lowercase();
    tokens
        .iter()
        .any(|token| token == ALL_LOCATIONS || location.contains(&token.to_lowercase()))
}

/// Resolves lists of candidate locations to import directories, handing out
/// one shared instance per location list.
pub struct ImportDirectoryFactory {
    selector: Arc<TeamServerSelector>,
    strategy: Arc<dyn CollectionStrategy>,
    cache_dir: PathBuf,
    base_directory: Option<PathBuf>,
    remappings: Vec<(String, PathBuf)>,
    prefer_caches_for: Vec<String>,
    no_caches_for: Vec<String>,
    home_dir: Option<PathBuf>,
    directories: DashMap<String, Arc<dyn ImportDirectory>>,
}

impl ImportDirectoryFactory {
    pub fn new(
        selector: Arc<TeamServerSelector>,
        strategy: Arc<dyn CollectionStrategy>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            selector,
            strategy,
            cache_dir: cache_dir.into(),
            base_directory: None,
            remappings: Vec::new(),
            prefer_caches_for: Vec::new(),
            no_caches_for: Vec::new(),
            home_dir: dirs::home_dir(),
            directories: DashMap::new(),
        }
    }

    /// Directory that `./` locations are relative to.
    pub fn with_base_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_directory = Some(dir.into());
        self
    }

    /// Serve locations starting with `prefix` from `replacement` instead.
    pub fn with_remapping(
        mut self,
        prefix: impl Into<String>,
        replacement: impl Into<PathBuf>,
    ) -> Self {
        self.remappings.push((prefix.into(), replacement.into()));
        self
    }

    /// Locations (substrings, or `*`) that use a cached copy before trying
    /// the live location.
    pub fn with_prefer_caches_for(mut self, tokens: Vec<String>) -> Self {
        self.prefer_caches_for = tokens;
        self
    }

    /// Locations (substrings, or `*`) whose local directories are never
    /// copied into the cache.
    pub fn with_no_caches_for(mut self, tokens: Vec<String>) -> Self {
        self.no_caches_for = tokens;
        self
    }

    /// Local directories under `home` are never cached.
    pub fn with_home_dir(mut self, home: Option<PathBuf>) -> Self {
        self.home_dir = home;
        self
    }

    fn cache_key(locations: &[&str]) -> String {
        locations
            .iter()
            .map(|location| normalize_location(location))
            .collect::<Vec<_>>()
            .join("|")
    }

    fn cache_dir_for(&self, location: &str) -> PathBuf {
        self.cache_dir.join(working_directory_id(location))
    }

    fn remap(&self, location: &str) -> Option<PathBuf> {
        let normalized = location.replace('\\', "/");
        self.remappings.iter().find_map(|(prefix, replacement)| {
            let prefix = prefix.replace('\\', "/");
            let rest = normalized.strip_prefix(prefix.trim_end_matches('/'))?;
            let rest = rest.trim_start_matches('/');
            let dir = if rest.is_empty() {
                replacement.clone()
            } else {
                replacement.join(rest)
            };
            dir.is_dir().then_some(dir)
        })
    }

    fn resolve_path(&self, location: &str) -> PathBuf {
        match (location.strip_prefix("./"), &self.base_directory) {
            (Some(rest), Some(base)) => base.join(rest),
            _ => PathBuf::from(location),
        }
    }

    fn caching_allowed(&self, path: &Path, location: &str) -> bool {
        if matches_token(&self.no_caches_for, location) {
            return false;
        }
        !self.home_dir.as_ref().is_some_and(|home| path.starts_with(home))
    }

    async fn bridged(&self, url: &str) -> Option<Arc<dyn ImportDirectory>> {
        let import = match BridgedImportDirectory::new(
            url,
            self.cache_dir_for(url),
            self.strategy.clone(),
        ) {
            Ok(import) => import,
            Err(e) => {
                debug!("Cannot use {}: {}", url, e);
                return None;
            }
        };
        match import.update().await {
            Ok(()) => Some(Arc::new(import)),
            Err(e) => {
                debug!("Cannot reach {}: {}", url, e);
                None
            }
        }
    }

    /// Look at the locations in order and settle on the best available
    /// directory; a viable cache is the fallback when nothing live answers.
    async fn resolve(&self, locations: &[&str]) -> Option<Arc<dyn ImportDirectory>> {
        let mut fallback: Option<Arc<dyn ImportDirectory>> = None;
        let mut missing: Option<PathBuf> = None;

        for location in locations {
            if let Some(dir) = self.remap(location) {
                debug!("Remapped {} to {}", location, dir.display());
                return Some(Arc::new(LocalImportDirectory::new(dir)));
            }

            if is_url_format(location) {
                let cached = CachedImportDirectory::new(*location, self.cache_dir_for(location));
                if cached.is_viable() {
                    if matches_token(&self.prefer_caches_for, location) {
                        return Some(Arc::new(cached));
                    }
                    if fallback.is_none() {
                        fallback = Some(Arc::new(cached));
                    }
                }
                if let Some(url) = self.selector.resolve_server_url(location).await {
                    if let Some(import) = self.bridged(&url).await {
                        return Some(import);
                    }
                }
                continue;
            }

            let path = self.resolve_path(location);
            let path_key = path.to_string_lossy().to_string();
            let cached =
                CachedImportDirectory::new(path_key.clone(), self.cache_dir_for(&path_key));
            if cached.is_viable() {
                if matches_token(&self.prefer_caches_for, location) {
                    return Some(Arc::new(cached));
                }
                if fallback.is_none() {
                    fallback = Some(Arc::new(cached));
                }
            }

            if path.is_dir() && has_contents(&path) {
                if let Some(url) = self.selector.get_server_url(&path, None).await {
                    if let Some(import) = self.bridged(&url).await {
                        return Some(import);
                    }
                }
                if self.caching_allowed(&path, location) {
                    let caching =
                        CachingLocalImportDirectory::new(&path, self.cache_dir_for(&path_key));
                    if let Err(e) = caching.update().await {
                        debug!("Unable to cache {}: {}", path.display(), e);
                    }
                    return Some(Arc::new(caching));
                }
                return Some(Arc::new(LocalImportDirectory::new(path)));
            }

            if let Some(default_url) = self.selector.default_url_for(&path) {
                let cached =
                    CachedImportDirectory::new(default_url.clone(), self.cache_dir_for(&default_url));
                if cached.is_viable() {
                    if matches_token(&self.prefer_caches_for, location)
                        || matches_token(&self.prefer_caches_for, &default_url)
                    {
                        return Some(Arc::new(cached));
                    }
                    if fallback.is_none() {
                        fallback = Some(Arc::new(cached));
                    }
                }
                if let Some(url) = self.selector.resolve_server_url(&default_url).await {
                    if let Some(import) = self.bridged(&url).await {
                        return Some(import);
                    }
                }
            }
            missing.get_or_insert(path);
        }

        fallback.or_else(|| {
            missing.map(|path| {
                Arc::new(LocalImportDirectory::new(path)) as Arc<dyn ImportDirectory>
            })
        })
    }

    /// The import directory for a list of candidate locations.
    ///
    /// Repeat requests for the same list share one instance, refreshed on
    /// each request; refresh failures leave the previous data in place.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, locations: &[&str]) -> Option<Arc<dyn ImportDirectory>> {
        if locations.is_empty() {
            return None;
        }
        let key = Self::cache_key(locations);

        let existing = self.directories.get(&key).map(|entry| entry.value().clone());
        if let Some(existing) = existing {
            if let Err(e) = existing.update().await {
                debug!("Refresh of {} failed: {}", existing.description(), e);
            }
            return Some(existing);
        }

        let resolved = self.resolve(locations).await?;
        info!("Importing {:?} from {}", locations, resolved.description());
        Some(self.directories.entry(key).or_insert(resolved).value().clone())
    }
}
