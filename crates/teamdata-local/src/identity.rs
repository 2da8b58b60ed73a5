use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

const READABLE_LEN: usize = 24;
const HASH_LEN: usize = 16;

/// Whether a location string names a server URL rather than a path.
pub fn is_url_format(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Canonical form of a location used for identity comparisons.
///
/// URLs drop their scheme distinction (`https` and `http` address the same
/// collection) and any trailing slash. Paths are made absolute and cleaned
/// lexically, so the result never depends on whether the path exists.
pub fn normalize_location(location: &str) -> String {
    if is_url_format(location) {
        let rest = location
            .strip_prefix("https://")
            .or_else(|| location.strip_prefix("http://"))
            .unwrap_or(location);
        format!("http://{}", rest.trim_end_matches('/'))
    } else {
        let normalized = clean_path(Path::new(location))
            .to_string_lossy()
            .replace('\\', "/");
        let trimmed = normalized.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
        if cfg!(windows) {
            trimmed.to_lowercase()
        } else {
            trimmed.to_string()
        }
    }
}

/// Absolute form of `path` with `.` and `..` resolved without following links.
fn clean_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Stable, filesystem-safe identifier for a location.
///
/// A sanitized readable name followed by a hash of the normalized location,
/// e.g. `myproject-3f2a9c0d1e4b5a69`.
pub fn working_directory_id(location: &str) -> String {
    let normalized = normalize_location(location);
    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));

    let last_segment = normalized
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("root");
    let readable: String = last_segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(READABLE_LEN)
        .collect();

    format!("{}-{}", readable, &digest[..HASH_LEN])
}
