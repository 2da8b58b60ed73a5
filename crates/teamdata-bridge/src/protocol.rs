//! Wire vocabulary of the team server bridge: request parameters, actions,
//! response headers and the mapping of failure responses to errors.

use std::cmp::Ordering;

use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use teamdata_core::{LockFailure, Result, SyncError};
use tracing::debug;

/// Version this client reports in every request.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const VERSION_PARAM: &str = "v";
pub const ACTION_PARAM: &str = "action";
pub const EXTRA_INFO_PARAM: &str = "extraInfo";
pub const USER_ID_PARAM: &str = "userId";
pub const SOURCE_ID_PARAM: &str = "sourceId";
pub const EXTRA_LOCK_DATA_PARAM: &str = "extraLockData";
pub const INCLUDE_PARAM: &str = "include";
pub const EXCLUDE_PARAM: &str = "exclude";
pub const LAST_MOD_PARAM: &str = "lastMod";
pub const DELETE_FILE_PARAM: &str = "deleteFile";
pub const MOD_TIME_PARAM_PREFIX: &str = "modTime_";
pub const BACKUP_QUALIFIER_PARAM: &str = "backupQualifier";
pub const COLLECTION_TYPE_PARAM: &str = "collectionType";
pub const COLLECTION_ID_PARAM: &str = "collectionId";

pub const HASH_ACTION: &str = "hash";
pub const LIST_ACTION: &str = "list";
pub const DOWNLOAD_ACTION: &str = "download";
pub const UPLOAD_ACTION: &str = "upload";
pub const DELETE_ACTION: &str = "delete";
pub const ACQUIRE_LOCK_ACTION: &str = "acquireLock";
pub const PING_LOCK_ACTION: &str = "pingLock";
pub const ASSERT_LOCK_ACTION: &str = "assertLock";
pub const RELEASE_LOCK_ACTION: &str = "releaseLock";
pub const BACKUP_ACTION: &str = "backup";
pub const GET_BACKUP_ACTION: &str = "getBackup";
pub const NEW_COLLECTION_ACTION: &str = "newCollection";
pub const SESSION_START_INQUIRY: &str = "sessionStartInquiry";

/// Server version, sent on every bridge response.
pub const VERSION_HEADER: &str = "X-Bridge-Version";
/// Name of the lock exception raised on the server side.
pub const LOCK_EXCEPTION_HEADER: &str = "X-Lock-Exception";
/// Owner of a conflicting lock.
pub const LOCK_HOLDER_HEADER: &str = "X-Lock-Holder";

/// Archive entry describing the modification times of downloaded resources.
pub const MANIFEST_NAME: &str = "resourceManifest.xml";

/// GET requests longer than this are sent as form posts instead.
pub const MAX_URL_LENGTH: usize = 512;
/// Names requested per download call.
pub const DOWNLOAD_BATCH_SIZE: usize = 450;
/// Files sent per upload call.
pub const UPLOAD_BATCH_SIZE: usize = 50;

/// User ids longer than this are shortened and marked with `*`.
const MAX_USER_ID_LEN: usize = 15;

/// Shorten a user name to the length the server stores.
pub fn truncate_user_id(user: &str) -> String {
    if user.chars().count() > MAX_USER_ID_LEN {
        let mut short: String = user.chars().take(MAX_USER_ID_LEN - 1).collect();
        short.push('*');
        short
    } else {
        user.to_string()
    }
}

/// The login name of the current user, as reported to the server.
pub fn current_user_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    truncate_user_id(&user)
}

pub fn http_error(e: reqwest::Error) -> SyncError {
    SyncError::Http(e.to_string())
}

/// The server version advertised by a response, if any.
pub fn server_version(headers: &HeaderMap) -> Option<String> {
    headers
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Translate the lock exception headers of a refused request.
pub fn lock_failure_from_headers(headers: &HeaderMap) -> Option<LockFailure> {
    let exception = headers.get(LOCK_EXCEPTION_HEADER)?.to_str().ok()?.trim();
    // servers send qualified class names
    let kind = exception.rsplit(['.', '$']).next().unwrap_or(exception);
    let holder = headers
        .get(LOCK_HOLDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let failure = match kind {
        "AlreadyLockedException" => LockFailure::AlreadyLocked { holder },
        "NotLockedException" => LockFailure::NotLocked,
        "LockUncertainException" => LockFailure::Uncertain(exception.to_string()),
        "ReadOnlyLockFailure" | "ReadOnlyUrlException" => LockFailure::ReadOnlyUrl,
        _ => LockFailure::Other(exception.to_string()),
    };
    Some(failure)
}

/// Turn a failed bridge response into an error; pass successful ones through.
pub async fn check_response(resp: Response, action: &str, lock_action: bool) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if let Some(failure) = lock_failure_from_headers(resp.headers()) {
        debug!("{} refused with lock failure: {}", action, failure);
        return Err(failure.into());
    }
    if status == StatusCode::CONFLICT {
        return Err(LockFailure::Other(format!("{} returned {}", action, status)).into());
    }
    if status == StatusCode::FORBIDDEN && lock_action {
        return Err(LockFailure::ReadOnlyUrl.into());
    }

    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Http(format!(
        "{} failed with status {}: {}",
        action,
        status,
        body.trim()
    )))
}

/// Zero-pad every dotted component so versions compare as strings.
fn normalize_version(version: &str) -> String {
    version
        .trim()
        .split('.')
        .map(|part| format!("{:0>5}", part))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    normalize_version(a).cmp(&normalize_version(b))
}

/// Whether `version` is at least `min_version`.
pub fn version_at_least(version: &str, min_version: &str) -> bool {
    compare_versions(version, min_version) != Ordering::Less
}
