use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use teamdata_core::{
    is_default_excluded, parse_listing, LockFailure, NameFilter, ResourceCollection,
    ResourceCollectionDiff, ResourceCollectionInfo, Result, SyncError, SyncFilter,
    DEFAULT_EXCLUDE_FILENAMES,
};
use teamdata_local::archive::read_archive;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::protocol::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A resource received from the server.
#[derive(Debug)]
struct DownloadedResource {
    name: String,
    modified: i64,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct ClientState {
    /// Owner of the server lock, when held.
    user_name: Option<String>,
    extra_lock_data: Option<String>,
}

/// Keeps a local resource collection in sync with a collection on a team
/// server.
///
/// Public operations are serialized: only one sync or lock call runs against
/// the server at a time for a given client.
pub struct ResourceBridgeClient {
    http: Client,
    remote_url: Url,
    collection: Arc<dyn ResourceCollection>,
    sync_down_only: Option<Arc<dyn NameFilter>>,
    user_id: String,
    source_id: String,
    server_version: StdMutex<Option<String>>,
    state: Mutex<ClientState>,
}

impl std::fmt::Debug for ResourceBridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBridgeClient")
            .field("remote_url", &self.remote_url.as_str())
            .field("user_id", &self.user_id)
            .finish()
    }
}

fn parse_url(remote_url: &str) -> Result<Url> {
    Url::parse(remote_url)
        .map_err(|e| SyncError::Protocol(format!("Invalid server URL {}: {}", remote_url, e)))
}

fn build_http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(http_error)
}

fn exclude_params() -> Vec<(String, String)> {
    DEFAULT_EXCLUDE_FILENAMES
        .iter()
        .map(|name| (EXCLUDE_PARAM.to_string(), name.to_string()))
        .collect()
}

fn param(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

/// Unpack a download archive, taking modification times from the manifest
/// entry when the server includes one.
fn parse_download(bytes: &[u8]) -> Result<Vec<DownloadedResource>> {
    let entries = read_archive(bytes)?;
    let manifest = entries
        .iter()
        .find(|e| e.name == MANIFEST_NAME)
        .map(|e| parse_listing(&String::from_utf8_lossy(&e.data)))
        .transpose()?;

    Ok(entries
        .into_iter()
        .filter(|e| e.name != MANIFEST_NAME)
        .map(|e| {
            let modified = manifest
                .as_ref()
                .map(|m| m.last_modified(&e.name))
                .filter(|&m| m > 0)
                .unwrap_or(e.modified);
            DownloadedResource {
                name: e.name,
                modified,
                data: e.data,
            }
        })
        .collect())
}

impl ResourceBridgeClient {
    pub fn new(
        collection: Arc<dyn ResourceCollection>,
        remote_url: &str,
        sync_down_only: Option<Arc<dyn NameFilter>>,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
            remote_url: parse_url(remote_url)?,
            collection,
            sync_down_only,
            user_id: current_user_id(),
            source_id: teamdata_local::local_host_name(),
            server_version: StdMutex::new(None),
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn remote_url(&self) -> &str {
        self.remote_url.as_str()
    }

    /// The version reported by the server in its most recent response.
    pub fn server_version(&self) -> Option<String> {
        self.server_version.lock().ok().and_then(|v| v.clone())
    }

    /// Opaque value sent with lock requests to tell this dataset's locks apart
    /// from other datasets of the same user.
    pub async fn set_extra_lock_data(&self, data: Option<String>) {
        self.state.lock().await.extra_lock_data = data;
    }

    /// Owner of the server lock, if this client holds it.
    pub async fn lock_owner(&self) -> Option<String> {
        self.state.lock().await.user_name.clone()
    }

    fn record_version(&self, resp: &Response) {
        if let Some(version) = server_version(resp.headers()) {
            if let Ok(mut current) = self.server_version.lock() {
                *current = Some(version);
            }
        }
    }

    fn identity_params(&self, action: &str, state: &ClientState) -> Vec<(String, String)> {
        let mut params = vec![
            param(VERSION_PARAM, CLIENT_VERSION),
            param(ACTION_PARAM, action),
            param(USER_ID_PARAM, self.user_id.as_str()),
            param(SOURCE_ID_PARAM, self.source_id.as_str()),
        ];
        if let Some(owner) = &state.user_name {
            params.push(param(EXTRA_INFO_PARAM, owner.as_str()));
        }
        if let Some(extra) = &state.extra_lock_data {
            params.push(param(EXTRA_LOCK_DATA_PARAM, extra.as_str()));
        }
        params
    }

    /// Read-only request. Falls back to a form post when the query string
    /// would make the URL too long.
    async fn get(&self, action: &str, params: Vec<(String, String)>) -> Result<Response> {
        let mut all = vec![param(VERSION_PARAM, CLIENT_VERSION), param(ACTION_PARAM, action)];
        all.extend(params);

        let mut url = self.remote_url.clone();
        url.query_pairs_mut().extend_pairs(all.iter());
        let request = if url.as_str().len() > MAX_URL_LENGTH {
            debug!("{} request too long for GET, posting instead", action);
            self.http.post(self.remote_url.clone()).form(&all)
        } else {
            self.http.get(url)
        };

        let resp = request.send().await.map_err(http_error)?;
        self.record_version(&resp);
        check_response(resp, action, false).await
    }

    /// State-changing request carrying the caller's identity.
    async fn post(
        &self,
        action: &str,
        state: &ClientState,
        params: Vec<(String, String)>,
        lock_action: bool,
    ) -> Result<Response> {
        let mut form = self.identity_params(action, state);
        form.extend(params);

        let resp = self
            .http
            .post(self.remote_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(http_error)?;
        self.record_version(&resp);
        check_response(resp, action, lock_action).await
    }

    /// Local listing, minus the default excluded files.
    async fn local_listing(&self) -> Result<ResourceCollectionInfo> {
        let keep = |name: &str| !is_default_excluded(name);
        ResourceCollectionInfo::scan(self.collection.as_ref(), Some(&keep)).await
    }

    async fn remote_hash(&self) -> Result<i64> {
        let resp = self.get(HASH_ACTION, exclude_params()).await?;
        let body = resp.text().await.map_err(http_error)?;
        body.trim()
            .parse()
            .map_err(|_| SyncError::Protocol(format!("Unexpected hash response '{}'", body.trim())))
    }

    /// Remote listing, restricted to names the local collection can hold.
    async fn remote_listing(&self) -> Result<ResourceCollectionInfo> {
        let resp = self.get(LIST_ACTION, exclude_params()).await?;
        let body = resp.text().await.map_err(http_error)?;
        let listing = parse_listing(&body)?;
        let collection = self.collection.clone();
        Ok(listing.filtered(&move |name: &str| {
            collection.accepts(name) && !is_default_excluded(name)
        }))
    }

    async fn download(&self, params: Vec<(String, String)>) -> Result<Vec<DownloadedResource>> {
        let resp = self.get(DOWNLOAD_ACTION, params).await?;
        let bytes = resp.bytes().await.map_err(http_error)?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        parse_download(&bytes)
    }

    /// Write downloaded resources into the collection. Names the collection
    /// does not accept, and names the filter wants to keep local, are skipped.
    async fn store(
        &self,
        resources: Vec<DownloadedResource>,
        filter: Option<(&dyn SyncFilter, &ResourceCollectionInfo)>,
    ) -> Result<usize> {
        let mut written = 0;
        for resource in resources {
            if !self.collection.accepts(&resource.name) {
                debug!("Discarding unexpected resource {}", resource.name);
                continue;
            }
            if let Some((filter, local)) = filter {
                let local_time = local.last_modified(&resource.name);
                if !filter.should_sync(&resource.name, local_time, resource.modified) {
                    debug!("Keeping local copy of {}", resource.name);
                    continue;
                }
            }
            self.collection
                .write_resource(&resource.name, &resource.data, Some(resource.modified))
                .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn download_files(&self, names: &[String]) -> Result<usize> {
        let mut written = 0;
        for batch in names.chunks(DOWNLOAD_BATCH_SIZE) {
            let params = batch
                .iter()
                .map(|name| param(INCLUDE_PARAM, name.as_str()))
                .collect();
            let resources = self.download(params).await?;
            written += self.store(resources, None).await?;
        }
        debug!("Downloaded {} of {} requested files", written, names.len());
        Ok(written)
    }

    async fn upload_files(&self, state: &ClientState, names: &[String]) -> Result<usize> {
        let mut uploaded = 0;
        for batch in names.chunks(UPLOAD_BATCH_SIZE) {
            let mut form = Form::new();
            for (key, value) in self.identity_params(UPLOAD_ACTION, state) {
                form = form.text(key, value);
            }
            let mut count = 0;
            for name in batch {
                let Some(data) = self.collection.read_resource(name).await? else {
                    continue;
                };
                let modified = self.collection.last_modified(name).await?;
                form = form
                    .text(format!("{}{}", MOD_TIME_PARAM_PREFIX, name), modified.to_string())
                    .part(name.clone(), Part::bytes(data).file_name(name.clone()));
                count += 1;
            }
            if count == 0 {
                continue;
            }

            let resp = self
                .http
                .post(self.remote_url.clone())
                .multipart(form)
                .send()
                .await
                .map_err(http_error)?;
            self.record_version(&resp);
            check_response(resp, UPLOAD_ACTION, false).await?;
            uploaded += count;
        }
        debug!("Uploaded {} files", uploaded);
        Ok(uploaded)
    }

    async fn delete_remote(&self, state: &ClientState, names: &[String]) -> Result<()> {
        let params = names
            .iter()
            .map(|name| param(DELETE_FILE_PARAM, name.as_str()))
            .collect();
        self.post(DELETE_ACTION, state, params, false).await?;
        debug!("Deleted {} files from server", names.len());
        Ok(())
    }

    /// Bring the local collection up to date with the server.
    ///
    /// Differences the filter declines are left alone. Returns whether any
    /// local file was written or deleted.
    #[instrument(skip(self, filter), level = "debug", fields(url = %self.remote_url))]
    pub async fn sync_down(&self, filter: Option<&dyn SyncFilter>) -> Result<bool> {
        let _state = self.state.lock().await;
        self.collection.recheck_all_file_timestamps();

        let local = self.local_listing().await?;
        if local.listing_hashcode() == self.remote_hash().await? {
            debug!("Listing hashes match, nothing to download");
            return Ok(false);
        }

        let mut changed = false;
        if !local.is_empty() {
            let newer = self
                .download(vec![param(
                    LAST_MOD_PARAM,
                    local.latest_modification().to_string(),
                )])
                .await?;
            let keep_local = filter.map(|f| (f, &local));
            changed |= self.store(newer, keep_local).await? > 0;
        }

        let mut diff =
            ResourceCollectionDiff::new(self.local_listing().await?, self.remote_listing().await?);
        if let Some(filter) = filter {
            diff.apply_filter(filter);
        }
        if diff.no_differences_found() {
            return Ok(changed);
        }

        for name in diff.only_in_a() {
            self.collection.delete_resource(name).await?;
        }
        let wanted: Vec<String> = diff
            .only_in_b()
            .iter()
            .chain(diff.differing())
            .cloned()
            .collect();
        if !wanted.is_empty() {
            self.download_files(&wanted).await?;
        }

        info!(
            "Synced down {}: {} deleted, {} downloaded",
            self.remote_url,
            diff.only_in_a().len(),
            wanted.len()
        );
        Ok(true)
    }

    /// Push local changes to the server. Requires the server lock.
    ///
    /// Sync-down-only resources always take the server's copy. Differences the
    /// filter declines are left alone on both sides. Returns whether anything
    /// was changed on either side.
    #[instrument(skip(self, filter), level = "debug", fields(url = %self.remote_url))]
    pub async fn sync_up(&self, filter: Option<&dyn SyncFilter>) -> Result<bool> {
        let state = self.state.lock().await;
        if state.user_name.is_none() {
            return Err(LockFailure::NotLocked.into());
        }
        self.collection.recheck_all_file_timestamps();

        let mut diff =
            ResourceCollectionDiff::new(self.local_listing().await?, self.remote_listing().await?);
        if let Some(filter) = filter {
            diff.apply_filter(filter);
        }
        if diff.no_differences_found() {
            return Ok(false);
        }

        let sync_down_only = |name: &str| {
            self.sync_down_only
                .as_ref()
                .is_some_and(|filter| filter.matches(name))
        };

        let mut delete_remote = Vec::new();
        let mut delete_local = Vec::new();
        let mut upload = Vec::new();
        let mut download = Vec::new();
        for name in diff.only_in_b() {
            if sync_down_only(name) {
                download.push(name.clone());
            } else {
                delete_remote.push(name.clone());
            }
        }
        for name in diff.only_in_a() {
            if sync_down_only(name) {
                delete_local.push(name.clone());
            } else {
                upload.push(name.clone());
            }
        }
        for name in diff.differing() {
            if sync_down_only(name) {
                download.push(name.clone());
            } else {
                upload.push(name.clone());
            }
        }

        if !delete_remote.is_empty() {
            self.delete_remote(&state, &delete_remote).await?;
        }
        for name in &delete_local {
            self.collection.delete_resource(name).await?;
        }
        if !upload.is_empty() {
            self.upload_files(&state, &upload).await?;
        }
        if !download.is_empty() {
            self.download_files(&download).await?;
        }

        info!(
            "Synced up {}: {} uploaded, {} deleted remotely, {} refreshed",
            self.remote_url,
            upload.len(),
            delete_remote.len(),
            download.len() + delete_local.len()
        );
        Ok(true)
    }

    /// Upload the default excluded files that exist locally. Requires the
    /// server lock.
    pub async fn save_default_excluded_files(&self) -> Result<()> {
        let state = self.state.lock().await;
        if state.user_name.is_none() {
            return Err(LockFailure::NotLocked.into());
        }
        let mut present = Vec::new();
        for name in DEFAULT_EXCLUDE_FILENAMES {
            if self.collection.read_resource(name).await?.is_some() {
                present.push(name.to_string());
            }
        }
        if !present.is_empty() {
            self.upload_files(&state, &present).await?;
        }
        Ok(())
    }

    /// Lock the server collection on behalf of `owner`.
    #[instrument(skip(self), level = "debug", fields(url = %self.remote_url))]
    pub async fn acquire_lock(&self, owner: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.user_name = Some(owner.to_string());
        match self.post(ACQUIRE_LOCK_ACTION, &state, Vec::new(), true).await {
            Ok(_) => {
                info!("{} locked {}", owner, self.remote_url);
                Ok(())
            }
            Err(e) => {
                state.user_name = None;
                Err(match e {
                    SyncError::Lock(_) => e,
                    other => LockFailure::Other(other.to_string()).into(),
                })
            }
        }
    }

    /// Keep the server lock alive.
    pub async fn ping_lock(&self) -> Result<()> {
        self.check_lock(PING_LOCK_ACTION).await
    }

    /// Verify with the server that the lock is still held.
    pub async fn assert_lock(&self) -> Result<()> {
        self.check_lock(ASSERT_LOCK_ACTION).await
    }

    async fn check_lock(&self, action: &str) -> Result<()> {
        let state = self.state.lock().await;
        if state.user_name.is_none() {
            return Err(LockFailure::NotLocked.into());
        }
        match self.post(action, &state, Vec::new(), true).await {
            Ok(_) => Ok(()),
            Err(SyncError::Lock(failure)) => Err(failure.into()),
            // the lock may be fine; only the server is unreachable
            Err(e) => Err(LockFailure::Uncertain(e.to_string()).into()),
        }
    }

    /// Release the server lock. Failures are logged, never returned.
    pub async fn release_lock(&self) {
        let mut state = self.state.lock().await;
        if state.user_name.is_none() {
            return;
        }
        if let Err(e) = self.post(RELEASE_LOCK_ACTION, &state, Vec::new(), true).await {
            warn!("Unable to release lock on {}: {}", self.remote_url, e);
        }
        state.user_name = None;
    }

    /// Ask the server to back up the collection, returning the URL from which
    /// the backup can be fetched.
    pub async fn do_backup(&self, qualifier: &str) -> Result<String> {
        let state = self.state.lock().await;
        match self
            .post(
                BACKUP_ACTION,
                &state,
                vec![param(BACKUP_QUALIFIER_PARAM, qualifier)],
                false,
            )
            .await
        {
            Ok(_) => {}
            Err(SyncError::Lock(failure)) => {
                warn!("Backup of {} refused: {}", self.remote_url, failure)
            }
            Err(e) => return Err(e),
        }

        let mut url = self.remote_url.clone();
        url.query_pairs_mut()
            .append_pair(VERSION_PARAM, CLIENT_VERSION)
            .append_pair(ACTION_PARAM, GET_BACKUP_ACTION);
        Ok(url.to_string())
    }

    /// Upload one file to a collection without syncing or locking. Returns
    /// the checksum the server computed, when it reports one.
    pub async fn upload_single_file(
        remote_url: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<Option<u64>> {
        let url = parse_url(remote_url)?;
        let form = Form::new()
            .text(VERSION_PARAM, CLIENT_VERSION)
            .text(ACTION_PARAM, UPLOAD_ACTION)
            .text(USER_ID_PARAM, current_user_id())
            .part(name.to_string(), Part::bytes(data).file_name(name.to_string()));

        let resp = build_http_client()?
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(http_error)?;
        let resp = check_response(resp, UPLOAD_ACTION, false).await?;
        let body = resp.text().await.map_err(http_error)?;
        Ok(parse_listing(&body).ok().and_then(|l| l.checksum(name)))
    }

    /// Delete one file from a collection without syncing or locking.
    pub async fn delete_single_file(remote_url: &str, name: &str) -> Result<()> {
        let url = parse_url(remote_url)?;
        let form = [
            param(VERSION_PARAM, CLIENT_VERSION),
            param(ACTION_PARAM, DELETE_ACTION),
            param(USER_ID_PARAM, current_user_id()),
            param(DELETE_FILE_PARAM, name),
        ];
        let resp = build_http_client()?
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(http_error)?;
        check_response(resp, DELETE_ACTION, false).await?;
        Ok(())
    }

    /// Create a collection on the server, returning its id.
    pub async fn create_new_collection(
        remote_url: &str,
        collection_type: &str,
        desired_id: Option<&str>,
    ) -> Result<String> {
        let url = parse_url(remote_url)?;
        let mut form = vec![
            param(VERSION_PARAM, CLIENT_VERSION),
            param(ACTION_PARAM, NEW_COLLECTION_ACTION),
            param(COLLECTION_TYPE_PARAM, collection_type),
        ];
        if let Some(id) = desired_id {
            form.push(param(COLLECTION_ID_PARAM, id));
        }

        let resp = build_http_client()?
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(http_error)?;
        let resp = check_response(resp, NEW_COLLECTION_ACTION, false).await?;
        let id = resp.text().await.map_err(http_error)?.trim().to_string();
        if is_valid_collection_id(&id) {
            Ok(id)
        } else {
            Err(SyncError::Protocol(format!(
                "Server returned invalid collection id '{}'",
                id
            )))
        }
    }
}

fn is_valid_collection_id(id: &str) -> bool {
    (1..=10).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamdata_core::DashboardStrategy;
    use teamdata_local::archive::ArchiveBuilder;
    use teamdata_local::FileResourceCollection;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(dir: &TempDir, url: &str) -> ResourceBridgeClient {
        let collection = Arc::new(FileResourceCollection::new(
            dir.path(),
            Arc::new(DashboardStrategy),
        ));
        ResourceBridgeClient::new(collection, url, None).unwrap()
    }

    #[test]
    fn test_collection_id_validation() {
        assert!(is_valid_collection_id("a1b2c3"));
        assert!(!is_valid_collection_id(""));
        assert!(!is_valid_collection_id("ABC"));
        assert!(!is_valid_collection_id("abcdefghijk"));
    }

    #[test]
    fn test_parse_download_prefers_manifest_times() {
        let mut builder = ArchiveBuilder::new();
        builder
            .add(
                MANIFEST_NAME,
                0,
                br#"<resourceList><resource name="state" mod="1700000000123" sum="1"/></resourceList>"#,
            )
            .unwrap();
        builder.add("state", 1_600_000_000_000, b"a=1").unwrap();
        builder.add("global.dat", 1_600_000_000_000, b"x").unwrap();
        let bytes = builder.finish().unwrap();

        let resources = parse_download(&bytes).unwrap();
        assert_eq!(resources.len(), 2);
        let state = resources.iter().find(|r| r.name == "state").unwrap();
        assert_eq!(state.modified, 1_700_000_000_123);
        let global = resources.iter().find(|r| r.name == "global.dat").unwrap();
        assert_eq!(global.modified, 1_600_000_000_000);
    }

    #[tokio::test]
    async fn test_acquire_lock_reports_holder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=acquireLock"))
            .respond_with(
                ResponseTemplate::new(409)
                    .insert_header(LOCK_EXCEPTION_HEADER, "bridge.AlreadyLockedException")
                    .insert_header(LOCK_HOLDER_HEADER, "Jane Doe"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&dir, &server.uri());
        let err = client.acquire_lock("John Roe").await.unwrap_err();
        assert_eq!(
            err.lock_failure(),
            Some(&LockFailure::AlreadyLocked {
                holder: Some("Jane Doe".to_string())
            })
        );
        assert!(client.lock_owner().await.is_none());
    }

    #[tokio::test]
    async fn test_forbidden_lock_means_read_only_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&dir, &server.uri());
        let err = client.acquire_lock("Jane Doe").await.unwrap_err();
        assert_eq!(err.lock_failure(), Some(&LockFailure::ReadOnlyUrl));
    }

    #[tokio::test]
    async fn test_ping_without_server_is_uncertain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=acquireLock"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=pingLock"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&dir, &server.uri());
        assert!(matches!(
            client.ping_lock().await.unwrap_err().lock_failure(),
            Some(LockFailure::NotLocked)
        ));

        client.acquire_lock("Jane Doe").await.unwrap();
        assert!(matches!(
            client.ping_lock().await.unwrap_err().lock_failure(),
            Some(LockFailure::Uncertain(_))
        ));
    }

    #[tokio::test]
    async fn test_long_download_request_is_posted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::new()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&dir, &server.uri());
        let names: Vec<String> = (0..40)
            .map(|i| format!("some/rather/long/resource/name-{}.dat", i))
            .collect();
        assert_eq!(client.download_files(&names).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_fast_path_skips_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("action", "hash"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(VERSION_HEADER, "3.9.0")
                    .set_body_string("0"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("action", "list"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        // an empty collection hashes to zero
        let dir = TempDir::new().unwrap();
        let client = client(&dir, &server.uri());
        assert!(!client.sync_down(None).await.unwrap());
        assert_eq!(client.server_version().as_deref(), Some("3.9.0"));
    }

    #[tokio::test]
    async fn test_sync_up_requires_lock() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir, "http://127.0.0.1:9/collection");
        assert!(matches!(
            client.sync_up(None).await.unwrap_err().lock_failure(),
            Some(LockFailure::NotLocked)
        ));
    }

    struct KeepPrefix(&'static str);

    impl SyncFilter for KeepPrefix {
        fn should_sync(&self, name: &str, _local: i64, _remote: i64) -> bool {
            name.starts_with(self.0)
        }
    }

    #[tokio::test]
    async fn test_sync_up_leaves_filtered_files_alone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=acquireLock"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("action", "list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<resourceList><resource name="skip-remote.dat" mod="1600000000000" sum="7"/></resourceList>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("filename=\"keep.dat\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=delete"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.dat"), "k").unwrap();
        std::fs::write(dir.path().join("skip.dat"), "s").unwrap();
        let client = client(&dir, &server.uri());
        client.acquire_lock("Jane Doe").await.unwrap();

        assert!(client.sync_up(Some(&KeepPrefix("keep"))).await.unwrap());

        let requests = server.received_requests().await.unwrap();
        assert!(requests
            .iter()
            .all(|r| !String::from_utf8_lossy(&r.body).contains("skip.dat")));
        assert!(dir.path().join("skip.dat").exists());
    }

    #[tokio::test]
    async fn test_create_new_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("action=newCollection"))
            .respond_with(ResponseTemplate::new(200).set_body_string("k3x9\n"))
            .mount(&server)
            .await;

        let id = ResourceBridgeClient::create_new_collection(&server.uri(), "teamdata", None)
            .await
            .unwrap();
        assert_eq!(id, "k3x9");
    }

    #[tokio::test]
    async fn test_do_backup_returns_fetch_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("backupQualifier=startup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&dir, &format!("{}/bridge/abc", server.uri()));
        let url = client.do_backup("startup").await.unwrap();
        assert!(url.starts_with(&format!("{}/bridge/abc?", server.uri())));
        assert!(url.ends_with("action=getBackup"));
    }
}
