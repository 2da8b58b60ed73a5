//! In-process team server speaking the bridge protocol, for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Form, Router};
use teamdata_bridge::protocol::*;
use teamdata_core::{write_listing, ResourceCollectionInfo};
use teamdata_local::archive::{now_ms, ArchiveBuilder};
use tokio::net::TcpListener;

pub const SERVER_VERSION: &str = "3.9.0";
pub const COLLECTION_ID: &str = "abc123";

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub data: Vec<u8>,
    pub modified: i64,
}

#[derive(Debug, Default)]
struct LockState {
    /// Identity of the holder: extra lock data, else the owner name.
    token: String,
    owner: String,
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub files: BTreeMap<String, StoredFile>,
    lock: Option<LockState>,
    pub actions: Vec<String>,
    pub backups: Vec<String>,
}

#[derive(Clone)]
pub struct FakeTeamServer {
    /// Root of the server; collections live directly below it.
    pub base_url: String,
    /// The collection the tests work with.
    pub url: String,
    pub state: Arc<Mutex<ServerState>>,
}

impl FakeTeamServer {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(ServerState::default()));
        let app = Router::new()
            .route("/bridge/{collection}", any(handle))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/bridge", addr),
            url: format!("http://{}/bridge/{}", addr, COLLECTION_ID),
            state,
        }
    }

    pub fn put(&self, name: &str, data: &[u8], modified: i64) {
        self.state.lock().unwrap().files.insert(
            name.to_string(),
            StoredFile {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(name)
            .map(|f| f.data.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn lock_owner(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .lock
            .as_ref()
            .map(|l| l.owner.clone())
    }

    pub fn count(&self, action: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .actions
            .iter()
            .filter(|a| a.as_str() == action)
            .count()
    }

    pub fn backups(&self) -> Vec<String> {
        self.state.lock().unwrap().backups.clone()
    }
}

pub fn adler32(data: &[u8]) -> u64 {
    let mut hasher = adler2::Adler32::new();
    hasher.write_slice(data);
    u64::from(hasher.checksum())
}

struct Params(Vec<(String, String)>);

impl Params {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn lock_token(&self) -> String {
        self.get(EXTRA_LOCK_DATA_PARAM)
            .or_else(|| self.get(EXTRA_INFO_PARAM))
            .unwrap_or_default()
            .to_string()
    }
}

type Upload = (String, Vec<u8>);

async fn read_request(request: Request) -> Result<(Params, Vec<Upload>), StatusCode> {
    let mut params: Vec<(String, String)> = Query::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut uploads = Vec::new();
    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?
        {
            let name = field.name().unwrap_or_default().to_string();
            if field.file_name().is_some() {
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                uploads.push((name, data.to_vec()));
            } else {
                let value = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                params.push((name, value));
            }
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form): Form<Vec<(String, String)>> = Form::from_request(request, &())
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        params.extend(form);
    }
    Ok((Params(params), uploads))
}

fn header_name(name: &str) -> HeaderName {
    HeaderName::from_bytes(name.as_bytes()).unwrap()
}

fn with_version(mut response: Response) -> Response {
    response.headers_mut().insert(
        header_name(VERSION_HEADER),
        HeaderValue::from_static(SERVER_VERSION),
    );
    response
}

fn lock_error(exception: &str, holder: Option<&str>) -> Response {
    let mut response = StatusCode::CONFLICT.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("com.example.bridge.lock.{}", exception)) {
        headers.insert(header_name(LOCK_EXCEPTION_HEADER), value);
    }
    if let Some(value) = holder.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(header_name(LOCK_HOLDER_HEADER), value);
    }
    response
}

fn listing(state: &ServerState, params: &Params) -> ResourceCollectionInfo {
    let excluded = params.all(EXCLUDE_PARAM);
    let mut info = ResourceCollectionInfo::new();
    for (name, file) in &state.files {
        if !excluded.contains(name) {
            info.insert(name.clone(), Some(adler32(&file.data)), file.modified);
        }
    }
    info
}

fn download(state: &ServerState, params: &Params) -> Response {
    let includes = params.all(INCLUDE_PARAM);
    let last_mod: Option<i64> = params.get(LAST_MOD_PARAM).and_then(|v| v.parse().ok());
    let all = listing(state, params);

    let mut selected = ResourceCollectionInfo::new();
    for (name, entry) in all.iter() {
        let wanted = if !includes.is_empty() {
            includes.iter().any(|i| i == name)
        } else {
            last_mod.is_none_or(|since| entry.last_modified > since)
        };
        if wanted {
            selected.insert(name, entry.checksum, entry.last_modified);
        }
    }

    let mut builder = ArchiveBuilder::new();
    builder
        .add(MANIFEST_NAME, now_ms(), write_listing(&selected).as_bytes())
        .unwrap();
    for (name, entry) in selected.iter() {
        let file = &state.files[name];
        builder.add(name, entry.last_modified, &file.data).unwrap();
    }
    builder.finish().unwrap().into_response()
}

/// Whether a state-changing request may proceed given the current lock.
fn may_modify(state: &ServerState, params: &Params) -> bool {
    state
        .lock
        .as_ref()
        .is_none_or(|lock| lock.token == params.lock_token())
}

async fn handle(State(state): State<Arc<Mutex<ServerState>>>, request: Request) -> Response {
    let (params, uploads) = match read_request(request).await {
        Ok(parsed) => parsed,
        Err(status) => return with_version(status.into_response()),
    };
    let action = params.get(ACTION_PARAM).unwrap_or_default().to_string();

    let mut state = state.lock().unwrap();
    state.actions.push(action.clone());

    let response = match action.as_str() {
        HASH_ACTION => listing(&state, &params).listing_hashcode().to_string().into_response(),
        LIST_ACTION => write_listing(&listing(&state, &params)).into_response(),
        DOWNLOAD_ACTION => download(&state, &params),
        UPLOAD_ACTION => {
            if !may_modify(&state, &params) {
                lock_error("NotLockedException", None)
            } else {
                let mut uploaded = ResourceCollectionInfo::new();
                for (name, data) in uploads {
                    let modified = params
                        .get(&format!("{}{}", MOD_TIME_PARAM_PREFIX, name))
                        .and_then(|v| v.parse().ok())
                        .unwrap_or_else(now_ms);
                    uploaded.insert(name.clone(), Some(adler32(&data)), modified);
                    state.files.insert(name, StoredFile { data, modified });
                }
                write_listing(&uploaded).into_response()
            }
        }
        DELETE_ACTION => {
            if !may_modify(&state, &params) {
                lock_error("NotLockedException", None)
            } else {
                for name in params.all(DELETE_FILE_PARAM) {
                    state.files.remove(&name);
                }
                StatusCode::OK.into_response()
            }
        }
        ACQUIRE_LOCK_ACTION => {
            let token = params.lock_token();
            let holder = state
                .lock
                .as_ref()
                .filter(|lock| lock.token != token)
                .map(|lock| lock.owner.clone());
            match holder {
                Some(owner) => lock_error("AlreadyLockedException", Some(&owner)),
                None => {
                    let owner = params.get(EXTRA_INFO_PARAM).unwrap_or_default().to_string();
                    state.lock = Some(LockState { token, owner });
                    StatusCode::OK.into_response()
                }
            }
        }
        PING_LOCK_ACTION | ASSERT_LOCK_ACTION => match &state.lock {
            Some(lock) if lock.token == params.lock_token() => StatusCode::OK.into_response(),
            _ => lock_error("NotLockedException", None),
        },
        RELEASE_LOCK_ACTION => {
            if state
                .lock
                .as_ref()
                .is_some_and(|lock| lock.token == params.lock_token())
            {
                state.lock = None;
            }
            StatusCode::OK.into_response()
        }
        BACKUP_ACTION => {
            let qualifier = params
                .get(BACKUP_QUALIFIER_PARAM)
                .unwrap_or_default()
                .to_string();
            state.backups.push(qualifier);
            StatusCode::OK.into_response()
        }
        SESSION_START_INQUIRY => StatusCode::OK.into_response(),
        NEW_COLLECTION_ACTION => params
            .get(COLLECTION_ID_PARAM)
            .unwrap_or("x7k2")
            .to_string()
            .into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    };
    with_version(response)
}
