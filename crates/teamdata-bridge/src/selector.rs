use std::path::Path;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::{Client, Url};
use teamdata_core::Result;
use tracing::{debug, instrument, warn};

use crate::protocol::{
    http_error, server_version, version_at_least, ACTION_PARAM, CLIENT_VERSION,
    SESSION_START_INQUIRY, VERSION_PARAM,
};

/// File in a data directory listing the team server URLs that host it.
pub const POINTER_FILENAME: &str = "teamServer.xml";

/// Oldest server version probed through the default team server.
pub const DEFAULT_SERVER_MIN_VERSION: &str = "1.4";

const DISSEMINATION_DIR: &str = "disseminate";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of asking a URL whether it is a usable team server collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerProbe {
    Available {
        url: String,
        version: String,
        elapsed: Duration,
    },
    /// Something answered, but not a team server.
    NotATeamServer,
    TooOld { version: String },
    Unreachable(String),
}

/// Decides whether a directory is served by a team server, and which one.
#[derive(Debug, Clone)]
pub struct TeamServerSelector {
    http: Client,
    disabled: bool,
    default_team_server: Option<String>,
}

impl TeamServerSelector {
    pub fn new(default_team_server: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            http,
            disabled: false,
            default_team_server,
        })
    }

    /// Turn off every server lookup, so data is only ever used locally.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// URLs listed in a directory's pointer file, in file order.
    pub fn read_pointer_file(dir: &Path) -> Vec<String> {
        let path = dir.join(POINTER_FILENAME);
        let Ok(xml) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let doc = match roxmltree::Document::parse(&xml) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        doc.descendants()
            .filter(|n| n.has_tag_name("instance"))
            .filter_map(|n| n.attribute("url"))
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect()
    }

    /// Where the default team server would host a directory.
    ///
    /// Collections are named after the directory; a `disseminate` directory
    /// is named after its parent instead.
    pub fn default_url_for(&self, dir: &Path) -> Option<String> {
        let base = self.default_team_server.as_deref()?;
        let name = dir.file_name()?.to_string_lossy().to_string();
        let name = if name.eq_ignore_ascii_case(DISSEMINATION_DIR) {
            let parent = dir.parent()?.file_name()?.to_string_lossy().to_string();
            format!("{}-{}", parent, DISSEMINATION_DIR)
        } else {
            name
        };

        let mut url = Url::parse(base).ok()?;
        url.path_segments_mut().ok()?.pop_if_empty().push(&name);
        Some(url.to_string())
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn probe(&self, url: &str, min_version: Option<&str>) -> ServerProbe {
        let Ok(mut target) = Url::parse(url) else {
            return ServerProbe::Unreachable(format!("invalid URL {}", url));
        };
        target
            .query_pairs_mut()
            .append_pair(VERSION_PARAM, CLIENT_VERSION)
            .append_pair(ACTION_PARAM, SESSION_START_INQUIRY);

        let start = Instant::now();
        let resp = match self.http.get(target).send().await {
            Ok(resp) => resp,
            Err(e) => return ServerProbe::Unreachable(e.to_string()),
        };
        let elapsed = start.elapsed();

        let Some(version) = server_version(resp.headers()) else {
            return ServerProbe::NotATeamServer;
        };
        if !resp.status().is_success() {
            debug!("{} answered {}", url, resp.status());
            return ServerProbe::NotATeamServer;
        }
        if let Some(min) = min_version {
            if !version_at_least(&version, min) {
                return ServerProbe::TooOld { version };
            }
        }
        ServerProbe::Available {
            url: url.to_string(),
            version,
            elapsed,
        }
    }

    /// Probe every candidate concurrently and keep the fastest to respond.
    async fn fastest(&self, candidates: Vec<(String, Option<&str>)>) -> Option<String> {
        let probes = join_all(
            candidates
                .iter()
                .map(|(url, min_version)| self.probe(url, *min_version)),
        )
        .await;

        probes
            .into_iter()
            .filter_map(|probe| match probe {
                ServerProbe::Available { url, elapsed, .. } => Some((elapsed, url)),
                other => {
                    debug!("Skipping candidate: {:?}", other);
                    None
                }
            })
            .min_by_key(|(elapsed, _)| *elapsed)
            .map(|(_, url)| url)
    }

    /// The reachable server URL for a directory, if any.
    pub async fn get_server_url(&self, dir: &Path, min_version: Option<&str>) -> Option<String> {
        if self.disabled {
            return None;
        }
        let mut candidates: Vec<(String, Option<&str>)> = Self::read_pointer_file(dir)
            .into_iter()
            .map(|url| (url, min_version))
            .collect();
        if let Some(url) = self.default_url_for(dir) {
            let min = match min_version {
                Some(v) if version_at_least(v, DEFAULT_SERVER_MIN_VERSION) => v,
                _ => DEFAULT_SERVER_MIN_VERSION,
            };
            candidates.push((url, Some(min)));
        }
        if candidates.is_empty() {
            return None;
        }
        self.fastest(candidates).await
    }

    /// Like [`get_server_url`](Self::get_server_url), but a directory with a
    /// pointer file maps to its first URL even when no server answers.
    pub async fn get_server_url_offline_ok(&self, dir: &Path) -> Option<String> {
        if self.disabled {
            return None;
        }
        if let Some(url) = self.get_server_url(dir, None).await {
            return Some(url);
        }
        let first = Self::read_pointer_file(dir).into_iter().next();
        if let Some(url) = &first {
            debug!("No server answered for {}, using {}", dir.display(), url);
        }
        first
    }

    /// A working URL for a collection: the URL itself when it answers,
    /// otherwise the same collection on the default team server.
    pub async fn resolve_server_url(&self, url: &str) -> Option<String> {
        if self.disabled {
            return None;
        }
        if matches!(self.probe(url, None).await, ServerProbe::Available { .. }) {
            return Some(url.to_string());
        }

        let base = self.default_team_server.as_deref()?;
        let parsed = Url::parse(url).ok()?;
        let collection = parsed
            .path_segments()?
            .rfind(|segment| !segment.is_empty())?
            .to_string();
        let mut alternate = Url::parse(base).ok()?;
        alternate
            .path_segments_mut()
            .ok()?
            .pop_if_empty()
            .push(&collection);
        let alternate = alternate.to_string();
        if alternate == url {
            return None;
        }

        match self.probe(&alternate, None).await {
            ServerProbe::Available { url, .. } => Some(url),
            _ => None,
        }
    }
}
