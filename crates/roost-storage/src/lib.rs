//! Durable state, instance registry, and HTTP fetch utilities for Roostwatch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
pub use reqwest::StatusCode;
use roost_core::{Instance, SourceKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-storage";

/// Built-in fallback mirror hosts, used whenever the instance cache is
/// absent, unreadable, or empty. Order encodes preference.
pub const BUILTIN_MIRRORS: &[&str] = &[
    "https://xcancel.com",
    "https://nitter.privacyredirect.com",
    "https://nitter.poast.org",
    "https://nitter.hu",
    "https://nitter.moomoo.me",
    "https://nitter.net",
];

/// Public health-status API the instance cache is refreshed from.
pub const DEFAULT_HEALTH_API: &str = "https://status.d420.de/api/v1/instances";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Retry a couple of transient failures; used for registry refresh and
    /// webhook delivery, never for mirror fetches (failover handles those).
    pub fn transient() -> Self {
        Self {
            max_retries: 2,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // Anti-bot interstitials can stall a mirror response for many
            // seconds before it resolves, so the ceiling is generous.
            timeout: Duration::from_secs(45),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam between the orchestration layer and the network. The production
/// implementation is [`HttpFetcher`]; tests substitute canned responses.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError>;

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn send_with_retries(
        &self,
        url: &str,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, error = %err, attempt, "retrying fetch");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        // Unreachable unless the loop exhausted retries on request errors.
        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(url, |client| client.get(url)).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(url, |client| client.post(url).json(body))
            .await
    }
}

/// Write bytes to `path` through a temp file and rename, so readers never
/// observe a partial file and a crash mid-write leaves the old content.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
    }

    let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/// Target key -> last-seen post id.
pub type StateMap = BTreeMap<String, String>;

/// The sole durable state of the monitor: a JSON object mapping each raw
/// target string to the id of the last post notified for it.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full map. Missing or corrupt files are treated as empty
    /// state, never as a fatal error.
    pub async fn load(&self) -> StateMap {
        match fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "state file unreadable; starting from empty state"
                    );
                    StateMap::new()
                }
            },
            Err(_) => StateMap::new(),
        }
    }

    /// True iff `id` differs from the stored entry (or no entry exists).
    pub fn is_new(map: &StateMap, target_key: &str, id: &str) -> bool {
        map.get(target_key).map(String::as_str) != Some(id)
    }

    /// Persist the whole map atomically. Non-ASCII text is written as-is.
    pub async fn commit(&self, map: &StateMap) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(map).context("serializing state map")?;
        write_atomic(&self.path, &json).await?;
        debug!(path = %self.path.display(), entries = map.len(), "state committed");
        Ok(())
    }
}

/// One record in the instance cache file. The refresher writes scored
/// records; a bare array of URL strings is accepted as well since the cache
/// is external input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CachedInstance {
    Scored { url: String, points: i64 },
    Url(String),
}

/// Host entry from the public health-status API.
#[derive(Debug, Clone, Deserialize)]
struct HealthHost {
    url: String,
    #[serde(default)]
    healthy: bool,
    #[serde(default)]
    is_bad_host: bool,
    #[serde(default)]
    points: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct HealthFeed {
    #[serde(default)]
    hosts: Vec<HealthHost>,
}

/// Ranked mirror endpoints, loaded from an externally refreshed cache file
/// with the built-in list as a guaranteed non-empty fallback.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    cache_path: PathBuf,
}

impl InstanceRegistry {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
        }
    }

    /// The hard-coded fallback pool. Every mirror host serves both the
    /// rendered pages and the syndication feed, so each URL yields one
    /// instance per source kind. Scores descend with list position.
    pub fn builtin() -> Vec<Instance> {
        Self::materialize(
            BUILTIN_MIRRORS
                .iter()
                .enumerate()
                .map(|(idx, url)| (url.to_string(), (BUILTIN_MIRRORS.len() - idx) as i64)),
        )
    }

    fn materialize(hosts: impl Iterator<Item = (String, i64)>) -> Vec<Instance> {
        let mut out = Vec::new();
        for (url, score) in hosts {
            let url = url.trim_end_matches('/').to_string();
            out.push(Instance::new(url.clone(), SourceKind::Page, score));
            out.push(Instance::new(url, SourceKind::Feed, score));
        }
        out
    }

    /// Load the ranked instance list. Never fails: an absent, unreadable,
    /// or empty cache falls back to [`InstanceRegistry::builtin`].
    pub async fn load(&self) -> Vec<Instance> {
        let cached: Option<Vec<CachedInstance>> = match fs::read_to_string(&self.cache_path).await
        {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => Some(entries),
                Err(err) => {
                    warn!(
                        path = %self.cache_path.display(),
                        error = %err,
                        "instance cache unparsable; using built-in mirrors"
                    );
                    None
                }
            },
            Err(_) => None,
        };

        match cached {
            Some(entries) if !entries.is_empty() => {
                let count = entries.len();
                let instances = Self::materialize(entries.into_iter().enumerate().map(
                    |(idx, entry)| match entry {
                        CachedInstance::Scored { url, points } => (url, points),
                        CachedInstance::Url(url) => (url, (count - idx) as i64),
                    },
                ));
                debug!(hosts = count, "loaded instance cache");
                instances
            }
            Some(_) => {
                warn!(
                    path = %self.cache_path.display(),
                    "instance cache is empty; using built-in mirrors"
                );
                Self::builtin()
            }
            None => Self::builtin(),
        }
    }

    /// Maintenance job: query the health-status API, keep hosts that are
    /// healthy and not flagged bad, rank by points descending, and rewrite
    /// the cache file. Returns the number of hosts written.
    pub async fn refresh(&self, fetcher: &dyn Fetch, api_url: &str) -> anyhow::Result<usize> {
        let resp = fetcher
            .get(api_url)
            .await
            .with_context(|| format!("querying health API {api_url}"))?;
        let feed: HealthFeed =
            serde_json::from_slice(&resp.body).context("parsing health API payload")?;

        let mut hosts: Vec<HealthHost> = feed
            .hosts
            .into_iter()
            .filter(|h| h.healthy && !h.is_bad_host)
            .collect();
        hosts.sort_by(|a, b| b.points.cmp(&a.points));

        if hosts.is_empty() {
            anyhow::bail!("health API reported no healthy mirrors; keeping existing cache");
        }

        let records: Vec<CachedInstance> = hosts
            .into_iter()
            .map(|h| CachedInstance::Scored {
                url: h.url.trim_end_matches('/').to_string(),
                points: h.points,
            })
            .collect();
        let json = serde_json::to_vec_pretty(&records).context("serializing instance cache")?;
        write_atomic(&self.cache_path, &json).await?;

        info!(
            path = %self.cache_path.display(),
            hosts = records.len(),
            "instance cache refreshed"
        );
        Ok(records.len())
    }
}
