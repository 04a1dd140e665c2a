//! Poll orchestration: instance ordering, fetch failover, webhook
//! notification, and the cycle driver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use roost_adapters::{extractor_for, is_challenge};
use roost_core::{Instance, Post, SourceKind, Target};
use roost_storage::{
    BackoffPolicy, Fetch, HttpClientConfig, HttpFetcher, InstanceRegistry, StateStore,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-sync";

/// Instances ranked in this many top slots are shuffled among themselves and
/// always tried before the (also shuffled) remainder.
pub const TOP_TIER: usize = 5;

/// User agents rotated when none is configured. Mirrors sit behind generic
/// bot filtering, so a browser string fares better than a crate name.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Mirror host -> canonical origin host, consulted once when rendering the
/// notification's "original post" link. Extend here when adding a mirror.
const MIRROR_HOST_REWRITES: &[(&str, &str)] = &[
    ("xcancel.com", "twitter.com"),
    ("nitter.net", "twitter.com"),
    ("nitter.privacyredirect.com", "twitter.com"),
    ("nitter.poast.org", "twitter.com"),
    ("nitter.hu", "twitter.com"),
    ("nitter.moomoo.me", "twitter.com"),
];

/// Rewrite a mirror permalink to the origin platform's canonical URL.
/// Unknown hosts pass through unchanged.
pub fn canonical_post_url(link: &str) -> String {
    let Ok(mut url) = Url::parse(link) else {
        return link.to_string();
    };
    let Some(host) = url.host_str().map(str::to_string) else {
        return link.to_string();
    };
    for (mirror, canonical) in MIRROR_HOST_REWRITES {
        if host == *mirror && url.set_host(Some(canonical)).is_ok() {
            url.set_fragment(None);
            return url.to_string();
        }
    }
    link.to_string()
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub targets: Vec<Target>,
    pub webhook_url: Option<String>,
    pub watch: bool,
    pub interval: Duration,
    pub interval_floor: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub state_file: PathBuf,
    pub instances_file: PathBuf,
    pub health_api: String,
    pub image_proxy: Option<String>,
    pub jitter_max: Duration,
    pub challenge_rechecks: usize,
    pub challenge_pause: Duration,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let env_secs = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let env_bool = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };

        Self {
            targets: Target::parse_list(
                &std::env::var("ROOST_TARGETS").unwrap_or_else(|_| "elonmusk".to_string()),
            ),
            webhook_url: std::env::var("ROOST_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            watch: env_bool("ROOST_WATCH"),
            interval: Duration::from_secs(env_secs("ROOST_INTERVAL_SECS", 300)),
            interval_floor: Duration::from_secs(env_secs("ROOST_INTERVAL_FLOOR_SECS", 30)),
            http_timeout: Duration::from_secs(env_secs("ROOST_HTTP_TIMEOUT_SECS", 45)),
            user_agent: std::env::var("ROOST_USER_AGENT").unwrap_or_else(|_| {
                USER_AGENTS
                    .choose(&mut rand::rng())
                    .copied()
                    .unwrap_or(USER_AGENTS[0])
                    .to_string()
            }),
            state_file: std::env::var("ROOST_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("last_seen.json")),
            instances_file: std::env::var("ROOST_INSTANCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("instances.json")),
            health_api: std::env::var("ROOST_HEALTH_API")
                .unwrap_or_else(|_| roost_storage::DEFAULT_HEALTH_API.to_string()),
            image_proxy: std::env::var("ROOST_IMAGE_PROXY").ok().filter(|v| !v.is_empty()),
            jitter_max: Duration::from_secs(env_secs("ROOST_JITTER_SECS", 2)),
            challenge_rechecks: env_secs("ROOST_CHALLENGE_RECHECKS", 2) as usize,
            challenge_pause: Duration::from_secs(env_secs("ROOST_CHALLENGE_PAUSE_SECS", 5)),
        }
    }
}

/// Which source kind to try first for a given target. Explicit policy:
/// searches hit rendered pages first because most mirrors rate-limit or
/// disable feed search; handle lookups prefer the cheap, stable feed.
pub fn source_priority(target: &Target) -> [SourceKind; 2] {
    if target.is_search() {
        [SourceKind::Page, SourceKind::Feed]
    } else {
        [SourceKind::Feed, SourceKind::Page]
    }
}

/// Order one kind's pool for a fetch attempt: sort by score descending,
/// shuffle the top tier and the remainder independently, concatenate. The
/// shuffle happens once per target — the resulting order is fixed for the
/// whole attempt.
pub fn tiered_shuffle(mut instances: Vec<Instance>, rng: &mut impl Rng) -> Vec<Instance> {
    instances.sort_by(|a, b| b.score.cmp(&a.score));
    if instances.len() > TOP_TIER {
        let mut rest = instances.split_off(TOP_TIER);
        instances.shuffle(rng);
        rest.shuffle(rng);
        instances.extend(rest);
    } else {
        instances.shuffle(rng);
    }
    instances
}

/// Bounds for the per-instance challenge wait-and-recheck loop.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub challenge_rechecks: usize,
    pub challenge_pause: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            challenge_rechecks: 2,
            challenge_pause: Duration::from_secs(5),
        }
    }
}

/// Try every candidate instance for `target`, in priority-randomized order,
/// until one yields a usable post. Individual instance failures (transport
/// errors, block pages, empty extractions) advance to the next candidate;
/// exhaustion returns `None` and is a normal outcome, not an error.
pub async fn fetch_latest(
    fetcher: &dyn Fetch,
    instances: &[Instance],
    target: &Target,
    policy: &FetchPolicy,
) -> Option<Post> {
    for kind in source_priority(target) {
        let pool: Vec<Instance> = instances.iter().filter(|i| i.kind == kind).cloned().collect();
        if pool.is_empty() {
            continue;
        }
        let ordered = tiered_shuffle(pool, &mut rand::rng());
        let extractor = extractor_for(kind);

        for instance in &ordered {
            let url = extractor.request_url(instance, target);

            let mut body = None;
            for attempt in 0..=policy.challenge_rechecks {
                let resp = match fetcher.get(&url).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        debug!(%target, url, error = %err, "instance fetch failed");
                        break;
                    }
                };
                let text = resp.text();
                if !is_challenge(&text) {
                    body = Some(text);
                    break;
                }
                if attempt < policy.challenge_rechecks {
                    debug!(%target, url, attempt, "challenge page; waiting before recheck");
                    tokio::time::sleep(policy.challenge_pause).await;
                } else {
                    debug!(%target, url, "challenge page persisted; moving on");
                }
            }
            let Some(body) = body else {
                continue;
            };

            match extractor.extract(&body, instance, target) {
                Ok(posts) => {
                    if let Some(post) = posts.into_iter().next() {
                        info!(
                            %target,
                            instance = instance.url,
                            kind = kind.as_str(),
                            id = post.id,
                            repost = post.is_repost,
                            "candidate extracted"
                        );
                        return Some(post);
                    }
                    debug!(%target, instance = instance.url, "no qualifying items");
                }
                Err(err) => {
                    debug!(%target, instance = instance.url, error = %err, "extraction failed");
                }
            }
        }
    }

    info!(%target, "all instances exhausted; no update this cycle");
    None
}

/// Downstream delivery seam. The dedup entry for a target only advances
/// when `notify` returns `Ok`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: &Target, post: &Post) -> Result<()>;
}

/// Posts a markdown payload to a webhook. Delivery success requires both a
/// 2xx transport status and `errcode == 0` in the response body.
pub struct WebhookNotifier {
    fetcher: Arc<dyn Fetch>,
    webhook_url: Option<String>,
    image_proxy: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        webhook_url: Option<String>,
        image_proxy: Option<String>,
    ) -> Self {
        Self {
            fetcher,
            webhook_url,
            image_proxy,
        }
    }

    fn image_reference(&self, image_url: &str) -> String {
        match &self.image_proxy {
            Some(proxy) => {
                let stripped = image_url
                    .trim_start_matches("https://")
                    .trim_start_matches("http://");
                let encoded: String =
                    url::form_urlencoded::byte_serialize(stripped.as_bytes()).collect();
                format!("{}?url={}", proxy.trim_end_matches('/'), encoded)
            }
            None => image_url.to_string(),
        }
    }

    fn render_markdown(&self, target: &Target, post: &Post) -> (String, String) {
        let action = if post.is_repost {
            "🔃 reposted"
        } else {
            "📝 posted"
        };

        let mut images_md = String::new();
        for image in &post.images {
            images_md.push_str(&format!("\n\n![image]({})", self.image_reference(image)));
        }
        let video_md = post
            .video_url
            .as_deref()
            .map(|v| format!("\n\n[🎬 video]({v})"))
            .unwrap_or_default();

        let title = format!("Feed watch: {target}");
        let text = format!(
            "## {target} {action}\n---\n**Author**: {}\n**Time**: {}\n\n> {}\n{images_md}{video_md}\n\n---\n[🔗 Mirror]({}) | [🔗 Original]({})",
            post.author,
            post.published,
            post.text,
            post.link,
            canonical_post_url(&post.link),
        );
        (title, text)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, target: &Target, post: &Post) -> Result<()> {
        let Some(webhook_url) = &self.webhook_url else {
            anyhow::bail!("no webhook URL configured");
        };

        let (title, text) = self.render_markdown(target, post);
        let payload = serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "title": title, "text": text },
        });

        let resp = self
            .fetcher
            .post_json(webhook_url, &payload)
            .await
            .context("posting webhook payload")?;
        let ack: serde_json::Value =
            serde_json::from_slice(&resp.body).context("parsing webhook response body")?;

        match ack.get("errcode").and_then(|v| v.as_i64()) {
            Some(0) => Ok(()),
            _ => anyhow::bail!("webhook rejected delivery: {ack}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: usize,
    pub notified: usize,
    pub unchanged: usize,
    pub misses: usize,
}

/// One sweep over all targets, plus the optional continuous loop.
pub struct PollDriver {
    config: WatchConfig,
    fetcher: Arc<dyn Fetch>,
    notifier: Arc<dyn Notifier>,
    registry: InstanceRegistry,
    state: StateStore,
}

impl PollDriver {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })?);
        let notifier = Arc::new(WebhookNotifier::new(
            fetcher.clone(),
            config.webhook_url.clone(),
            config.image_proxy.clone(),
        ));
        Ok(Self::with_parts(config, fetcher, notifier))
    }

    /// Assemble a driver from explicit parts; the test entry point.
    pub fn with_parts(
        config: WatchConfig,
        fetcher: Arc<dyn Fetch>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = InstanceRegistry::new(config.instances_file.clone());
        let state = StateStore::new(config.state_file.clone());
        Self {
            config,
            fetcher,
            notifier,
            registry,
            state,
        }
    }

    async fn jitter_sleep(&self) {
        let max_ms = self.config.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let wait = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        tokio::time::sleep(wait).await;
    }

    /// One sweep: for each target fetch the newest candidate, notify when
    /// its id differs from the stored one, and advance the entry only on
    /// notifier success. The state file is rewritten once, at the end, iff
    /// anything changed.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("poll_cycle", %run_id);

        async {
            let instances = self.registry.load().await;
            let mut map = self.state.load().await;
            let policy = FetchPolicy {
                challenge_rechecks: self.config.challenge_rechecks,
                challenge_pause: self.config.challenge_pause,
            };

            let mut notified = 0usize;
            let mut unchanged = 0usize;
            let mut misses = 0usize;
            let mut changed = false;

            for target in &self.config.targets {
                self.jitter_sleep().await;

                let Some(post) =
                    fetch_latest(self.fetcher.as_ref(), &instances, target, &policy).await
                else {
                    misses += 1;
                    continue;
                };

                let key = target.key();
                if !StateStore::is_new(&map, &key, &post.id) {
                    debug!(%target, id = post.id, "already seen; skipping");
                    unchanged += 1;
                    continue;
                }

                match self.notifier.notify(target, &post).await {
                    Ok(()) => {
                        info!(%target, id = post.id, "notified");
                        map.insert(key, post.id);
                        changed = true;
                        notified += 1;
                    }
                    Err(err) => {
                        // Entry not advanced: the item is retried next cycle.
                        warn!(%target, id = post.id, error = %err, "notification failed");
                    }
                }
            }

            if changed {
                if let Err(err) = self.state.commit(&map).await {
                    warn!(error = %err, "state commit failed; duplicates possible next run");
                }
            }

            Ok(CycleSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                targets: self.config.targets.len(),
                notified,
                unchanged,
                misses,
            })
        }
        .instrument(span)
        .await
    }

    /// Continuous mode: repeat cycles, sleeping `max(floor, interval −
    /// elapsed)` in between so an overrunning cycle still yields forward
    /// progress without a thundering restart.
    pub async fn run_watch(&self) -> Result<()> {
        loop {
            let cycle_start = Instant::now();
            match self.run_cycle().await {
                Ok(summary) => info!(
                    notified = summary.notified,
                    unchanged = summary.unchanged,
                    misses = summary.misses,
                    "cycle complete"
                ),
                Err(err) => warn!(error = %err, "cycle failed; continuing"),
            }

            let elapsed = cycle_start.elapsed();
            let pause = self
                .config
                .interval
                .saturating_sub(elapsed)
                .max(self.config.interval_floor);
            debug!(pause_secs = pause.as_secs(), "sleeping until next cycle");
            tokio::time::sleep(pause).await;
        }
    }
}
