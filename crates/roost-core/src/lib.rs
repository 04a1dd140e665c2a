//! Core domain model for Roostwatch.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "roost-core";

/// Prefix marking a target as a keyword search instead of a handle lookup.
pub const SEARCH_PREFIX: &str = "search:";

/// One monitoring unit: a feed handle or a keyword search.
///
/// Targets are configured as opaque strings; the `search:` prefix selects
/// keyword mode. The original configured string (prefix included) stays the
/// stable key in the dedup state file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Handle(String),
    Search(String),
}

impl Target {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().strip_prefix(SEARCH_PREFIX) {
            Some(query) => Target::Search(query.to_string()),
            None => Target::Handle(raw.trim().to_string()),
        }
    }

    /// Split a comma-separated target list, dropping empty segments.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Target::parse)
            .collect()
    }

    /// The handle or query text without the mode prefix.
    pub fn term(&self) -> &str {
        match self {
            Target::Handle(h) => h,
            Target::Search(q) => q,
        }
    }

    /// The raw configured form, used as the dedup-map key.
    pub fn key(&self) -> String {
        match self {
            Target::Handle(h) => h.clone(),
            Target::Search(q) => format!("{SEARCH_PREFIX}{q}"),
        }
    }

    pub fn is_search(&self) -> bool {
        matches!(self, Target::Search(_))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// How a mirror serves the feed: rendered HTML pages or a syndication feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Page,
    Feed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Page => "page",
            SourceKind::Feed => "feed",
        }
    }
}

/// One candidate mirror endpoint. Higher score means preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub url: String,
    pub kind: SourceKind,
    pub score: i64,
}

impl Instance {
    pub fn new(url: impl Into<String>, kind: SourceKind, score: i64) -> Self {
        Self {
            url: url.into(),
            kind,
            score,
        }
    }

    /// Base URL without a trailing slash, ready for path concatenation.
    pub fn base(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// A candidate post extracted from one mirror response.
///
/// `id` is the dedup key: the stable status identifier embedded in the
/// permalink, or the whole link when no identifier is extractable. Edits to
/// the same post keep the same id and do not re-trigger a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: String,
    pub text: String,
    pub link: String,
    pub published: String,
    pub is_repost: bool,
    pub images: Vec<String>,
    pub video_url: Option<String>,
}

/// Numeric status identifier from a permalink, e.g.
/// `/alice/status/1001#m` -> `1001`. `None` when the link has no
/// recognizable status segment; callers fall back to the raw link.
pub fn status_id(link: &str) -> Option<String> {
    let (_, rest) = link.split_once("/status/")?;
    let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Dedup id for a permalink: the status id when present, else the link itself.
pub fn dedup_id(link: &str) -> String {
    status_id(link).unwrap_or_else(|| link.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_targets_round_trip_their_key() {
        let t = Target::parse("alice");
        assert_eq!(t, Target::Handle("alice".into()));
        assert_eq!(t.term(), "alice");
        assert_eq!(t.key(), "alice");
        assert!(!t.is_search());
    }

    #[test]
    fn search_prefix_selects_keyword_mode() {
        let t = Target::parse("search:launch window");
        assert_eq!(t, Target::Search("launch window".into()));
        assert_eq!(t.term(), "launch window");
        assert_eq!(t.key(), "search:launch window");
        assert!(t.is_search());
    }

    #[test]
    fn target_list_skips_blank_segments() {
        let targets = Target::parse_list(" alice, ,search:launch,bob ");
        assert_eq!(
            targets,
            vec![
                Target::Handle("alice".into()),
                Target::Search("launch".into()),
                Target::Handle("bob".into()),
            ]
        );
    }

    #[test]
    fn status_id_strips_fragment_and_query() {
        assert_eq!(status_id("/alice/status/1001#m"), Some("1001".into()));
        assert_eq!(
            status_id("https://mirror.example/alice/status/2002?cursor=x"),
            Some("2002".into())
        );
        assert_eq!(status_id("/alice/with_replies"), None);
        assert_eq!(status_id("/alice/status/"), None);
    }

    #[test]
    fn dedup_id_falls_back_to_raw_link() {
        assert_eq!(dedup_id("/alice/status/1001#m"), "1001");
        assert_eq!(
            dedup_id("https://feedmirror.example/alice/rss-item-7"),
            "https://feedmirror.example/alice/rss-item-7"
        );
    }

    #[test]
    fn instance_base_trims_trailing_slash() {
        let i = Instance::new("https://mirror.example/", SourceKind::Page, 80);
        assert_eq!(i.base(), "https://mirror.example");
    }
}
