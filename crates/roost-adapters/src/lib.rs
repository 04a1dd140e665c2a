//! Source extraction: rendered-page and syndication-feed mirrors, challenge
//! detection, and media URL normalization.

use roost_core::{dedup_id, Instance, Post, SourceKind, Target};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "roost-adapters";

/// How many leading timeline items a page extraction pass may inspect while
/// looking for the first non-pinned post.
pub const SCAN_LIMIT: usize = 8;

/// Canonical host the origin platform serves post images from.
pub const CANONICAL_IMAGE_HOST: &str = "pbs.twimg.com";

/// Canonical host the origin platform serves video from.
pub const CANONICAL_VIDEO_HOST: &str = "video.twimg.com";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("feed parse failed: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),
}

/// Substrings that identify an anti-bot interstitial or an explicit mirror
/// rejection instead of usable feed content.
const CHALLENGE_MARKERS: &[&str] = &[
    "Verifying your browser",
    "Checking your browser before accessing",
    "Just a moment...",
    "cf-browser-verification",
    "challenge-platform",
    "Making sure you're not a bot",
    "Instance has been rate limited",
    "not yet permitted",
];

/// Classify a raw response body as blocked/anti-bot vs usable. Empty bodies
/// count as blocked.
pub fn is_challenge(body: &str) -> bool {
    body.trim().is_empty() || CHALLENGE_MARKERS.iter().any(|m| body.contains(m))
}

fn percent_decode(input: &str) -> String {
    // Operates on raw bytes: a `%` may be followed by anything in mirror
    // markup, including multibyte UTF-8, so no string slicing here.
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn looks_like_hex(segment: &str) -> bool {
    segment.len() >= 8 && segment.len() % 2 == 0 && segment.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Rewrite a mirror's media-proxy URL back to the origin platform's
/// canonical media host wherever a decodable identifier is recoverable:
/// an embedded canonical-host substring, a hex-encoded path segment, or a
/// `media/<id>.<ext>` segment. Unrecognized URLs are returned unchanged.
pub fn normalize_media_url(url: &str) -> String {
    let decoded = percent_decode(url);

    // Embedded canonical host, e.g. proxy?url=pbs.twimg.com/media/X.jpg
    for host in [CANONICAL_IMAGE_HOST, CANONICAL_VIDEO_HOST] {
        if let Some(idx) = decoded.find(host) {
            return format!("https://{}", &decoded[idx..]);
        }
    }

    // Hex-encoded segment that decodes to a canonical URL or media path.
    for segment in decoded.split('/') {
        if !looks_like_hex(segment) {
            continue;
        }
        let Ok(bytes) = hex::decode(segment) else {
            continue;
        };
        let Ok(text) = String::from_utf8(bytes) else {
            continue;
        };
        if text.starts_with("http://") || text.starts_with("https://") {
            return text;
        }
        if text.starts_with("media/") {
            return format!("https://{CANONICAL_IMAGE_HOST}/{text}");
        }
        if text.starts_with("video/") || text.ends_with(".mp4") {
            return format!("https://{CANONICAL_VIDEO_HOST}/{text}");
        }
    }

    // Plain /media/<id>.<ext> proxy path.
    if let Some(idx) = decoded.find("/media/") {
        let tail = &decoded[idx + 1..];
        let id = tail.trim_start_matches("media/");
        if !id.is_empty() && id.contains('.') && !id.contains('/') {
            return format!("https://{CANONICAL_IMAGE_HOST}/{tail}");
        }
    }

    url.to_string()
}

/// Resolve a possibly relative reference against a mirror base URL.
fn resolve_link(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => format!("{}{}", base.trim_end_matches('/'), href),
    }
}

/// Parser for one mirror flavor: builds the request URL for a target and
/// extracts candidate posts (newest first) from a raw response body.
///
/// `extract` returns at most one post under the current policy — the most
/// recent non-pinned item — but the signature is a sequence so a multi-item
/// policy stays a local change.
pub trait SourceExtractor: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn request_url(&self, instance: &Instance, target: &Target) -> String;

    fn extract(
        &self,
        body: &str,
        instance: &Instance,
        target: &Target,
    ) -> Result<Vec<Post>, ExtractError>;
}

pub fn extractor_for(kind: SourceKind) -> &'static dyn SourceExtractor {
    match kind {
        SourceKind::Page => &PageExtractor,
        SourceKind::Feed => &FeedExtractor,
    }
}

fn encode_query(term: &str) -> String {
    url::form_urlencoded::byte_serialize(term.as_bytes()).collect()
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(e.to_string()))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn has_ancestor_class(el: ElementRef<'_>, class: &str) -> bool {
    el.ancestors().any(|node| {
        ElementRef::wrap(node)
            .map(|e| e.value().classes().any(|c| c == class))
            .unwrap_or(false)
    })
}

fn is_decorative_asset(src: &str) -> bool {
    src.contains("/emoji/") || src.ends_with(".svg")
}

/// Rendered-markup mirror: parses the timeline HTML the way a browser sees
/// it. Pinned detection is structural (`.pinned` marker) — the literal word
/// can legitimately occur inside post text.
#[derive(Debug, Clone, Copy)]
pub struct PageExtractor;

impl PageExtractor {
    fn extract_images(item: ElementRef<'_>, base: &str) -> Result<Vec<String>, ExtractError> {
        let img_sel = selector(".attachment.image img, .tweet-image img")?;
        let mut images = Vec::new();
        for img in item.select(&img_sel) {
            if has_ancestor_class(img, "avatar") || has_ancestor_class(img, "tweet-avatar") {
                continue;
            }
            let Some(src) = img.value().attr("src") else {
                continue;
            };
            if src.is_empty() || is_decorative_asset(src) {
                continue;
            }
            images.push(normalize_media_url(&resolve_link(base, src)));
        }
        Ok(images)
    }

    fn extract_video(
        item: ElementRef<'_>,
        base: &str,
    ) -> Result<(Option<String>, Option<String>), ExtractError> {
        let video_sel = selector(".attachment video, .video-container video")?;
        let source_sel = selector("source")?;

        let Some(video) = item.select(&video_sel).next() else {
            return Ok((None, None));
        };

        let src = video
            .value()
            .attr("data-url")
            .or_else(|| video.value().attr("src"))
            .map(str::to_string)
            .or_else(|| {
                video
                    .select(&source_sel)
                    .next()
                    .and_then(|s| s.value().attr("src"))
                    .map(str::to_string)
            })
            .map(|s| normalize_media_url(&resolve_link(base, &s)));

        let poster = video
            .value()
            .attr("poster")
            .filter(|p| !p.is_empty())
            .map(|p| normalize_media_url(&resolve_link(base, p)));

        Ok((src, poster))
    }
}

impl SourceExtractor for PageExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Page
    }

    fn request_url(&self, instance: &Instance, target: &Target) -> String {
        match target {
            Target::Handle(handle) => format!("{}/{}", instance.base(), handle),
            Target::Search(query) => format!(
                "{}/search?f=tweets&q={}",
                instance.base(),
                encode_query(query)
            ),
        }
    }

    fn extract(
        &self,
        body: &str,
        instance: &Instance,
        target: &Target,
    ) -> Result<Vec<Post>, ExtractError> {
        let document = Html::parse_document(body);
        let item_sel = selector(".timeline-item")?;
        let pinned_sel = selector(".pinned")?;
        let content_sel = selector(".tweet-content")?;
        let link_sel = selector("a.tweet-link")?;
        let date_sel = selector(".tweet-date a")?;
        let author_sel = selector(".username")?;
        let repost_sel = selector(".retweet-header")?;

        let base = instance.base();

        for item in document.select(&item_sel).take(SCAN_LIMIT) {
            if item.select(&pinned_sel).next().is_some() {
                continue;
            }

            let Some(content) = item.select(&content_sel).next() else {
                continue;
            };
            let Some(link_el) = item.select(&link_sel).next() else {
                continue;
            };
            let Some(href) = link_el.value().attr("href") else {
                continue;
            };

            let text = element_text(content);
            if text.is_empty() || href.is_empty() {
                continue;
            }

            let link = resolve_link(base, href);
            let published = item
                .select(&date_sel)
                .next()
                .and_then(|a| a.value().attr("title"))
                .unwrap_or_default()
                .to_string();
            let author = item
                .select(&author_sel)
                .next()
                .map(element_text)
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| target.term().to_string());
            let is_repost = item.select(&repost_sel).next().is_some();

            let mut images = Self::extract_images(item, base)?;
            let (video_url, poster) = Self::extract_video(item, base)?;
            if let Some(poster) = poster {
                images.push(poster);
            }

            return Ok(vec![Post {
                id: dedup_id(&link),
                author,
                text,
                link,
                published,
                is_repost,
                images,
                video_url,
            }]);
        }

        Ok(Vec::new())
    }
}

/// Syndication-feed mirror: standard RSS/Atom parsing, first entry verbatim.
/// Feeds have no pinned-item concept.
#[derive(Debug, Clone, Copy)]
pub struct FeedExtractor;

impl SourceExtractor for FeedExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn request_url(&self, instance: &Instance, target: &Target) -> String {
        match target {
            Target::Handle(handle) => format!("{}/{}/rss", instance.base(), handle),
            Target::Search(query) => format!(
                "{}/search/rss?f=tweets&q={}",
                instance.base(),
                encode_query(query)
            ),
        }
    }

    fn extract(
        &self,
        body: &str,
        _instance: &Instance,
        target: &Target,
    ) -> Result<Vec<Post>, ExtractError> {
        let feed = feed_rs::parser::parse(body.as_bytes())?;

        let Some(entry) = feed.entries.into_iter().next() else {
            return Ok(Vec::new());
        };

        let link = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_else(|| entry.id.clone());
        if link.is_empty() {
            return Ok(Vec::new());
        }

        let text = entry
            .title
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| entry.summary.map(|s| s.content.trim().to_string()))
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let author = entry
            .authors
            .first()
            .map(|a| a.name.clone())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| target.term().to_string());
        let published = entry
            .published
            .or(entry.updated)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        let is_repost = text.starts_with("RT by ") || text.starts_with("RT @");

        let images = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|c| c.url.as_ref())
            .map(|u| normalize_media_url(u.as_str()))
            .collect();

        Ok(vec![Post {
            id: dedup_id(&link),
            author,
            text,
            link,
            published,
            is_repost,
            images,
            video_url: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_instance() -> Instance {
        Instance::new("https://mirror.example", SourceKind::Page, 100)
    }

    fn feed_instance() -> Instance {
        Instance::new("https://feedmirror.example", SourceKind::Feed, 100)
    }

    #[test]
    fn challenge_markers_are_detected() {
        assert!(is_challenge(""));
        assert!(is_challenge("   \n"));
        assert!(is_challenge("<html>Verifying your browser ...</html>"));
        assert!(is_challenge("<title>Just a moment...</title>"));
        assert!(is_challenge("This instance is not yet permitted to access upstream."));
        assert!(!is_challenge("<div class=\"timeline-item\">hello</div>"));
    }

    #[test]
    fn hex_encoded_canonical_url_decodes_exactly() {
        let canonical = "https://pbs.twimg.com/media/AbCd123.jpg";
        let encoded = hex::encode(canonical);
        let proxied = format!("https://mirror.example/pic/enc/{encoded}");
        assert_eq!(normalize_media_url(&proxied), canonical);
    }

    #[test]
    fn hex_encoded_media_path_gets_canonical_host() {
        let encoded = hex::encode("media/AbCd123.jpg");
        let proxied = format!("https://mirror.example/pic/{encoded}");
        assert_eq!(
            normalize_media_url(&proxied),
            "https://pbs.twimg.com/media/AbCd123.jpg"
        );
    }

    #[test]
    fn percent_encoded_media_segment_is_rewritten() {
        assert_eq!(
            normalize_media_url("https://mirror.example/pic/orig/media%2FAbCd123.jpg"),
            "https://pbs.twimg.com/media/AbCd123.jpg"
        );
    }

    #[test]
    fn embedded_canonical_host_is_lifted() {
        assert_eq!(
            normalize_media_url("https://proxy.example/?url=pbs.twimg.com/media/X.jpg"),
            "https://pbs.twimg.com/media/X.jpg"
        );
    }

    #[test]
    fn percent_sign_before_multibyte_text_does_not_panic() {
        // Mirrors emit arbitrary bytes in src attributes; a stray `%`
        // directly before non-ASCII text must pass through untouched.
        let url = "https://mirror.example/pic/%日本.jpg";
        assert_eq!(normalize_media_url(url), url);
        let url = "https://mirror.example/pic/%E发射.jpg";
        assert_eq!(normalize_media_url(url), url);
    }

    #[test]
    fn unrecognized_proxy_path_is_unchanged() {
        let url = "https://mirror.example/pic/card_img/12345/opaque";
        assert_eq!(normalize_media_url(url), url);
    }

    const TIMELINE_HTML: &str = r#"
    <div class="timeline">
      <div class="timeline-item">
        <div class="pinned"><span>Pinned</span></div>
        <div class="tweet-content">Older pinned announcement</div>
        <a class="tweet-link" href="/alice/status/900#m"></a>
      </div>
      <div class="timeline-item">
        <a class="tweet-avatar avatar round" href="/alice">
          <img src="/pic/profile_images%2Favatar_tiny.jpg" />
        </a>
        <a class="username" href="/alice">@alice</a>
        <div class="tweet-content">Fresh post with a picture 发射</div>
        <a class="tweet-link" href="/alice/status/1001#m"></a>
        <span class="tweet-date"><a href="/alice/status/1001" title="Jan 7, 2026 · 9:14 PM UTC">7h</a></span>
        <div class="attachment image">
          <img src="/pic/orig/media%2FGaXYZ99.jpg" />
        </div>
        <div class="attachment image">
          <img src="/pic/emoji/rocket.svg" />
        </div>
      </div>
    </div>
    "#;

    #[test]
    fn first_non_pinned_item_wins() {
        let target = Target::parse("alice");
        let posts = PageExtractor
            .extract(TIMELINE_HTML, &page_instance(), &target)
            .expect("extract");
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.id, "1001");
        assert_eq!(post.author, "@alice");
        assert_eq!(post.text, "Fresh post with a picture 发射");
        assert_eq!(post.link, "https://mirror.example/alice/status/1001#m");
        assert_eq!(post.published, "Jan 7, 2026 · 9:14 PM UTC");
        assert!(!post.is_repost);
    }

    #[test]
    fn avatar_and_emoji_assets_are_excluded_from_images() {
        let target = Target::parse("alice");
        let posts = PageExtractor
            .extract(TIMELINE_HTML, &page_instance(), &target)
            .expect("extract");
        assert_eq!(
            posts[0].images,
            vec!["https://pbs.twimg.com/media/GaXYZ99.jpg".to_string()]
        );
    }

    #[test]
    fn pinned_word_in_text_is_not_a_pin_marker() {
        let html = r#"
        <div class="timeline-item">
          <a class="username" href="/bob">@bob</a>
          <div class="tweet-content">I love Pinned tabs in my browser</div>
          <a class="tweet-link" href="/bob/status/2002#m"></a>
        </div>
        "#;
        let target = Target::parse("bob");
        let posts = PageExtractor
            .extract(html, &page_instance(), &target)
            .expect("extract");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "2002");
    }

    #[test]
    fn items_missing_content_or_link_are_skipped() {
        let html = r#"
        <div class="timeline-item">
          <div class="tweet-content">No permalink on this one</div>
        </div>
        <div class="timeline-item">
          <a class="tweet-link" href="/carol/status/3003#m"></a>
        </div>
        <div class="timeline-item">
          <div class="tweet-content">Valid at last</div>
          <a class="tweet-link" href="/carol/status/3004#m"></a>
        </div>
        "#;
        let target = Target::parse("carol");
        let posts = PageExtractor
            .extract(html, &page_instance(), &target)
            .expect("extract");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "3004");
        // No username element in the markup: author falls back to the target.
        assert_eq!(posts[0].author, "carol");
    }

    #[test]
    fn repost_header_sets_the_flag_and_video_poster_joins_images() {
        let html = r#"
        <div class="timeline-item">
          <div class="retweet-header">reposted</div>
          <a class="username" href="/dave">@dave</a>
          <div class="tweet-content">clip attached</div>
          <a class="tweet-link" href="/dave/status/4004#m"></a>
          <div class="attachment video-container">
            <video poster="/pic/orig/media%2Fposter1.jpg" data-url="/video/abc.mp4"></video>
          </div>
        </div>
        "#;
        let target = Target::parse("dave");
        let posts = PageExtractor
            .extract(html, &page_instance(), &target)
            .expect("extract");
        let post = &posts[0];
        assert!(post.is_repost);
        assert_eq!(
            post.video_url.as_deref(),
            Some("https://mirror.example/video/abc.mp4")
        );
        assert_eq!(
            post.images,
            vec!["https://pbs.twimg.com/media/poster1.jpg".to_string()]
        );
    }

    #[test]
    fn only_pinned_items_yield_no_candidates() {
        let html = r#"
        <div class="timeline-item">
          <div class="pinned"></div>
          <div class="tweet-content">announcement</div>
          <a class="tweet-link" href="/erin/status/5005#m"></a>
        </div>
        "#;
        let target = Target::parse("erin");
        let posts = PageExtractor
            .extract(html, &page_instance(), &target)
            .expect("extract");
        assert!(posts.is_empty());
    }

    #[test]
    fn page_request_urls_follow_mirror_routing() {
        let instance = page_instance();
        assert_eq!(
            PageExtractor.request_url(&instance, &Target::parse("alice")),
            "https://mirror.example/alice"
        );
        assert_eq!(
            PageExtractor.request_url(&instance, &Target::parse("search:launch window")),
            "https://mirror.example/search?f=tweets&q=launch+window"
        );
    }

    #[test]
    fn feed_request_urls_follow_mirror_routing() {
        let instance = feed_instance();
        assert_eq!(
            FeedExtractor.request_url(&instance, &Target::parse("alice")),
            "https://feedmirror.example/alice/rss"
        );
        assert_eq!(
            FeedExtractor.request_url(&instance, &Target::parse("search:launch")),
            "https://feedmirror.example/search/rss?f=tweets&q=launch"
        );
    }

    const FEED_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
      <channel>
        <title>alice / mirror</title>
        <item>
          <title>First entry text</title>
          <dc:creator>@alice</dc:creator>
          <link>https://feedmirror.example/alice/status/6006</link>
          <pubDate>Wed, 07 Jan 2026 21:14:00 GMT</pubDate>
        </item>
        <item>
          <title>Second, older entry</title>
          <link>https://feedmirror.example/alice/status/6005</link>
        </item>
      </channel>
    </rss>
    "#;

    #[test]
    fn feed_extraction_takes_first_entry_verbatim() {
        let target = Target::parse("alice");
        let posts = FeedExtractor
            .extract(FEED_XML, &feed_instance(), &target)
            .expect("extract");
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.id, "6006");
        assert_eq!(post.author, "@alice");
        assert_eq!(post.text, "First entry text");
        assert_eq!(post.link, "https://feedmirror.example/alice/status/6006");
        assert!(!post.published.is_empty());
    }

    #[test]
    fn feed_link_without_status_id_falls_back_to_raw_link() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0">
          <channel>
            <title>search / mirror</title>
            <item>
              <title>launch day thread</title>
              <link>https://feedmirror.example/threads/launch-day</link>
            </item>
          </channel>
        </rss>
        "#;
        let target = Target::parse("search:launch");
        let posts = FeedExtractor
            .extract(xml, &feed_instance(), &target)
            .expect("extract");
        assert_eq!(posts[0].id, "https://feedmirror.example/threads/launch-day");
        // Author is absent in the entry; falls back to the search term.
        assert_eq!(posts[0].author, "launch");
    }
}
