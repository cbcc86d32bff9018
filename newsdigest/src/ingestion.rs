use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, EUC_KR, UTF_8, WINDOWS_1252};
use feed_rs::parser;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::registry::{Category, FeedSource};

/// One normalized item out of a feed. Exists only for the duration of a
/// request; identity is `(source, link)`.
#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub source_name: String,
    pub category: Option<Category>,
}

const ACCEPT_FEED: &str = "application/rss+xml, application/xml, text/xml, */*";

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
];

static UA_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Rotated realistic user-agent, shared by the feed and article fetchers.
pub fn next_user_agent() -> &'static str {
    let i = UA_CURSOR.fetch_add(1, Ordering::Relaxed);
    USER_AGENTS[i % USER_AGENTS.len()]
}

/// Build the shared HTTP client used by C2/C3. Redirects are capped at 5;
/// per-request budgets are enforced by the callers, not the client.
pub fn build_http_client() -> Client {
    Client::builder()
        .redirect(reqwest::redirect::Policy::limited(5))
        .gzip(true)
        .brotli(true)
        .pool_idle_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client")
}

/// Fetches one feed and parses it into normalized entries within `budget`.
///
/// Registry sources carry their category; ad-hoc feed URLs handed in by the
/// caller fetch with `category = None`. Non-Ok outcomes yield zero entries
/// and are reported to the caller, never raised across the pipeline.
pub async fn fetch_feed(
    client: &Client,
    url: &str,
    source_name: &str,
    category: Option<Category>,
    budget: Duration,
) -> Result<Vec<FeedEntry>, FetchError> {
    let fetched = tokio::time::timeout(budget, fetch_bytes(client, url)).await;
    let (bytes, content_type) = match fetched {
        Ok(res) => res?,
        Err(_) => return Err(FetchError::Timeout),
    };

    let document = decode_feed_document(&bytes, content_type.as_deref())?;
    let feed = parser::parse(document.as_bytes())
        .map_err(|e| FetchError::Parse(e.to_string()))?;

    let mut entries = Vec::new();
    for entry in feed.entries {
        // Malformed items (no usable link) are skipped, not fatal.
        let Some(link) = entry.links.first().map(|l| l.href.clone()) else {
            debug!(source = source_name, "skipping feed item without link");
            continue;
        };

        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();

        let snippet = entry
            .summary
            .as_ref()
            .map(|s| strip_html_snippet(&s.content))
            .filter(|s| !s.is_empty());

        entries.push(FeedEntry {
            title,
            link: canonicalize_link(&link),
            published_at: entry.published,
            snippet,
            source_name: source_name.to_string(),
            category,
        });
    }

    debug!(source = source_name, entries = entries.len(), "feed fetched");
    Ok(entries)
}

/// Convenience wrapper for registry sources.
pub async fn fetch_source(
    client: &Client,
    source: &FeedSource,
    budget: Duration,
) -> Result<Vec<FeedEntry>, FetchError> {
    fetch_feed(client, &source.rss_url, &source.name, Some(source.category), budget).await
}

async fn fetch_bytes(
    client: &Client,
    url: &str,
) -> Result<(Vec<u8>, Option<String>), FetchError> {
    let response = client
        .get(url)
        .header(USER_AGENT, next_user_agent())
        .header(ACCEPT, ACCEPT_FEED)
        .send()
        .await
        .map_err(map_reqwest_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus(status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let bytes = response.bytes().await.map_err(map_reqwest_error)?;
    Ok((bytes.to_vec(), content_type))
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Resolve the document charset and decode to UTF-8.
///
/// Preference order: HTTP Content-Type charset, then the XML declaration,
/// then byte-sniffing through UTF-8 / EUC-KR (which also covers its CP949
/// extension) / Latin-1. The first decoding that yields a well-formed feed
/// wins; the well-formedness probe is a cheap feed-rs parse.
pub fn decode_feed_document(bytes: &[u8], content_type: Option<&str>) -> Result<String, FetchError> {
    let mut candidates: Vec<&'static Encoding> = Vec::new();

    if let Some(charset) = content_type.and_then(charset_from_content_type) {
        if let Some(enc) = encoding_for_label(&charset) {
            candidates.push(enc);
        }
    }
    if let Some(charset) = charset_from_xml_decl(bytes) {
        if let Some(enc) = encoding_for_label(&charset) {
            candidates.push(enc);
        }
    }
    candidates.extend([UTF_8, EUC_KR, WINDOWS_1252]);
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|e| seen.insert(e.name()));

    let mut clean_decode_failed_parse = false;
    for encoding in candidates {
        let (decoded, _, had_errors) = encoding.decode(bytes);
        let document = normalize_xml_decl(&decoded);
        if parser::parse(document.as_bytes()).is_ok() {
            if had_errors {
                warn!(encoding = encoding.name(), "feed decoded with replacement characters");
            }
            return Ok(document);
        }
        if !had_errors {
            clean_decode_failed_parse = true;
        }
    }

    if clean_decode_failed_parse {
        Err(FetchError::Parse("no candidate charset yielded a well-formed feed".into()))
    } else {
        Err(FetchError::CharsetUnresolvable)
    }
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().strip_prefix("charset="))
        .map(|c| c.trim_matches('"').trim().to_string())
        .next()
}

/// Pull the encoding attribute out of an XML declaration, if one is present
/// in the (ASCII-compatible) document prefix.
fn charset_from_xml_decl(bytes: &[u8]) -> Option<String> {
    let prefix: String = bytes
        .iter()
        .take(256)
        .map(|&b| if b.is_ascii() { b as char } else { ' ' })
        .collect();
    let lower = prefix.to_lowercase();
    if !lower.starts_with("<?xml") {
        return None;
    }
    let rest = &lower[..lower.find("?>").unwrap_or(lower.len())];
    let start = rest.find("encoding=")? + "encoding=".len();
    let quoted = &rest[start..];
    let quote = quoted.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let end = quoted[1..].find(quote)?;
    Some(quoted[1..1 + end].to_string())
}

fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    // WHATWG labels do not know the common Korean aliases for windows-949.
    match label.trim().to_lowercase().as_str() {
        "cp949" | "ms949" | "x-windows-949" | "uhc" => Some(EUC_KR),
        other => Encoding::for_label(other.as_bytes()),
    }
}

/// Rewrite the declared encoding to UTF-8 so the XML parser trusts the bytes
/// we hand it after transcoding.
fn normalize_xml_decl(document: &str) -> String {
    let trimmed = document.trim_start_matches('\u{FEFF}');
    if !trimmed.starts_with("<?xml") {
        return trimmed.to_string();
    }
    let Some(end) = trimmed.find("?>") else {
        return trimmed.to_string();
    };
    let decl = &trimmed[..end];
    let Some(enc_start) = decl.to_lowercase().find("encoding=") else {
        return trimmed.to_string();
    };
    let after = &decl[enc_start + "encoding=".len()..];
    let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return trimmed.to_string();
    };
    let Some(value_len) = after[1..].find(quote) else {
        return trimmed.to_string();
    };
    let mut out = String::with_capacity(trimmed.len());
    out.push_str(&decl[..enc_start]);
    out.push_str("encoding=\"UTF-8\"");
    out.push_str(&decl[enc_start + "encoding=".len() + 1 + value_len + 1..]);
    out.push_str(&trimmed[end..]);
    out
}

/// Canonical entry link: fragment stripped, host lowercased (the url crate
/// normalizes the host on parse). Unparseable links are kept verbatim.
fn canonicalize_link(link: &str) -> String {
    match url::Url::parse(link.trim()) {
        Ok(mut u) => {
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => link.trim().to_string(),
    }
}

/// First 500 characters of a description with HTML stripped and whitespace
/// collapsed.
fn strip_html_snippet(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 500).unwrap_or_default();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(500).collect()
}
