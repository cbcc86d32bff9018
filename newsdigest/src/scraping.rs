use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ExtractionConfig;
use encoding_rs::{Encoding, EUC_KR, UTF_8, WINDOWS_1252};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::Client;
use scraper::{ElementRef, Html, Node, Selector};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ExtractError;
use crate::ingestion::next_user_agent;
use crate::registry::Category;

/// Full text of a news page. Body is plain text with normalized whitespace,
/// HTML entities decoded, zero-width characters stripped.
#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub title: String,
    pub url: String,
    pub body: String,
    pub source_name: String,
    pub category: Option<Category>,
    pub fetched_at: DateTime<Utc>,
}

const ACCEPT_HTML: &str = "application/rss+xml, application/xml, text/xml, */*";

/// Pages larger than this are truncated before parsing; news bodies live
/// well inside it.
const MAX_HTML_CHARS: usize = 2_000_000;

/// Fetch a news page and extract its title and body within `budget`.
pub async fn extract_article(
    client: &Client,
    url: &str,
    source_name: &str,
    category: Option<Category>,
    budget: Duration,
    cfg: &ExtractionConfig,
    fetched_at: DateTime<Utc>,
) -> Result<Article, ExtractError> {
    let fetched = tokio::time::timeout(budget, fetch_html(client, url)).await;
    let html = match fetched {
        Ok(res) => res?,
        Err(_) => return Err(ExtractError::Timeout),
    };

    let (title, body) = extract_from_html(&html, cfg)?;
    debug!(url, chars = body.chars().count(), "article extracted");

    Ok(Article {
        title,
        url: url.to_string(),
        body,
        source_name: source_name.to_string(),
        category,
        fetched_at,
    })
}

async fn fetch_html(client: &Client, url: &str) -> Result<String, ExtractError> {
    let response = client
        .get(url)
        .header(USER_AGENT, next_user_agent())
        .header(ACCEPT, ACCEPT_HTML)
        .send()
        .await
        .map_err(map_reqwest_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(ExtractError::HttpStatus(status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let bytes = response.bytes().await.map_err(map_reqwest_error)?;
    let mut html = decode_html(&bytes, content_type.as_deref());
    if html.chars().count() > MAX_HTML_CHARS {
        html = html.chars().take(MAX_HTML_CHARS).collect();
    }
    Ok(html)
}

fn map_reqwest_error(e: reqwest::Error) -> ExtractError {
    if e.is_timeout() {
        ExtractError::Timeout
    } else {
        ExtractError::Network(e.to_string())
    }
}

/// Best-effort charset decode for HTML pages: HTTP header charset, then
/// `<meta charset>` / http-equiv declarations, then the first clean sniff
/// through UTF-8 / EUC-KR / Latin-1. HTML always decodes (lossily at worst).
fn decode_html(bytes: &[u8], content_type: Option<&str>) -> String {
    let mut candidates: Vec<&'static Encoding> = Vec::new();

    if let Some(charset) = content_type.and_then(charset_param) {
        if let Some(enc) = label_to_encoding(&charset) {
            candidates.push(enc);
        }
    }
    if let Some(charset) = charset_from_meta(bytes) {
        if let Some(enc) = label_to_encoding(&charset) {
            candidates.push(enc);
        }
    }
    candidates.extend([UTF_8, EUC_KR, WINDOWS_1252]);

    for encoding in &candidates {
        let (decoded, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return decoded.into_owned();
        }
    }
    // Nothing decoded cleanly; take the preferred candidate lossily.
    candidates[0].decode(bytes).0.into_owned()
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().strip_prefix("charset="))
        .map(|c| c.trim_matches('"').trim().to_string())
        .next()
}

fn charset_from_meta(bytes: &[u8]) -> Option<String> {
    let prefix: String = bytes
        .iter()
        .take(2048)
        .map(|&b| if b.is_ascii() { b.to_ascii_lowercase() as char } else { ' ' })
        .collect();
    let idx = prefix.find("charset=")? + "charset=".len();
    let rest = &prefix[idx..];
    let value: String = rest
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!value.is_empty()).then_some(value)
}

fn label_to_encoding(label: &str) -> Option<&'static Encoding> {
    match label.trim().to_lowercase().as_str() {
        "cp949" | "ms949" | "x-windows-949" | "uhc" => Some(EUC_KR),
        other => Encoding::for_label(other.as_bytes()),
    }
}

/// Content selection policy, tried in order until a candidate yields at
/// least `min_body_chars` of normalized text:
/// 1. the `<article>` element
/// 2. configured news-body selectors
/// 3. the largest `<div>` by visible-text length
/// 4. concatenation of all `<p>` under `<body>`
pub fn extract_from_html(
    html: &str,
    cfg: &ExtractionConfig,
) -> Result<(String, String), ExtractError> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);

    let mut best_len = 0usize;

    let article_sel = Selector::parse("article").unwrap();
    for el in doc.select(&article_sel) {
        let text = visible_text(el, &cfg.ad_class_patterns);
        let len = text.chars().count();
        if len >= cfg.min_body_chars {
            return Ok((title, text));
        }
        best_len = best_len.max(len);
    }

    for raw in &cfg.body_selectors {
        let Ok(sel) = Selector::parse(raw) else {
            warn!(selector = raw.as_str(), "invalid body selector in config");
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            let text = visible_text(el, &cfg.ad_class_patterns);
            let len = text.chars().count();
            if len >= cfg.min_body_chars {
                return Ok((title, text));
            }
            best_len = best_len.max(len);
        }
    }

    let div_sel = Selector::parse("div").unwrap();
    if let Some(text) = doc
        .select(&div_sel)
        .map(|el| visible_text(el, &cfg.ad_class_patterns))
        .max_by_key(|t| t.chars().count())
    {
        let len = text.chars().count();
        if len >= cfg.min_body_chars {
            return Ok((title, text));
        }
        best_len = best_len.max(len);
    }

    let p_sel = Selector::parse("body p").unwrap();
    let joined = doc
        .select(&p_sel)
        .map(|el| visible_text(el, &cfg.ad_class_patterns))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let len = joined.chars().count();
    if len >= cfg.min_body_chars {
        return Ok((title, joined));
    }
    best_len = best_len.max(len);

    if best_len == 0 {
        Err(ExtractError::Unparseable)
    } else {
        Err(ExtractError::BodyTooShort {
            got: best_len,
            need: cfg.min_body_chars,
        })
    }
}

/// Title preference: `og:title` meta, then `<title>`, then the first `<h1>`.
fn extract_title(doc: &Html) -> String {
    let og = Selector::parse(r#"meta[property="og:title"]"#).unwrap();
    if let Some(content) = doc
        .select(&og)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|s| !s.is_empty())
    {
        return normalize_text(content);
    }

    let title_sel = Selector::parse("title").unwrap();
    if let Some(el) = doc.select(&title_sel).next() {
        let t = normalize_text(&el.text().collect::<String>());
        if !t.is_empty() {
            return t;
        }
    }

    let h1_sel = Selector::parse("h1").unwrap();
    if let Some(el) = doc.select(&h1_sel).next() {
        return normalize_text(&el.text().collect::<String>());
    }

    String::new()
}

/// Collect the element's text, skipping script/style/noscript subtrees,
/// comments, and elements whose class matches an ad pattern.
fn visible_text(el: ElementRef, ad_patterns: &[String]) -> String {
    let mut out = String::new();
    collect_text(el, ad_patterns, &mut out);
    normalize_text(&out)
}

fn collect_text(el: ElementRef, ad_patterns: &[String], out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => {
                out.push_str(t);
                out.push(' ');
            }
            Node::Element(e) => {
                if matches!(e.name(), "script" | "style" | "noscript") {
                    continue;
                }
                if let Some(class) = e.attr("class") {
                    let class = class.to_lowercase();
                    if ad_patterns.iter().any(|p| class.contains(&p.to_lowercase())) {
                        continue;
                    }
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, ad_patterns, out);
                }
            }
            _ => {}
        }
    }
}

/// Whitespace collapse + zero-width character removal. Entities are already
/// decoded by the HTML parser.
fn normalize_text(raw: &str) -> String {
    let without_zw: String = raw
        .chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect();
    without_zw.split_whitespace().collect::<Vec<_>>().join(" ")
}
