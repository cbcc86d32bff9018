use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ChatMessage, ChatOptions, Language, LlmClient};
use crate::error::LlmError;
use crate::scraping::Article;

/// A summary tied to the article it restates.
#[derive(Debug, Clone, Serialize)]
pub struct SummarizedArticle {
    pub article: Article,
    pub summary: String,
    pub summary_language: Language,
    pub model: String,
    pub produced_at: DateTime<Utc>,
}

const MAX_ATTEMPTS: u32 = 3;

pub fn system_prompt(language: Language) -> String {
    format!(
        "You are a news summarization assistant. Produce a faithful, neutral summary in {}. \
         3-5 sentences. Do not invent facts.",
        language.prompt_name()
    )
}

/// Summarize one article within `budget`.
///
/// The system message is fixed; the caller's custom prompt only ever joins
/// the user portion. Transient failures are retried with exponential backoff
/// (1s, 2s with ±20% jitter); an invalid completion is retried once before
/// surfacing `SummaryInvalid`.
pub async fn summarize_article(
    llm: &dyn LlmClient,
    article: &Article,
    language: Language,
    custom_prompt: Option<&str>,
    cfg: &common::LlmConfig,
    budget: Duration,
    produced_at: DateTime<Utc>,
) -> Result<SummarizedArticle, LlmError> {
    let system = system_prompt(language);
    let body = truncate_body(&article.body, cfg.body_soft_cap, cfg.body_hard_cap);
    let user = match custom_prompt {
        Some(p) if !p.trim().is_empty() => format!("{}\n\n{}", p.trim(), body),
        _ => body,
    };
    let messages = [ChatMessage::system(&system), ChatMessage::user(user)];
    let opts = ChatOptions::from_config(cfg);

    let started = Instant::now();
    let remaining = |started: Instant| budget.checked_sub(started.elapsed());

    let mut attempt = 0u32;
    let mut validation_retried = false;
    loop {
        attempt += 1;
        let Some(left) = remaining(started) else {
            return Err(LlmError::Timeout);
        };

        match llm.chat(&messages, &opts, left).await {
            Ok(text) => {
                let summary = text.trim().to_string();
                match validate_summary(&summary, &article.body, &system) {
                    Ok(()) => {
                        debug!(url = %article.url, chars = summary.chars().count(), "article summarized");
                        return Ok(SummarizedArticle {
                            article: article.clone(),
                            summary,
                            summary_language: language,
                            model: opts.model.clone(),
                            produced_at,
                        });
                    }
                    Err(reason) => {
                        if validation_retried {
                            return Err(LlmError::SummaryInvalid(reason));
                        }
                        warn!(url = %article.url, %reason, "summary rejected, retrying once");
                        validation_retried = true;
                        continue;
                    }
                }
            }
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let backoff = backoff_with_jitter(attempt);
                let Some(left) = remaining(started) else {
                    return Err(LlmError::Timeout);
                };
                if backoff >= left {
                    return Err(LlmError::Timeout);
                }
                warn!(url = %article.url, attempt, error = %e, "transient LLM failure, backing off");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 1s, 2s, 4s with ±20% jitter.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 1000u64 * (1 << (attempt - 1).min(2));
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

/// Truncate to the last sentence boundary at or before `soft_cap`
/// characters; if the text has no boundary there, cut hard at `hard_cap`.
pub fn truncate_body(body: &str, soft_cap: usize, hard_cap: usize) -> String {
    let chars: Vec<char> = body.chars().collect();
    if chars.len() <= soft_cap {
        return body.to_string();
    }
    let window = &chars[..soft_cap];
    if let Some(pos) = window
        .iter()
        .rposition(|c| matches!(c, '.' | '!' | '?' | '。' | '…'))
    {
        return window[..=pos].iter().collect();
    }
    chars[..hard_cap.min(chars.len())].iter().collect()
}

/// Output contract: non-empty, no longer than the source body, and free of
/// any 20-character fragment of the system prompt.
fn validate_summary(summary: &str, body: &str, system: &str) -> Result<(), String> {
    if summary.is_empty() {
        return Err("empty summary".to_string());
    }
    if summary.chars().count() > body.chars().count() {
        return Err("summary longer than source body".to_string());
    }
    if leaks_prompt(summary, system) {
        return Err("summary contains system prompt text".to_string());
    }
    Ok(())
}

fn leaks_prompt(summary: &str, system: &str) -> bool {
    const WINDOW: usize = 20;
    let prompt_chars: Vec<char> = system.chars().collect();
    if prompt_chars.len() < WINDOW {
        return summary.contains(system);
    }
    (0..=prompt_chars.len() - WINDOW).any(|i| {
        let fragment: String = prompt_chars[i..i + WINDOW].iter().collect();
        summary.contains(&fragment)
    })
}
