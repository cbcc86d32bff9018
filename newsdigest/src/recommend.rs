use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::CoreConfig;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::ingestion::{self, FeedEntry};
use crate::pipeline::Clock;
use crate::registry::{Category, FeedRegistry};
use crate::storage::HistoryStore;

const MAX_LIMIT: usize = 20;
const TOP_CATEGORIES: usize = 3;
/// Half-life style constant for trending decay: exp(-age_hours / 48).
const TRENDING_DECAY_HOURS: f64 = 48.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationType {
    Keyword,
    Category,
    Trending,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub article_title: String,
    pub article_url: String,
    pub article_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub keywords: Vec<String>,
    pub recommendation_type: RecommendationType,
    pub recommendation_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Rank recommendations for a user from their history signals. With no
/// usable keyword or category history the result is a recency-scored
/// trending mix. URLs already in the user's history are never returned.
pub async fn recommend(
    config: &CoreConfig,
    registry: &FeedRegistry,
    store: &HistoryStore,
    http: &reqwest::Client,
    clock: &dyn Clock,
    user_id: &str,
    limit: usize,
) -> Result<Vec<Recommendation>, CoreError> {
    let limit = limit.clamp(1, MAX_LIMIT);
    let now = clock.now();
    let since = now - ChronoDuration::days(config.recommend.window_days);

    let keyword_freqs = store.keywords_of_user(user_id, since).await?;
    let category_freqs = store.categories_of_user(user_id, since).await?;
    let seen_urls = store.urls_of_user(user_id).await?;

    let entries = fetch_current_entries(config, registry, http).await;
    debug!(entries = entries.len(), "entries fetched for recommendation");

    let mut candidates = if keyword_freqs.is_empty() && category_freqs.is_empty() {
        info!(user = user_id, "no history signals, serving trending mix");
        trending_candidates(&entries, config.recommend.trending_per_source, now)
    } else {
        let mut merged = keyword_candidates(&entries, &keyword_freqs, now);
        merged.extend(category_candidates(&entries, &category_freqs, now));
        let mut ranked = dedupe_keep_best(merged);
        min_max_normalize(&mut ranked);
        ranked
    };

    candidates.retain(|c| !seen_urls.contains(&c.article_url));
    candidates.sort_by(|a, b| {
        b.recommendation_score
            .partial_cmp(&a.recommendation_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);
    Ok(candidates)
}

async fn fetch_current_entries(
    config: &CoreConfig,
    registry: &FeedRegistry,
    http: &reqwest::Client,
) -> Vec<FeedEntry> {
    let timeout = config.pipeline.fetch_timeout();
    let parallelism = config.pipeline.feed_parallelism.max(1);

    let results: Vec<_> = stream::iter(registry.list().to_vec())
        .map(|source| {
            let client = http.clone();
            async move {
                let res = ingestion::fetch_source(&client, &source, timeout).await;
                (source, res)
            }
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;

    let mut entries = Vec::new();
    for (source, result) in results {
        match result {
            Ok(mut fetched) => entries.append(&mut fetched),
            Err(e) => warn!(source = %source.name, error = %e, "feed skipped for recommendations"),
        }
    }
    entries
}

/// Recency-only scoring, bounded to a few entries per source.
fn trending_candidates(
    entries: &[FeedEntry],
    per_source: usize,
    now: DateTime<Utc>,
) -> Vec<Recommendation> {
    let mut taken_per_source: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::new();

    for entry in entries {
        let taken = taken_per_source.entry(entry.source_name.as_str()).or_insert(0);
        if *taken >= per_source {
            continue;
        }
        *taken += 1;

        out.push(Recommendation {
            article_title: entry.title.clone(),
            article_url: entry.link.clone(),
            article_source: entry.source_name.clone(),
            category: entry.category,
            keywords: Vec::new(),
            recommendation_type: RecommendationType::Trending,
            recommendation_score: recency_score(entry.published_at, now),
            created_at: now,
        });
    }

    dedupe_keep_best(out)
}

fn recency_score(published_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(published) = published_at else {
        return 0.0;
    };
    let age_hours = (now - published).num_minutes() as f64 / 60.0;
    let score = (-age_hours.max(0.0) / TRENDING_DECAY_HOURS).exp();
    score.clamp(0.0, 1.0)
}

/// `score = sum(freq(t) * titleHits(t)) / max(1, sum(freq))` over the user's
/// keyword multiset.
fn keyword_candidates(
    entries: &[FeedEntry],
    keyword_freqs: &[(String, i64)],
    now: DateTime<Utc>,
) -> Vec<Recommendation> {
    let normalize = keyword_freqs.iter().map(|(_, f)| *f).sum::<i64>().max(1) as f64;

    entries
        .iter()
        .filter_map(|entry| {
            let title = entry.title.to_lowercase();
            let mut matched = Vec::new();
            let mut raw = 0.0;
            for (term, freq) in keyword_freqs {
                let hits = title.matches(term.as_str()).count();
                if hits > 0 {
                    matched.push(term.clone());
                    raw += *freq as f64 * hits as f64;
                }
            }
            (raw > 0.0).then(|| Recommendation {
                article_title: entry.title.clone(),
                article_url: entry.link.clone(),
                article_source: entry.source_name.clone(),
                category: entry.category,
                keywords: matched,
                recommendation_type: RecommendationType::Keyword,
                recommendation_score: raw / normalize,
                created_at: now,
            })
        })
        .collect()
}

/// Entries from sources in the user's top categories, scored by category
/// share of the history.
fn category_candidates(
    entries: &[FeedEntry],
    category_freqs: &[(Category, i64)],
    now: DateTime<Utc>,
) -> Vec<Recommendation> {
    let total = category_freqs.iter().map(|(_, f)| *f).sum::<i64>().max(1) as f64;
    let top: HashMap<Category, f64> = category_freqs
        .iter()
        .take(TOP_CATEGORIES)
        .map(|(c, f)| (*c, *f as f64 / total))
        .collect();

    entries
        .iter()
        .filter_map(|entry| {
            let category = entry.category?;
            let share = top.get(&category)?;
            Some(Recommendation {
                article_title: entry.title.clone(),
                article_url: entry.link.clone(),
                article_source: entry.source_name.clone(),
                category: Some(category),
                keywords: Vec::new(),
                recommendation_type: RecommendationType::Category,
                recommendation_score: *share,
                created_at: now,
            })
        })
        .collect()
}

/// Collapse duplicate URLs, keeping the higher-scored candidate.
fn dedupe_keep_best(candidates: Vec<Recommendation>) -> Vec<Recommendation> {
    let mut best: HashMap<String, Recommendation> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for candidate in candidates {
        let replace = match best.get(&candidate.article_url) {
            None => {
                order.push(candidate.article_url.clone());
                true
            }
            Some(existing) => existing.recommendation_score < candidate.recommendation_score,
        };
        if replace {
            best.insert(candidate.article_url.clone(), candidate);
        }
    }

    order.into_iter().filter_map(|url| best.remove(&url)).collect()
}

/// Min-max normalization into [0, 1]; a constant set maps to 1.0.
fn min_max_normalize(candidates: &mut [Recommendation]) {
    let Some(max) = candidates
        .iter()
        .map(|c| c.recommendation_score)
        .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a| a.max(s))))
    else {
        return;
    };
    let min = candidates
        .iter()
        .map(|c| c.recommendation_score)
        .fold(f64::INFINITY, f64::min);

    for candidate in candidates.iter_mut() {
        candidate.recommendation_score = if (max - min).abs() < f64::EPSILON {
            1.0
        } else {
            (candidate.recommendation_score - min) / (max - min)
        };
    }
}
