use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::CoreConfig;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::error::{CoreError, ExtractError, FetchError, StageError};
use crate::ingestion::{self, FeedEntry};
use crate::keywords::{self, KeywordSet};
use crate::llm::{summarizer::SummarizedArticle, ChatOptions, Language, LlmClient};
use crate::llm::summarizer;
use crate::mailer::{self, MailSender};
use crate::recommend::{self, Recommendation};
use crate::registry::{Category, FeedRegistry};
use crate::relevance;
use crate::scraping::{self, Article};
use crate::storage::{FeedbackRecord, HistoryRecord, HistoryStore, InsertOutcome, NewHistoryRecord};

/// Injected wall clock, so tests can pin timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// External collaborators handed to the orchestrator once at startup.
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub history: Option<Arc<HistoryStore>>,
    pub mailer: Option<Arc<dyn MailSender>>,
    pub clock: Arc<dyn Clock>,
    pub http: reqwest::Client,
}

/// Validated input for one summarize request. Exactly one of `query` or the
/// URL lists must be populated; the HTTP layer rejects mixed requests and
/// the core re-checks.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub query: Option<String>,
    pub rss_urls: Vec<String>,
    pub article_urls: Vec<String>,
    pub max_articles: usize,
    pub language: Language,
    pub user_id: Option<String>,
    pub recipient_email: Option<String>,
    pub custom_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleSummary {
    pub title: String,
    pub url: String,
    pub source: String,
    pub summary: String,
    pub language: Language,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummarizeResponse {
    pub success: bool,
    pub articles: Vec<ArticleSummary>,
    pub total_articles: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_keywords: Option<Vec<String>>,
    pub partial: bool,
    pub errors: Vec<StageError>,
    pub processed_at: DateTime<Utc>,
}

/// Paginated history slice for the history endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

/// Request-scoped deadline. Stage budgets are the minimum of the stage
/// default and the time left on the request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn stage_budget(&self, stage_default: Duration) -> Duration {
        stage_default.min(self.remaining())
    }
}

enum RequestMode {
    Query,
    Urls,
}

/// The concurrency core: fans out over feeds, articles and LLM calls with
/// bounded parallelism, collects per-item failures, and assembles the
/// response in selection order.
pub struct Pipeline {
    config: CoreConfig,
    registry: Arc<FeedRegistry>,
    deps: Collaborators,
    cache: ResponseCache<SummarizeResponse>,
}

impl Pipeline {
    pub fn new(config: CoreConfig, registry: FeedRegistry, deps: Collaborators) -> Self {
        let cache = ResponseCache::new(
            config.pipeline.idempotency_capacity,
            Duration::from_secs(config.pipeline.idempotency_window_secs),
        );
        Self {
            config,
            registry: Arc::new(registry),
            deps,
            cache,
        }
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    /// Query path: extract keywords, pull every registry feed, rank by
    /// relevance, then extract / summarize / persist / mail.
    pub async fn summarize_by_query(
        &self,
        req: PipelineRequest,
    ) -> Result<SummarizeResponse, CoreError> {
        match validate(&req)? {
            RequestMode::Query => {}
            RequestMode::Urls => {
                return Err(CoreError::InvalidRequest(
                    "summarize_by_query requires a query".to_string(),
                ))
            }
        }

        let cache_key = cache_key(&req);
        if let Some(hit) = self.cache.get(&cache_key) {
            info!("returning cached response for repeated request");
            return Ok(hit);
        }

        let deadline = Deadline::after(self.config.pipeline.request_deadline());
        let query = req.query.clone().unwrap_or_default();

        let opts = ChatOptions::from_config(&self.config.llm);
        let keyword_budget = deadline.stage_budget(self.config.pipeline.llm_timeout());
        let keyword_set =
            keywords::extract_keywords(self.deps.llm.as_ref(), &query, &opts, keyword_budget)
                .await?;
        info!(terms = ?keyword_set.terms, "keywords extracted for query");

        let feeds: Vec<(String, String, Option<Category>)> = self
            .registry
            .list()
            .iter()
            .map(|s| (s.rss_url.clone(), s.name.clone(), Some(s.category)))
            .collect();

        let (entries, mut errors) = self.fetch_feed_stage(feeds, deadline).await;

        let effective_max = self.effective_max(req.max_articles);
        let selected = relevance::filter_entries(entries, &keyword_set, effective_max);
        debug!(selected = selected.len(), "entries selected by relevance");

        let response = self
            .run_tail(selected, Some(&keyword_set), &req, deadline, &mut errors)
            .await?;
        self.cache.put(cache_key, response.clone());
        Ok(response)
    }

    /// URL-list path: fetch the given feeds, union their entries with the
    /// pre-selected article URLs, then the shared tail. No relevance filter.
    pub async fn summarize_by_urls(
        &self,
        req: PipelineRequest,
    ) -> Result<SummarizeResponse, CoreError> {
        match validate(&req)? {
            RequestMode::Urls => {}
            RequestMode::Query => {
                return Err(CoreError::InvalidRequest(
                    "summarize_by_urls requires rss_urls or article_urls".to_string(),
                ))
            }
        }

        let cache_key = cache_key(&req);
        if let Some(hit) = self.cache.get(&cache_key) {
            info!("returning cached response for repeated request");
            return Ok(hit);
        }

        let deadline = Deadline::after(self.config.pipeline.request_deadline());

        let feeds: Vec<(String, String, Option<Category>)> = req
            .rss_urls
            .iter()
            .map(|u| (u.clone(), host_of(u), None))
            .collect();
        let (mut entries, mut errors) = self.fetch_feed_stage(feeds, deadline).await;

        for url in &req.article_urls {
            entries.push(FeedEntry {
                title: String::new(),
                link: url.clone(),
                published_at: None,
                snippet: None,
                source_name: host_of(url),
                category: None,
            });
        }

        let effective_max = self.effective_max(req.max_articles);
        entries.truncate(effective_max);

        let response = self
            .run_tail(entries, None, &req, deadline, &mut errors)
            .await?;
        self.cache.put(cache_key, response.clone());
        Ok(response)
    }

    pub async fn get_history(
        &self,
        user_id: &str,
        page: u32,
        per_page: u32,
        language: Option<Language>,
    ) -> Result<HistoryPage, CoreError> {
        let store = self.require_store()?;
        let (records, total) = store.list(user_id, page, per_page, language).await?;
        Ok(HistoryPage {
            records,
            total,
            page: page.max(1),
            per_page: per_page.clamp(1, 100),
        })
    }

    pub async fn get_recommendations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Recommendation>, CoreError> {
        let store = self.require_store()?;
        recommend::recommend(
            &self.config,
            &self.registry,
            store.as_ref(),
            &self.deps.http,
            self.deps.clock.as_ref(),
            user_id,
            limit,
        )
        .await
    }

    pub async fn record_feedback(&self, record: FeedbackRecord) -> Result<(), CoreError> {
        self.require_store()?.insert_feedback(record).await
    }

    pub async fn record_recommendation_click(
        &self,
        user_id: &str,
        article_url: &str,
    ) -> Result<(), CoreError> {
        let now = self.deps.clock.now();
        self.require_store()?
            .insert_recommendation_click(user_id, article_url, now)
            .await
    }

    fn require_store(&self) -> Result<Arc<HistoryStore>, CoreError> {
        self.deps
            .history
            .clone()
            .ok_or_else(|| CoreError::InvalidRequest("no history store configured".to_string()))
    }

    fn effective_max(&self, requested: usize) -> usize {
        requested.min(self.config.pipeline.max_articles_hard)
    }

    /// Bounded fan-out over feeds. Input order of results is restored so the
    /// URL-list path keeps its caller ordering.
    async fn fetch_feed_stage(
        &self,
        feeds: Vec<(String, String, Option<Category>)>,
        deadline: Deadline,
    ) -> (Vec<FeedEntry>, Vec<StageError>) {
        let fetch_timeout = self.config.pipeline.fetch_timeout();
        let parallelism = self.config.pipeline.feed_parallelism.max(1);

        let mut results: Vec<(usize, String, Result<Vec<FeedEntry>, FetchError>)> =
            stream::iter(feeds.into_iter().enumerate())
                .map(|(idx, (url, name, category))| {
                    let client = self.deps.http.clone();
                    async move {
                        if deadline.expired() {
                            return (idx, url, Err(FetchError::Timeout));
                        }
                        let budget = deadline.stage_budget(fetch_timeout);
                        let res =
                            ingestion::fetch_feed(&client, &url, &name, category, budget).await;
                        (idx, url, res)
                    }
                })
                .buffer_unordered(parallelism)
                .collect()
                .await;
        results.sort_by_key(|(idx, _, _)| *idx);

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for (_, url, result) in results {
            match result {
                Ok(mut fetched) => entries.append(&mut fetched),
                Err(e) => {
                    warn!(url = %url, error = %e, "feed fetch failed");
                    errors.push(StageError::feed(url, &e));
                }
            }
        }
        (entries, errors)
    }

    /// Shared tail of both entry paths: extract bodies, summarize, persist,
    /// mail, assemble the response in selection order.
    async fn run_tail(
        &self,
        selected: Vec<FeedEntry>,
        keyword_set: Option<&KeywordSet>,
        req: &PipelineRequest,
        deadline: Deadline,
        errors: &mut Vec<StageError>,
    ) -> Result<SummarizeResponse, CoreError> {
        let mut summaries = self.process_entries(selected, req, deadline, errors).await;
        summaries.sort_by_key(|(idx, _)| *idx);
        let summaries: Vec<SummarizedArticle> =
            summaries.into_iter().map(|(_, s)| s).collect();

        if summaries.is_empty() && req.max_articles > 0 {
            return Err(CoreError::NoResults);
        }

        if let (Some(user_id), Some(store)) = (req.user_id.as_deref(), self.deps.history.as_ref())
        {
            self.persist_stage(user_id, store, &summaries, keyword_set, errors)
                .await;
        }

        if let Some(recipient) = req.recipient_email.as_deref() {
            self.mail_stage(recipient, &summaries, req.language, errors)
                .await;
        }

        let articles: Vec<ArticleSummary> = summaries
            .iter()
            .map(|s| ArticleSummary {
                title: s.article.title.clone(),
                url: s.article.url.clone(),
                source: s.article.source_name.clone(),
                summary: s.summary.clone(),
                language: s.summary_language,
                category: s.article.category,
            })
            .collect();

        Ok(SummarizeResponse {
            success: true,
            total_articles: articles.len(),
            articles,
            extracted_keywords: keyword_set.map(|k| k.terms.clone()),
            partial: deadline.expired(),
            errors: std::mem::take(errors),
            processed_at: self.deps.clock.now(),
        })
    }

    /// Fused extract-then-summarize pipeline. The two fan-outs are chained
    /// without a barrier: an extracted article flows straight into the LLM
    /// stage while slower extractions are still in flight, and the LLM cap
    /// backpressures extraction instead of letting it buffer unboundedly.
    async fn process_entries(
        &self,
        selected: Vec<FeedEntry>,
        req: &PipelineRequest,
        deadline: Deadline,
        errors: &mut Vec<StageError>,
    ) -> Vec<(usize, SummarizedArticle)> {
        let extract_timeout = self.config.pipeline.extract_timeout();
        let llm_timeout = self.config.pipeline.llm_timeout();
        let extract_parallelism = self.config.pipeline.article_parallelism.max(1);
        let llm_parallelism = self.config.pipeline.llm_parallelism.max(1);
        let cfg = &self.config.extraction;
        let llm_cfg = &self.config.llm;
        let language = req.language;
        let custom_prompt = req.custom_prompt.clone();

        enum Step {
            Ready(usize, Article),
            Failed(StageError),
        }

        let outcomes: Vec<Result<(usize, SummarizedArticle), StageError>> =
            stream::iter(selected.into_iter().enumerate())
                .map(|(idx, entry)| {
                    let client = self.deps.http.clone();
                    let clock = self.deps.clock.clone();
                    async move {
                        if deadline.expired() {
                            return Step::Failed(StageError::extract(
                                entry.link.clone(),
                                &ExtractError::Timeout,
                            ));
                        }
                        let budget = deadline.stage_budget(extract_timeout);
                        match scraping::extract_article(
                            &client,
                            &entry.link,
                            &entry.source_name,
                            entry.category,
                            budget,
                            cfg,
                            clock.now(),
                        )
                        .await
                        {
                            Ok(mut article) => {
                                // Feed titles are often richer than what the page yields.
                                if article.title.is_empty() {
                                    article.title = entry.title.clone();
                                }
                                Step::Ready(idx, article)
                            }
                            Err(e) => {
                                warn!(url = %entry.link, error = %e, "article extraction failed");
                                Step::Failed(StageError::extract(entry.link.clone(), &e))
                            }
                        }
                    }
                })
                .buffer_unordered(extract_parallelism)
                .map(|step| {
                    let llm = self.deps.llm.clone();
                    let clock = self.deps.clock.clone();
                    let custom_prompt = custom_prompt.clone();
                    async move {
                        let (idx, article) = match step {
                            Step::Failed(err) => return Err(err),
                            Step::Ready(idx, article) => (idx, article),
                        };
                        if deadline.expired() {
                            return Err(StageError::summarize(
                                article.url.clone(),
                                &crate::error::LlmError::Timeout,
                            ));
                        }
                        let budget = deadline.stage_budget(llm_timeout);
                        match summarizer::summarize_article(
                            llm.as_ref(),
                            &article,
                            language,
                            custom_prompt.as_deref(),
                            llm_cfg,
                            budget,
                            clock.now(),
                        )
                        .await
                        {
                            Ok(summary) => Ok((idx, summary)),
                            Err(e) => {
                                warn!(url = %article.url, error = %e, "summarization failed");
                                Err(StageError::summarize(article.url.clone(), &e))
                            }
                        }
                    }
                })
                .buffer_unordered(llm_parallelism)
                .collect()
                .await;

        let mut summaries = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(pair) => summaries.push(pair),
                Err(err) => errors.push(err),
            }
        }
        summaries
    }

    async fn persist_stage(
        &self,
        user_id: &str,
        store: &Arc<HistoryStore>,
        summaries: &[SummarizedArticle],
        keyword_set: Option<&KeywordSet>,
        errors: &mut Vec<StageError>,
    ) {
        for item in summaries {
            let record = NewHistoryRecord {
                user_id: user_id.to_string(),
                article_url: item.article.url.clone(),
                article_title: item.article.title.clone(),
                content_excerpt: item.article.body.chars().take(300).collect(),
                summary_text: item.summary.clone(),
                summary_language: item.summary_language,
                original_length: item.article.body.chars().count() as i64,
                summary_length: item.summary.chars().count() as i64,
                keywords: keyword_set.map(|k| k.terms.clone()).unwrap_or_default(),
                category: item.article.category,
                created_at: self.deps.clock.now(),
            };
            match store.insert(record).await {
                Ok(InsertOutcome::Inserted(_)) => {}
                Ok(InsertOutcome::DuplicateIgnored) => {
                    debug!(url = %item.article.url, "history insert ignored as duplicate");
                }
                Err(e) => {
                    warn!(url = %item.article.url, error = %e, "history insert failed");
                    errors.push(StageError::persist(item.article.url.clone(), e.to_string()));
                }
            }
        }
    }

    async fn mail_stage(
        &self,
        recipient: &str,
        summaries: &[SummarizedArticle],
        language: Language,
        errors: &mut Vec<StageError>,
    ) {
        let Some(mailer) = self.deps.mailer.as_ref() else {
            errors.push(StageError::mail("no mail transport configured"));
            return;
        };

        let digest = mailer::render_digest(summaries, language, self.deps.clock.now());
        if let Err(e) = mailer
            .send(recipient, &digest.subject, &digest.html_body, &digest.text_body)
            .await
        {
            warn!(error = %e, "digest mail failed");
            errors.push(StageError::mail(e.to_string()));
        } else {
            info!(articles = summaries.len(), "digest mailed");
        }
    }
}

fn validate(req: &PipelineRequest) -> Result<RequestMode, CoreError> {
    let has_query = req
        .query
        .as_deref()
        .map(|q| !q.trim().is_empty())
        .unwrap_or(false);
    let has_urls = !req.rss_urls.is_empty() || !req.article_urls.is_empty();

    match (has_query, has_urls) {
        (true, false) => Ok(RequestMode::Query),
        (false, true) => Ok(RequestMode::Urls),
        (true, true) => Err(CoreError::InvalidRequest(
            "query and explicit URL lists are mutually exclusive".to_string(),
        )),
        (false, false) => Err(CoreError::InvalidRequest(
            "one of query or rssUrls/articleUrls is required".to_string(),
        )),
    }
}

/// Replay key: user, language, and either the query or the sorted URL set.
fn cache_key(req: &PipelineRequest) -> String {
    let user = req.user_id.as_deref().unwrap_or("");
    match req.query.as_deref() {
        Some(q) => format!("q|{}|{}|{}", user, req.language.as_str(), q.trim()),
        None => {
            let mut urls: Vec<&str> = req
                .rss_urls
                .iter()
                .chain(req.article_urls.iter())
                .map(String::as_str)
                .collect();
            urls.sort_unstable();
            format!("u|{}|{}|{}", user, req.language.as_str(), urls.join(","))
        }
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_mixed_and_empty_requests() {
        let mixed = PipelineRequest {
            query: Some("뉴스".to_string()),
            rss_urls: vec!["http://x/a".to_string()],
            max_articles: 5,
            ..Default::default()
        };
        assert!(matches!(validate(&mixed), Err(CoreError::InvalidRequest(_))));

        let empty = PipelineRequest {
            max_articles: 5,
            ..Default::default()
        };
        assert!(matches!(validate(&empty), Err(CoreError::InvalidRequest(_))));
    }

    #[test]
    fn cache_key_ignores_url_order() {
        let a = PipelineRequest {
            rss_urls: vec!["http://x/a".to_string(), "http://x/b".to_string()],
            user_id: Some("u1".to_string()),
            max_articles: 5,
            ..Default::default()
        };
        let b = PipelineRequest {
            rss_urls: vec!["http://x/b".to_string(), "http://x/a".to_string()],
            user_id: Some("u1".to_string()),
            max_articles: 5,
            ..Default::default()
        };
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn cache_key_distinguishes_language_and_user() {
        let base = PipelineRequest {
            query: Some("반도체".to_string()),
            user_id: Some("u1".to_string()),
            max_articles: 5,
            ..Default::default()
        };
        let other_lang = PipelineRequest {
            language: Language::En,
            ..base.clone()
        };
        let other_user = PipelineRequest {
            user_id: Some("u2".to_string()),
            ..base.clone()
        };
        assert_ne!(cache_key(&base), cache_key(&other_lang));
        assert_ne!(cache_key(&base), cache_key(&other_user));
    }

    #[test]
    fn deadline_budget_is_min_of_stage_and_remaining() {
        let deadline = Deadline::after(Duration::from_secs(10));
        let budget = deadline.stage_budget(Duration::from_secs(60));
        assert!(budget <= Duration::from_secs(10));
        let budget = deadline.stage_budget(Duration::from_secs(2));
        assert_eq!(budget, Duration::from_secs(2));
    }
}
