use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::CoreConfig;
use newsdigest::error::LlmError;
use newsdigest::ingestion::build_http_client;
use newsdigest::llm::{ChatMessage, ChatOptions, Language, LlmClient};
use newsdigest::pipeline::{Clock, Collaborators, Pipeline};
use newsdigest::recommend::RecommendationType;
use newsdigest::registry::{Category, FeedRegistry, FeedSource};
use newsdigest::storage::{HistoryStore, NewHistoryRecord};

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
}

struct NoopLlm;

#[async_trait::async_trait]
impl LlmClient for NoopLlm {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
        _budget: Duration,
    ) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("not used in this test".to_string()))
    }
}

fn registry_over(server_url: &str) -> FeedRegistry {
    let sources = Category::ALL
        .iter()
        .map(|&category| {
            let path = match category {
                Category::It => "/it.xml",
                Category::Sports => "/sports.xml",
                _ => "/empty.xml",
            };
            FeedSource::new(
                &format!("{} 소스", category),
                category,
                &format!("{}{}", server_url, path),
            )
        })
        .collect();
    FeedRegistry::new(sources).expect("registry")
}

fn rss(items: &[(&str, &str, &str)]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><rss version="2.0"><channel><title>피드</title>"#,
    );
    for (title, url, pubdate) in items {
        xml.push_str(&format!(
            "<item><title>{}</title><link>{}</link><pubDate>{}</pubDate></item>",
            title, url, pubdate
        ));
    }
    xml.push_str("</channel></rss>");
    xml
}

const EMPTY_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>빈 피드</title></channel></rss>"#;

async fn mount(server: &mut mockito::Server, path: &str, body: String) {
    server
        .mock("GET", path)
        .with_status(200)
        .with_header("content-type", "application/rss+xml; charset=utf-8")
        .with_body(body)
        .create_async()
        .await;
}

async fn store_with_history(history: &[(&str, &[&str], Category)]) -> Arc<HistoryStore> {
    let pool = common::init_db_pool(":memory:").await.expect("pool");
    let store = HistoryStore::new(pool);
    store.ensure_schema().await.expect("schema");

    for (url, keywords, category) in history {
        store
            .insert(NewHistoryRecord {
                user_id: "u1".to_string(),
                article_url: url.to_string(),
                article_title: format!("기사 {}", url),
                content_excerpt: "발췌".to_string(),
                summary_text: "요약".to_string(),
                summary_language: Language::Ko,
                original_length: 1000,
                summary_length: 50,
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                category: Some(*category),
                created_at: fixed_now() - chrono::Duration::days(2),
            })
            .await
            .expect("insert history");
    }
    Arc::new(store)
}

fn pipeline_with(
    server_url: &str,
    store: Arc<HistoryStore>,
) -> Pipeline {
    Pipeline::new(
        CoreConfig::default(),
        registry_over(server_url),
        Collaborators {
            llm: Arc::new(NoopLlm),
            history: Some(store),
            mailer: None,
            clock: Arc::new(FixedClock(fixed_now())),
            http: build_http_client(),
        },
    )
}

// S5: a user with keyword + category history gets keyword/category typed
// recommendations, scored in [0, 1], none already seen.
#[tokio::test]
async fn history_driven_recommendations() {
    let mut server = mockito::Server::new_async().await;
    mount(&mut server, "/empty.xml", EMPTY_RSS.to_string()).await;
    mount(
        &mut server,
        "/it.xml",
        rss(&[
            ("AI chip 발표", "http://news.example/ai-1", "Mon, 01 Jul 2024 10:00:00 +0900"),
            ("ai 모델 경쟁", "http://news.example/ai-2", "Mon, 01 Jul 2024 09:00:00 +0900"),
            ("클라우드 요금", "http://news.example/cloud", "Mon, 01 Jul 2024 08:00:00 +0900"),
            ("이미 본 기사 ai", "http://news.example/seen", "Mon, 01 Jul 2024 07:00:00 +0900"),
        ]),
    )
    .await;
    mount(
        &mut server,
        "/sports.xml",
        rss(&[("축구 결과", "http://news.example/soccer", "Mon, 01 Jul 2024 10:00:00 +0900")]),
    )
    .await;

    let store = store_with_history(&[
        ("http://news.example/seen", &["ai", "chip"], Category::It),
        ("http://news.example/seen-2", &["ai"], Category::It),
    ])
    .await;
    let pipeline = pipeline_with(&server.url(), store);

    let recs = pipeline.get_recommendations("u1", 5).await.expect("recommendations");

    assert!(!recs.is_empty());
    for rec in &recs {
        assert!(
            matches!(
                rec.recommendation_type,
                RecommendationType::Keyword | RecommendationType::Category
            ),
            "unexpected type {:?}",
            rec.recommendation_type
        );
        assert!((0.0..=1.0).contains(&rec.recommendation_score));
        assert_ne!(rec.article_url, "http://news.example/seen");
        assert_ne!(rec.article_url, "http://news.example/seen-2");
    }

    // Scores are monotonically non-increasing.
    for pair in recs.windows(2) {
        assert!(pair[0].recommendation_score >= pair[1].recommendation_score);
    }

    // The strongest keyword match ranks first.
    assert!(recs[0].article_url.starts_with("http://news.example/ai"));
}

// A user with no history gets a trending mix, recency scored.
#[tokio::test]
async fn empty_history_yields_trending() {
    let mut server = mockito::Server::new_async().await;
    mount(&mut server, "/empty.xml", EMPTY_RSS.to_string()).await;
    mount(
        &mut server,
        "/it.xml",
        rss(&[
            ("최신 기사", "http://news.example/new", "Mon, 01 Jul 2024 11:00:00 +0900"),
            ("덜 최신 기사", "http://news.example/older", "Sun, 30 Jun 2024 11:00:00 +0900"),
            ("셋째 기사", "http://news.example/third", "Sat, 29 Jun 2024 11:00:00 +0900"),
        ]),
    )
    .await;
    mount(
        &mut server,
        "/sports.xml",
        rss(&[("야구 소식", "http://news.example/baseball", "Mon, 01 Jul 2024 10:00:00 +0900")]),
    )
    .await;

    let store = store_with_history(&[]).await;
    let pipeline = pipeline_with(&server.url(), store);

    let recs = pipeline.get_recommendations("u1", 5).await.expect("recommendations");

    assert!(!recs.is_empty());
    for rec in &recs {
        assert_eq!(rec.recommendation_type, RecommendationType::Trending);
        assert!((0.0..=1.0).contains(&rec.recommendation_score));
    }
    for pair in recs.windows(2) {
        assert!(pair[0].recommendation_score >= pair[1].recommendation_score);
    }
    // Two per source: at most 2 from the it feed plus the sports entry.
    assert!(recs.len() <= 5);
    assert!(recs.iter().any(|r| r.article_url == "http://news.example/new"));
}

// Property 8 via the full pipeline surface: a summarized article never
// comes back as a recommendation for the same user.
#[tokio::test]
async fn clicked_and_summarized_urls_never_recommended() {
    let mut server = mockito::Server::new_async().await;
    mount(&mut server, "/empty.xml", EMPTY_RSS.to_string()).await;
    mount(
        &mut server,
        "/it.xml",
        rss(&[
            ("ai 기사 하나", "http://news.example/a", "Mon, 01 Jul 2024 10:00:00 +0900"),
            ("ai 기사 둘", "http://news.example/b", "Mon, 01 Jul 2024 09:00:00 +0900"),
        ]),
    )
    .await;
    mount(&mut server, "/sports.xml", EMPTY_RSS.to_string()).await;

    let store = store_with_history(&[("http://news.example/a", &["ai"], Category::It)]).await;
    let pipeline = pipeline_with(&server.url(), store);

    let recs = pipeline.get_recommendations("u1", 20).await.expect("recommendations");
    assert!(recs.iter().all(|r| r.article_url != "http://news.example/a"));
    assert!(recs.iter().any(|r| r.article_url == "http://news.example/b"));

    pipeline
        .record_recommendation_click("u1", "http://news.example/b")
        .await
        .expect("click");
}

// The limit is honoured and capped.
#[tokio::test]
async fn limit_is_applied() {
    let mut server = mockito::Server::new_async().await;
    mount(&mut server, "/empty.xml", EMPTY_RSS.to_string()).await;
    let items: Vec<(String, String, String)> = (0..30)
        .map(|i| {
            (
                format!("ai 기사 {}", i),
                format!("http://news.example/{}", i),
                "Mon, 01 Jul 2024 10:00:00 +0900".to_string(),
            )
        })
        .collect();
    let borrowed: Vec<(&str, &str, &str)> = items
        .iter()
        .map(|(a, b, c)| (a.as_str(), b.as_str(), c.as_str()))
        .collect();
    mount(&mut server, "/it.xml", rss(&borrowed)).await;
    mount(&mut server, "/sports.xml", EMPTY_RSS.to_string()).await;

    let store = store_with_history(&[("http://news.example/x", &["ai"], Category::It)]).await;
    let pipeline = pipeline_with(&server.url(), store);

    let recs = pipeline.get_recommendations("u1", 3).await.expect("recommendations");
    assert_eq!(recs.len(), 3);

    let capped = pipeline.get_recommendations("u1", 99).await.expect("recommendations");
    assert!(capped.len() <= 20);
}
