use chrono::{Duration, TimeZone, Utc};
use newsdigest::error::CoreError;
use newsdigest::llm::Language;
use newsdigest::registry::Category;
use newsdigest::storage::{
    FeedbackRecord, FeedbackType, HistoryStore, InsertOutcome, NewHistoryRecord,
};

async fn store() -> HistoryStore {
    let pool = common::init_db_pool(":memory:").await.expect("pool");
    let store = HistoryStore::new(pool);
    store.ensure_schema().await.expect("schema");
    store
}

fn record(user: &str, url: &str, offset_days: i64) -> NewHistoryRecord {
    let created = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap() - Duration::days(offset_days);
    NewHistoryRecord {
        user_id: user.to_string(),
        article_url: url.to_string(),
        article_title: format!("기사 {}", url),
        content_excerpt: "본문 발췌".to_string(),
        summary_text: "요약 본문".to_string(),
        summary_language: Language::Ko,
        original_length: 1200,
        summary_length: 80,
        keywords: vec!["반도체".to_string(), "수출".to_string()],
        category: Some(Category::It),
        created_at: created,
    }
}

// Inserting the same record twice within the same second keeps one row.
#[tokio::test]
async fn duplicate_insert_is_ignored() {
    let store = store().await;

    let first = store.insert(record("u1", "http://x/1", 0)).await.expect("insert");
    assert!(matches!(first, InsertOutcome::Inserted(_)));

    let second = store.insert(record("u1", "http://x/1", 0)).await.expect("insert");
    assert_eq!(second, InsertOutcome::DuplicateIgnored);

    let (_, total) = store.list("u1", 1, 10, None).await.expect("list");
    assert_eq!(total, 1);
}

// A different user or a different second is a distinct row.
#[tokio::test]
async fn uniqueness_is_scoped_to_user_and_second() {
    let store = store().await;

    store.insert(record("u1", "http://x/1", 0)).await.expect("insert");
    let other_user = store.insert(record("u2", "http://x/1", 0)).await.expect("insert");
    assert!(matches!(other_user, InsertOutcome::Inserted(_)));

    let mut later = record("u1", "http://x/1", 0);
    later.created_at = later.created_at + Duration::seconds(2);
    let later = store.insert(later).await.expect("insert");
    assert!(matches!(later, InsertOutcome::Inserted(_)));
}

#[tokio::test]
async fn list_pages_newest_first() {
    let store = store().await;
    for i in 0..5 {
        store
            .insert(record("u1", &format!("http://x/{}", i), i))
            .await
            .expect("insert");
    }

    let (page1, total) = store.list("u1", 1, 2, None).await.expect("list");
    assert_eq!(total, 5);
    assert_eq!(page1.len(), 2);
    // offset_days 0 is the newest record
    assert_eq!(page1[0].article_url, "http://x/0");
    assert_eq!(page1[1].article_url, "http://x/1");

    let (page3, _) = store.list("u1", 3, 2, None).await.expect("list");
    assert_eq!(page3.len(), 1);
    assert_eq!(page3[0].article_url, "http://x/4");

    let (other, total_other) = store.list("u2", 1, 10, None).await.expect("list");
    assert!(other.is_empty());
    assert_eq!(total_other, 0);
}

#[tokio::test]
async fn list_filters_by_language() {
    let store = store().await;
    store.insert(record("u1", "http://x/ko", 0)).await.expect("insert");
    let mut en = record("u1", "http://x/en", 1);
    en.summary_language = Language::En;
    store.insert(en).await.expect("insert");

    let (records, total) = store.list("u1", 1, 10, Some(Language::En)).await.expect("list");
    assert_eq!(total, 1);
    assert_eq!(records[0].article_url, "http://x/en");
    assert_eq!(records[0].summary_language, "en");
}

#[tokio::test]
async fn keyword_and_category_multisets_respect_window() {
    let store = store().await;
    store.insert(record("u1", "http://x/recent1", 1)).await.expect("insert");
    store.insert(record("u1", "http://x/recent2", 2)).await.expect("insert");

    let mut old = record("u1", "http://x/old", 60);
    old.keywords = vec!["옛날".to_string()];
    old.category = Some(Category::Sports);
    store.insert(old).await.expect("insert");

    let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
    let since = now - Duration::days(30);

    let keywords = store.keywords_of_user("u1", since).await.expect("keywords");
    assert_eq!(keywords[0], ("반도체".to_string(), 2));
    assert!(keywords.iter().all(|(k, _)| k != "옛날"));

    let categories = store.categories_of_user("u1", since).await.expect("categories");
    assert_eq!(categories, vec![(Category::It, 2)]);
}

#[tokio::test]
async fn urls_cover_full_history() {
    let store = store().await;
    store.insert(record("u1", "http://x/recent", 1)).await.expect("insert");
    store.insert(record("u1", "http://x/old", 90)).await.expect("insert");

    let urls = store.urls_of_user("u1").await.expect("urls");
    assert!(urls.contains("http://x/recent"));
    assert!(urls.contains("http://x/old"));
}

#[tokio::test]
async fn feedback_rating_validated() {
    let store = store().await;

    let valid = FeedbackRecord {
        user_id: "u1".to_string(),
        article_url: "http://x/1".to_string(),
        rating: 5,
        feedback_type: FeedbackType::Positive,
        created_at: Utc::now(),
    };
    store.insert_feedback(valid).await.expect("feedback");

    let invalid = FeedbackRecord {
        user_id: "u1".to_string(),
        article_url: "http://x/1".to_string(),
        rating: 6,
        feedback_type: FeedbackType::Negative,
        created_at: Utc::now(),
    };
    let err = store.insert_feedback(invalid).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidRequest(_)));
}

#[tokio::test]
async fn recommendation_clicks_recorded() {
    let store = store().await;
    store
        .insert_recommendation_click("u1", "http://x/1", Utc::now())
        .await
        .expect("click");
}

#[tokio::test]
async fn stats_count_by_language() {
    let store = store().await;
    store.insert(record("u1", "http://x/1", 0)).await.expect("insert");
    store.insert(record("u1", "http://x/2", 1)).await.expect("insert");
    let mut en = record("u1", "http://x/3", 2);
    en.summary_language = Language::En;
    store.insert(en).await.expect("insert");

    let stats = store.stats("u1").await.expect("stats");
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_language[0], ("ko".to_string(), 2));
}
