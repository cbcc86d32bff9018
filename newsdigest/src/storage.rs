use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::CoreError;
use crate::llm::Language;
use crate::registry::Category;

/// One persisted summary. Append-only; never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub user_id: String,
    pub article_url: String,
    pub article_title: String,
    pub content_excerpt: String,
    pub summary_text: String,
    pub summary_language: String,
    pub original_length: i64,
    pub summary_length: i64,
    pub keywords: Vec<String>,
    pub category: Option<Category>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a summary about to enter history.
#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    pub user_id: String,
    pub article_url: String,
    pub article_title: String,
    pub content_excerpt: String,
    pub summary_text: String,
    pub summary_language: Language,
    pub original_length: i64,
    pub summary_length: i64,
    pub keywords: Vec<String>,
    pub category: Option<Category>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The same (user, url, second) row already exists; not an error.
    DuplicateIgnored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Positive,
    Negative,
}

impl FeedbackType {
    fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Positive => "positive",
            FeedbackType::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackRecord {
    pub user_id: String,
    pub article_url: String,
    pub rating: i32,
    pub feedback_type: FeedbackType,
    pub created_at: DateTime<Utc>,
}

/// Per-user history totals (companion of `list`).
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total: i64,
    pub by_language: Vec<(String, i64)>,
}

const MAX_PER_PAGE: u32 = 100;

/// Persistence for summaries, feedback and recommendation clicks, backed by
/// SQLite. The unique index on `(user_id, article_url, created_at_sec)`
/// makes inserts idempotent at one-second granularity.
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summary_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                article_url TEXT NOT NULL,
                article_title TEXT NOT NULL,
                content_excerpt TEXT NOT NULL,
                summary_text TEXT NOT NULL,
                summary_language TEXT NOT NULL,
                original_length INTEGER NOT NULL,
                summary_length INTEGER NOT NULL,
                keywords_json TEXT NOT NULL,
                category TEXT,
                created_at TEXT NOT NULL,
                created_at_sec INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_history_dedup
             ON summary_history(user_id, article_url, created_at_sec)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_user_created
             ON summary_history(user_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                article_url TEXT NOT NULL,
                rating INTEGER NOT NULL,
                feedback_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feedback_user
             ON feedback(user_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recommendation_clicks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                article_url TEXT NOT NULL,
                clicked_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("history store schema ensured");
        Ok(())
    }

    /// Idempotent insert: a second record for the same user, URL and second
    /// is reported as `DuplicateIgnored` and leaves one stored row.
    pub async fn insert(&self, record: NewHistoryRecord) -> Result<InsertOutcome, CoreError> {
        let keywords_json = serde_json::to_string(&record.keywords)
            .map_err(|e| CoreError::InvalidRequest(format!("unencodable keywords: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO summary_history
                (user_id, article_url, article_title, content_excerpt, summary_text,
                 summary_language, original_length, summary_length, keywords_json,
                 category, created_at, created_at_sec)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.article_url)
        .bind(&record.article_title)
        .bind(&record.content_excerpt)
        .bind(&record.summary_text)
        .bind(record.summary_language.as_str())
        .bind(record.original_length)
        .bind(record.summary_length)
        .bind(&keywords_json)
        .bind(record.category.map(|c| c.as_str().to_string()))
        .bind(record.created_at)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(user = %record.user_id, url = %record.article_url, "duplicate summary ignored");
            Ok(InsertOutcome::DuplicateIgnored)
        } else {
            Ok(InsertOutcome::Inserted(result.last_insert_rowid()))
        }
    }

    /// Paginated history, newest first. Pages are 1-indexed; `per_page` is
    /// clamped to 100. Returns the page plus the total matching count.
    pub async fn list(
        &self,
        user_id: &str,
        page: u32,
        per_page: u32,
        language: Option<Language>,
    ) -> Result<(Vec<HistoryRecord>, i64), CoreError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let offset = ((page - 1) * per_page) as i64;

        let (total, rows) = match language {
            Some(lang) => {
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM summary_history WHERE user_id = ? AND summary_language = ?",
                )
                .bind(user_id)
                .bind(lang.as_str())
                .fetch_one(&self.pool)
                .await?;
                let rows = sqlx::query(
                    "SELECT * FROM summary_history
                     WHERE user_id = ? AND summary_language = ?
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(lang.as_str())
                .bind(per_page as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM summary_history WHERE user_id = ?")
                        .bind(user_id)
                        .fetch_one(&self.pool)
                        .await?;
                let rows = sqlx::query(
                    "SELECT * FROM summary_history
                     WHERE user_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(per_page as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };

        let records = rows.iter().map(row_to_record).collect();
        Ok((records, total))
    }

    /// Keyword multiset over the user's history since `since`, most frequent
    /// first.
    pub async fn keywords_of_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>, CoreError> {
        let rows = sqlx::query(
            "SELECT keywords_json FROM summary_history WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in rows {
            let json: String = row.get("keywords_json");
            let keywords: Vec<String> = serde_json::from_str(&json).unwrap_or_default();
            for keyword in keywords {
                *counts.entry(keyword).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, i64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(ranked)
    }

    /// Category multiset over the user's history since `since`.
    pub async fn categories_of_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Category, i64)>, CoreError> {
        let rows = sqlx::query(
            "SELECT category, COUNT(*) AS cnt FROM summary_history
             WHERE user_id = ? AND created_at >= ? AND category IS NOT NULL
             GROUP BY category ORDER BY cnt DESC, category ASC",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let raw: String = row.get("category");
            if let Ok(category) = raw.parse::<Category>() {
                out.push((category, row.get::<i64, _>("cnt")));
            }
        }
        Ok(out)
    }

    /// Every article URL in the user's history, for recommendation exclusion.
    pub async fn urls_of_user(&self, user_id: &str) -> Result<HashSet<String>, CoreError> {
        let rows =
            sqlx::query_scalar::<_, String>("SELECT article_url FROM summary_history WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn insert_feedback(&self, record: FeedbackRecord) -> Result<(), CoreError> {
        if !(1..=5).contains(&record.rating) {
            return Err(CoreError::InvalidRequest(format!(
                "rating must be between 1 and 5, got {}",
                record.rating
            )));
        }

        sqlx::query(
            "INSERT INTO feedback (user_id, article_url, rating, feedback_type, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.user_id)
        .bind(&record.article_url)
        .bind(record.rating)
        .bind(record.feedback_type.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_recommendation_click(
        &self,
        user_id: &str,
        article_url: &str,
        clicked_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO recommendation_clicks (user_id, article_url, clicked_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(article_url)
        .bind(clicked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self, user_id: &str) -> Result<HistoryStats, CoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM summary_history WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT summary_language, COUNT(*) AS cnt FROM summary_history
             WHERE user_id = ? GROUP BY summary_language ORDER BY cnt DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let by_language = rows
            .iter()
            .map(|r| (r.get::<String, _>("summary_language"), r.get::<i64, _>("cnt")))
            .collect();

        Ok(HistoryStats { total, by_language })
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> HistoryRecord {
    let keywords: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("keywords_json")).unwrap_or_default();
    let category = row
        .get::<Option<String>, _>("category")
        .and_then(|c| c.parse::<Category>().ok());

    HistoryRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        article_url: row.get("article_url"),
        article_title: row.get("article_title"),
        content_excerpt: row.get("content_excerpt"),
        summary_text: row.get("summary_text"),
        summary_language: row.get("summary_language"),
        original_length: row.get("original_length"),
        summary_length: row.get("summary_length"),
        keywords,
        category,
        created_at: row.get("created_at"),
    }
}
