use chrono::{DateTime, Utc};

use crate::llm::{Language, summarizer::SummarizedArticle};

/// Rendered digest ready for a mail transport.
#[derive(Debug, Clone)]
pub struct Digest {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

#[derive(Debug, thiserror::Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

/// Injected mail transport. Failures never poison the pipeline response;
/// they are collected under the `mail` stage.
#[async_trait::async_trait]
pub trait MailSender: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<(), MailError>;
}

/// Render one digest block per summarized article, as HTML and plaintext.
pub fn render_digest(
    articles: &[SummarizedArticle],
    language: Language,
    produced_at: DateTime<Utc>,
) -> Digest {
    let date = produced_at.format("%Y-%m-%d");
    let subject = match language {
        Language::Ko => format!("뉴스 요약 {}건 - {}", articles.len(), date),
        Language::En => format!("News digest: {} articles - {}", articles.len(), date),
    };

    let mut html = String::new();
    html.push_str("<html><body>");
    html.push_str(&format!("<h2>{}</h2>", escape_html(&subject)));
    for item in articles {
        html.push_str("<div style=\"margin-bottom:1.5em\">");
        html.push_str(&format!(
            "<h3><a href=\"{}\">{}</a></h3>",
            escape_html(&item.article.url),
            escape_html(&item.article.title)
        ));
        html.push_str(&format!(
            "<p style=\"color:#888\">{}</p>",
            escape_html(&item.article.source_name)
        ));
        html.push_str(&format!("<p>{}</p>", escape_html(&item.summary).replace('\n', "<br>")));
        html.push_str("</div>");
    }
    html.push_str("</body></html>");

    let mut text = String::new();
    text.push_str(&subject);
    text.push_str("\n\n");
    for (i, item) in articles.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, item.article.title));
        text.push_str(&format!("   {}\n", item.article.url));
        text.push_str(&format!("   ({})\n", item.article.source_name));
        text.push_str(&format!("{}\n\n", item.summary));
    }

    Digest {
        subject,
        html_body: html,
        text_body: text,
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Category;
    use crate::scraping::Article;

    fn summarized(title: &str, summary: &str) -> SummarizedArticle {
        SummarizedArticle {
            article: Article {
                title: title.to_string(),
                url: "http://example.com/news/1".to_string(),
                body: "본문 ".repeat(100),
                source_name: "연합뉴스".to_string(),
                category: Some(Category::It),
                fetched_at: Utc::now(),
            },
            summary: summary.to_string(),
            summary_language: Language::Ko,
            model: "gpt-3.5-turbo".to_string(),
            produced_at: Utc::now(),
        }
    }

    #[test]
    fn digest_has_one_block_per_article() {
        let items = vec![
            summarized("첫 기사", "첫 요약."),
            summarized("둘째 기사", "둘째 요약."),
        ];
        let digest = render_digest(&items, Language::Ko, Utc::now());

        assert!(digest.subject.contains("2건"));
        assert_eq!(digest.html_body.matches("<h3>").count(), 2);
        assert!(digest.html_body.contains("첫 요약."));
        assert!(digest.text_body.contains("1. 첫 기사"));
        assert!(digest.text_body.contains("2. 둘째 기사"));
    }

    #[test]
    fn summary_markup_is_escaped() {
        let items = vec![summarized("<b>제목</b>", "요약 & 내용")];
        let digest = render_digest(&items, Language::Ko, Utc::now());
        assert!(digest.html_body.contains("&lt;b&gt;제목&lt;/b&gt;"));
        assert!(digest.html_body.contains("요약 &amp; 내용"));
    }

    #[test]
    fn english_subject_for_english_digest() {
        let digest = render_digest(&[], Language::En, Utc::now());
        assert!(digest.subject.starts_with("News digest: 0 articles"));
    }
}
