use crate::ingestion::FeedEntry;
use crate::keywords::KeywordSet;

const TITLE_WEIGHT: u32 = 3;
const SNIPPET_WEIGHT: u32 = 1;

/// Rank entries by keyword relevance and keep the top `limit`.
///
/// Score is `3 * titleHits + 1 * snippetHits` summed over all terms, hits
/// being case-insensitive substring counts. Zero-score entries are dropped.
/// Ties go to the newer `published_at`; entries without a timestamp keep
/// their input order.
pub fn filter_entries(entries: Vec<FeedEntry>, keywords: &KeywordSet, limit: usize) -> Vec<FeedEntry> {
    let mut scored: Vec<(u32, usize, FeedEntry)> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let score = score_entry(&entry, keywords);
            (score > 0).then_some((score, idx, entry))
        })
        .collect();

    scored.sort_by(|(score_a, idx_a, a), (score_b, idx_b, b)| {
        score_b
            .cmp(score_a)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| idx_a.cmp(idx_b))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|(_, _, entry)| entry)
        .collect()
}

pub fn score_entry(entry: &FeedEntry, keywords: &KeywordSet) -> u32 {
    let title = entry.title.to_lowercase();
    let snippet = entry
        .snippet
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    keywords
        .terms
        .iter()
        .map(|term| {
            TITLE_WEIGHT * count_hits(&title, term) + SNIPPET_WEIGHT * count_hits(&snippet, term)
        })
        .sum()
}

fn count_hits(haystack: &str, needle: &str) -> u32 {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0u32;
    let mut rest = haystack;
    while let Some(pos) = rest.find(needle) {
        count += 1;
        rest = &rest[pos + needle.len()..];
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::LanguageHint;
    use chrono::{TimeZone, Utc};

    fn entry(title: &str, snippet: Option<&str>, published_h: Option<u32>) -> FeedEntry {
        FeedEntry {
            title: title.to_string(),
            link: format!("http://example.com/{}", title.len()),
            published_at: published_h.map(|h| Utc.with_ymd_and_hms(2024, 7, 1, h, 0, 0).unwrap()),
            snippet: snippet.map(String::from),
            source_name: "테스트".to_string(),
            category: None,
        }
    }

    fn kw(terms: &[&str]) -> KeywordSet {
        KeywordSet {
            terms: terms.iter().map(|t| t.to_string()).collect(),
            language_hint: LanguageHint::Auto,
        }
    }

    #[test]
    fn title_hits_outweigh_snippet_hits() {
        let keywords = kw(&["반도체"]);
        let title_hit = entry("반도체 수출 증가", None, None);
        let snippet_hit = entry("수출 증가", Some("반도체 관련 소식"), None);
        assert_eq!(score_entry(&title_hit, &keywords), 3);
        assert_eq!(score_entry(&snippet_hit, &keywords), 1);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let keywords = kw(&["samsung"]);
        let e = entry("Samsung unveils SAMSUNG chip", None, None);
        assert_eq!(score_entry(&e, &keywords), 6);
    }

    #[test]
    fn zero_score_entries_dropped() {
        let keywords = kw(&["반도체"]);
        let entries = vec![
            entry("반도체 뉴스", None, None),
            entry("날씨 소식", None, None),
        ];
        let kept = filter_entries(entries, &keywords, 10);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "반도체 뉴스");
    }

    #[test]
    fn newer_entry_wins_ties() {
        let keywords = kw(&["반도체"]);
        let entries = vec![
            entry("반도체 아침 기사", None, Some(9)),
            entry("반도체 저녁 기사", None, Some(18)),
        ];
        let kept = filter_entries(entries, &keywords, 2);
        assert_eq!(kept[0].title, "반도체 저녁 기사");
    }

    #[test]
    fn identical_timestamps_preserve_input_order() {
        let keywords = kw(&["반도체"]);
        let entries = vec![
            entry("반도체 첫번째", None, Some(9)),
            entry("반도체 두번째", None, Some(9)),
            entry("반도체 셋째", None, None),
            entry("반도체 넷째", None, None),
        ];
        let kept = filter_entries(entries, &keywords, 4);
        assert_eq!(kept[0].title, "반도체 첫번째");
        assert_eq!(kept[1].title, "반도체 두번째");
        assert_eq!(kept[2].title, "반도체 셋째");
        assert_eq!(kept[3].title, "반도체 넷째");
    }

    #[test]
    fn limit_applied_after_ranking() {
        let keywords = kw(&["반도체"]);
        let entries = vec![
            entry("반도체", None, None),
            entry("반도체 반도체", None, None),
            entry("반도체 반도체 반도체", None, None),
        ];
        let kept = filter_entries(entries, &keywords, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].title, "반도체 반도체 반도체");
    }
}
