use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// News section a feed source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    General,
    It,
    Economy,
    Broadcast,
    Politics,
    Society,
    Culture,
    International,
    Entertainment,
    Sports,
    Government,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::General,
        Category::It,
        Category::Economy,
        Category::Broadcast,
        Category::Politics,
        Category::Society,
        Category::Culture,
        Category::International,
        Category::Entertainment,
        Category::Sports,
        Category::Government,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::It => "it",
            Category::Economy => "economy",
            Category::Broadcast => "broadcast",
            Category::Politics => "politics",
            Category::Society => "society",
            Category::Culture => "culture",
            Category::International => "international",
            Category::Entertainment => "entertainment",
            Category::Sports => "sports",
            Category::Government => "government",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| CoreError::Config(format!("unknown feed category: {}", s)))
    }
}

/// One curated RSS/Atom source. Immutable after registry load; keyed by `rss_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub category: Category,
    pub rss_url: String,
}

impl FeedSource {
    pub fn new(name: &str, category: Category, rss_url: &str) -> Self {
        Self {
            name: name.to_string(),
            category,
            rss_url: rss_url.to_string(),
        }
    }
}

/// Static table of curated feed sources, loaded once at process start and
/// shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct FeedRegistry {
    sources: Vec<FeedSource>,
}

impl FeedRegistry {
    /// Build a registry from an explicit source list. Duplicate `rss_url`
    /// entries are collapsed (first occurrence wins). Fails unless every
    /// supported category has at least one feed.
    pub fn new(sources: Vec<FeedSource>) -> Result<Self, CoreError> {
        let mut seen = HashSet::new();
        let deduped: Vec<FeedSource> = sources
            .into_iter()
            .filter(|s| seen.insert(s.rss_url.clone()))
            .collect();

        let covered: HashSet<Category> = deduped.iter().map(|s| s.category).collect();
        for category in Category::ALL {
            if !covered.contains(&category) {
                return Err(CoreError::Config(format!(
                    "no feeds configured for category '{}'",
                    category
                )));
            }
        }

        tracing::info!(sources = deduped.len(), "feed registry loaded");
        Ok(Self { sources: deduped })
    }

    /// The built-in curated table of Korean news feeds, optionally extended
    /// with sources from configuration.
    pub fn built_in_with(extra: &[common::FeedSourceConfig]) -> Result<Self, CoreError> {
        let mut sources = built_in_sources();
        for f in extra {
            sources.push(FeedSource {
                name: f.name.clone(),
                category: f.category.parse()?,
                rss_url: f.rss_url.clone(),
            });
        }
        Self::new(sources)
    }

    pub fn built_in() -> Result<Self, CoreError> {
        Self::built_in_with(&[])
    }

    pub fn list(&self) -> &[FeedSource] {
        &self.sources
    }

    pub fn by_category(&self, category: Category) -> Vec<&FeedSource> {
        self.sources
            .iter()
            .filter(|s| s.category == category)
            .collect()
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.sources.iter().map(|s| s.category).collect()
    }
}

fn built_in_sources() -> Vec<FeedSource> {
    use Category::*;
    vec![
        FeedSource::new("연합뉴스 주요뉴스", General, "https://www.yna.co.kr/rss/news.xml"),
        FeedSource::new("한겨레", General, "https://www.hani.co.kr/rss/"),
        FeedSource::new("전자신문", It, "http://rss.etnews.com/Section902.xml"),
        FeedSource::new("ZDNet Korea", It, "https://feeds.feedburner.com/zdkorea"),
        FeedSource::new("매일경제 경제", Economy, "https://www.mk.co.kr/rss/30100041/"),
        FeedSource::new("한국경제 경제", Economy, "https://www.hankyung.com/feed/economy"),
        FeedSource::new("SBS 뉴스", Broadcast, "https://news.sbs.co.kr/news/SectionRssFeed.do?sectionId=01"),
        FeedSource::new("KBS 뉴스", Broadcast, "http://world.kbs.co.kr/rss/rss_news.htm?lang=k"),
        FeedSource::new("연합뉴스 정치", Politics, "https://www.yna.co.kr/rss/politics.xml"),
        FeedSource::new("연합뉴스 사회", Society, "https://www.yna.co.kr/rss/society.xml"),
        FeedSource::new("한겨레 사회", Society, "https://www.hani.co.kr/rss/society/"),
        FeedSource::new("연합뉴스 문화", Culture, "https://www.yna.co.kr/rss/culture.xml"),
        FeedSource::new("연합뉴스 국제", International, "https://www.yna.co.kr/rss/international.xml"),
        FeedSource::new("연합뉴스 연예", Entertainment, "https://www.yna.co.kr/rss/entertainment.xml"),
        FeedSource::new("연합뉴스 스포츠", Sports, "https://www.yna.co.kr/rss/sports.xml"),
        FeedSource::new("대한민국 정책브리핑", Government, "https://www.korea.kr/rss/policy.xml"),
    ]
}
