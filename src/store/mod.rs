//! Article store
//!
//! Read-only access to collected news articles. The pipeline only ever
//! queries; ingestion lives elsewhere.

pub mod postgres;

pub use postgres::PostgresArticleStore;

use crate::models::Article;
use crate::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Collection dates follow the Beijing calendar day (UTC+8).
pub fn collection_date_today() -> NaiveDate {
    (Utc::now() + Duration::hours(8)).date_naive()
}

/// Date range (inclusive) plus optional filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleQuery {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Exact source names. Empty means all sources.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Case-insensitive, any-of, over title and summary.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub newest_first: bool,
}

impl ArticleQuery {
    pub fn for_date(date: NaiveDate) -> Self {
        Self::range(date, date)
    }

    pub fn range(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            sources: Vec::new(),
            keywords: Vec::new(),
            limit: None,
            newest_first: false,
        }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn matches(&self, article: &Article) -> bool {
        let date = article.published_at.date_naive();
        date >= self.start && date <= self.end && self.matches_filters(article)
    }

    /// Source and keyword filters only.
    pub fn matches_filters(&self, article: &Article) -> bool {
        let source_ok = self.sources.is_empty() || self.sources.iter().any(|s| s == &article.source);
        if !source_ok {
            return false;
        }
        if self.keywords.is_empty() {
            return true;
        }

        let haystack = format!("{}\n{}", article.title, article.summary).to_lowercase();
        self.keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .any(|k| haystack.contains(&k))
    }

    /// Filter, order by publication time and apply the limit.
    pub fn apply(&self, articles: impl IntoIterator<Item = Article>) -> Vec<Article> {
        let mut matched: Vec<Article> = articles
            .into_iter()
            .filter(|a| self.matches_filters(a))
            .collect();

        matched.sort_by(|a, b| a.published_at.cmp(&b.published_at).then(a.id.cmp(&b.id)));
        if self.newest_first {
            matched.reverse();
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[async_trait::async_trait]
pub trait ArticleStore: Send + Sync {
    async fn query_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>>;
}

/// In-memory article store for development and tests
pub struct InMemoryArticleStore {
    articles: Arc<RwLock<Vec<Article>>>,
}

impl InMemoryArticleStore {
    pub fn new() -> Self {
        Self {
            articles: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_articles(articles: Vec<Article>) -> Self {
        Self {
            articles: Arc::new(RwLock::new(articles)),
        }
    }

    pub async fn insert(&self, article: Article) {
        self.articles.write().await.push(article);
    }

    pub async fn len(&self) -> usize {
        self.articles.read().await.len()
    }
}

impl Default for InMemoryArticleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArticleStore for InMemoryArticleStore {
    async fn query_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>> {
        let articles = self.articles.read().await;
        let in_range = articles.iter().filter(|a| query.matches(a)).cloned();
        Ok(query.apply(in_range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn article(id: &str, source: &str, title: &str, day: u32, hour: u32) -> Article {
        Article {
            id: id.to_string(),
            title: title.to_string(),
            summary: String::new(),
            body: None,
            source: source.to_string(),
            link: None,
            published_at: Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap(),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn store() -> InMemoryArticleStore {
        InMemoryArticleStore::with_articles(vec![
            article("1", "财新", "Gold hits record", 15, 9),
            article("2", "华尔街见闻", "美联储维持利率", 15, 8),
            article("3", "财新", "A股收评", 16, 7),
        ])
    }

    #[tokio::test]
    async fn test_query_by_date_orders_oldest_first() {
        let found = store().query_articles(&ArticleQuery::for_date(date(15))).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_range_is_inclusive_with_limit_newest_first() {
        let mut query = ArticleQuery::range(date(15), date(16)).with_limit(2);
        query.newest_first = true;

        let found = store().query_articles(&query).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn test_source_and_keyword_filters() {
        let store = store();

        let by_source = ArticleQuery::range(date(15), date(16)).with_sources(vec!["财新".to_string()]);
        assert_eq!(store.query_articles(&by_source).await.unwrap().len(), 2);

        let by_keyword = ArticleQuery::range(date(15), date(16)).with_keywords(vec!["GOLD".to_string()]);
        let found = store.query_articles(&by_keyword).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "1");
    }

    #[tokio::test]
    async fn test_empty_range() {
        let found = tokio_test::assert_ok!(store().query_articles(&ArticleQuery::for_date(date(20))).await);
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_insert_then_query() {
        let store = InMemoryArticleStore::new();
        store.insert(article("9", "路透", "Oil slips", 15, 12)).await;
        assert_eq!(store.len().await, 1);

        let found = tokio_test::assert_ok!(store.query_articles(&ArticleQuery::for_date(date(15))).await);
        assert_eq!(found.len(), 1);
        assert!(!ArticleQuery::range(date(16), date(15)).is_valid());
    }
}
