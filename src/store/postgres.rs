//! Read-only Postgres adapter over the collector's tables
//!
//! `news_articles` rows joined with `rss_sources` for the source name.
//! Dates are matched on `collection_date`.

use super::{ArticleQuery, ArticleStore};
use crate::error::PipelineError;
use crate::models::Article;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

pub struct PostgresArticleStore {
    pool: PgPool,
}

impl PostgresArticleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily connecting pool; the first query opens the connection.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }
}

fn select_sql(newest_first: bool) -> String {
    let direction = if newest_first { "DESC" } else { "ASC" };
    format!(
        r#"
        SELECT a.id::TEXT AS id, a.title, a.link, a.summary, a.content,
               s.source_name,
               COALESCE(a.published, a.created_at) AS published_at
        FROM news_articles a
        JOIN rss_sources s ON a.source_id = s.id
        WHERE a.collection_date BETWEEN $1 AND $2
          AND (cardinality($3::TEXT[]) = 0 OR s.source_name = ANY($3::TEXT[]))
        ORDER BY COALESCE(a.published, a.created_at) {}
        "#,
        direction
    )
}

#[async_trait::async_trait]
impl ArticleStore for PostgresArticleStore {
    async fn query_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>> {
        let rows = sqlx::query(&select_sql(query.newest_first))
            .bind(query.start)
            .bind(query.end)
            .bind(&query.sources)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Store(format!("news_articles query failed: {}", e)))?;

        let mut articles = Vec::with_capacity(rows.len());
        for row in rows {
            let published_at: DateTime<Utc> = row.try_get("published_at")?;
            articles.push(Article {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                summary: row
                    .try_get::<Option<String>, _>("summary")?
                    .unwrap_or_default(),
                body: row.try_get("content")?,
                source: row.try_get("source_name")?,
                link: row.try_get("link")?,
                published_at,
            });
        }

        debug!(
            start = %query.start,
            end = %query.end,
            rows = articles.len(),
            "Articles loaded from Postgres"
        );

        // Keyword filter and limit run after the fetch so the limit applies
        // to matching articles only.
        Ok(query.apply(articles))
    }
}
