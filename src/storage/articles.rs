use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite, Transaction};

use super::schema::Database;
use super::types::{Article, ArticleDbRow, ArticleFlag, DatabaseError, ParsedArticle};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Keeps URL IN (...) lists well under SQLite's 999 parameter limit
const URL_BATCH_SIZE: usize = 500;

const ARTICLE_COLUMNS: &str =
    "id, feed_id, url, title, published, summary, read, favorite, hidden, read_later, fetched_at";

impl Database {
    // ========================================================================
    // Article Merge
    // ========================================================================

    /// Upsert articles for a feed in its own transaction, returns the number
    /// of new articles inserted.
    pub async fn upsert_articles(&self, feed_id: i64, articles: &[ParsedArticle]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let inserted = Self::upsert_articles_in(&mut tx, feed_id, articles, now).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Two-phase merge inside an existing transaction.
    ///
    /// Phase 1 inserts unseen URLs with default flags (unread, not favorite,
    /// not hidden, not read-later). Phase 2 refreshes title, published and
    /// summary of rows that already existed. No statement here writes a flag
    /// column, so re-fetching a feed can never reset user state.
    pub(crate) async fn upsert_articles_in(
        tx: &mut Transaction<'_, Sqlite>,
        feed_id: i64,
        articles: &[ParsedArticle],
        now: i64,
    ) -> Result<usize, DatabaseError> {
        let mut inserted = 0usize;

        for article in articles {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO articles (feed_id, url, title, published, summary, fetched_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(feed_id)
            .bind(&article.url)
            .bind(&article.title)
            .bind(article.published)
            .bind(&article.summary)
            .bind(now)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
                continue;
            }

            // fetched_at is left alone to keep the "first seen" timestamp
            sqlx::query(
                "UPDATE articles SET title = ?, published = COALESCE(?, published), summary = COALESCE(?, summary)
                 WHERE feed_id = ? AND url = ?",
            )
            .bind(&article.title)
            .bind(article.published)
            .bind(&article.summary)
            .bind(feed_id)
            .bind(&article.url)
            .execute(&mut **tx)
            .await?;
        }

        Ok(inserted)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Get a single article by its ID.
    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>, DatabaseError> {
        let row = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {} FROM articles WHERE id = ?",
            ARTICLE_COLUMNS
        ))
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArticleDbRow::into_article))
    }

    /// Get articles for a specific feed, newest first, capped at `MAX_ARTICLES`.
    pub async fn get_articles_for_feed(
        &self,
        feed_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let limit = limit.unwrap_or(500).min(MAX_ARTICLES);
        let rows = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {} FROM articles WHERE feed_id = ? ORDER BY published DESC, id DESC LIMIT ?",
            ARTICLE_COLUMNS
        ))
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Get the first article carrying a canonical URL.
    ///
    /// The same URL may appear under several feeds; use
    /// [`Database::get_articles_by_urls`] when every copy matters.
    pub async fn get_article_by_url(&self, url: &str) -> Result<Option<Article>, DatabaseError> {
        let row = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {} FROM articles WHERE url = ? ORDER BY id LIMIT 1",
            ARTICLE_COLUMNS
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArticleDbRow::into_article))
    }

    /// Get every local article whose canonical URL is in `urls`.
    pub async fn get_articles_by_urls(&self, urls: &[String]) -> Result<Vec<Article>, DatabaseError> {
        let mut articles = Vec::new();

        for chunk in urls.chunks(URL_BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {} FROM articles WHERE url IN (",
                ARTICLE_COLUMNS
            ));
            let mut separated = builder.separated(", ");
            for url in chunk {
                separated.push_bind(url);
            }
            separated.push_unseparated(")");

            let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            articles.extend(rows.into_iter().map(ArticleDbRow::into_article));
        }

        Ok(articles)
    }

    /// All articles currently marked favorite.
    pub async fn get_favorite_articles(&self) -> Result<Vec<Article>, DatabaseError> {
        let rows = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {} FROM articles WHERE favorite = 1 ORDER BY id",
            ARTICLE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set one user flag on an article. Returns whether the stored value
    /// changed; setting a flag to its current value is a no-op.
    pub async fn set_article_flag(
        &self,
        article_id: i64,
        flag: ArticleFlag,
        value: bool,
    ) -> Result<bool, DatabaseError> {
        let column = flag.column();
        let result = sqlx::query(&format!(
            "UPDATE articles SET {column} = ? WHERE id = ? AND {column} != ?"
        ))
        .bind(value)
        .bind(article_id)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
