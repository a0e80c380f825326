use anyhow::Result;

use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedDbRow, FeedKind, NewFeed, ParsedArticle};

const FEED_COLUMNS: &str = "id, title, url, category, kind, auth_username, auth_password, \
                            proxy_enabled, proxy_url, last_fetched, error, consecutive_failures";

/// Pseudo-URL of the feed holding articles imported from the reader service.
pub const READER_FEED_URL: &str = "reader://synced";
const READER_FEED_TITLE: &str = "Reader Synced Articles";
const READER_FEED_CATEGORY: &str = "Reader";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a subscription, or update its title/category/kind if the URL is
    /// already subscribed. Returns the feed id.
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, category, kind, auth_username, auth_password,
                               proxy_enabled, proxy_url)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                kind = excluded.kind,
                auth_username = excluded.auth_username,
                auth_password = excluded.auth_password,
                proxy_enabled = excluded.proxy_enabled,
                proxy_url = excluded.proxy_url
            RETURNING id
        "#,
        )
        .bind(&feed.title)
        .bind(&feed.url)
        .bind(&feed.category)
        .bind(feed.kind.as_str())
        .bind(&feed.auth_username)
        .bind(&feed.auth_password)
        .bind(feed.proxy_enabled)
        .bind(&feed.proxy_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Insert a subscription unless its URL is already subscribed. Existing
    /// rows are left alone. Returns whether a feed was added.
    pub async fn insert_feed_if_missing(&self, feed: &NewFeed) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO feeds (title, url, category, kind) VALUES (?, ?, ?, ?)
             ON CONFLICT(url) DO NOTHING",
        )
        .bind(&feed.title)
        .bind(&feed.url)
        .bind(&feed.category)
        .bind(feed.kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store articles imported from the reader service under the reader
    /// feed, creating that feed on first use. Returns the number of new
    /// articles; flags of existing ones are untouched.
    pub async fn import_reader_articles(&self, articles: &[ParsedArticle]) -> Result<usize, DatabaseError> {
        if articles.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let (feed_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, category, kind, last_fetched)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET last_fetched = excluded.last_fetched
            RETURNING id
        "#,
        )
        .bind(READER_FEED_TITLE)
        .bind(READER_FEED_URL)
        .bind(READER_FEED_CATEGORY)
        .bind(FeedKind::Reader.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = Self::upsert_articles_in(&mut tx, feed_id, articles, now).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Get all feeds ordered by title
    pub async fn get_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {} FROM feeds ORDER BY title", FEED_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(FeedDbRow::into_feed).collect()
    }

    /// Get a single feed by id
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {} FROM feeds WHERE id = ?", FEED_COLUMNS))
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(FeedDbRow::into_feed).transpose()
    }

    /// Delete a feed and (by cascade) its articles. Returns the number of
    /// articles removed.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    // ========================================================================
    // Circuit Breaker Operations
    // ========================================================================

    /// Threshold for consecutive failures before a feed is skipped
    pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 5;

    /// Record a failed fetch: store the error message and increment the
    /// consecutive failure count. Returns the new failure count.
    pub async fn record_feed_failure(&self, feed_id: i64, error: &str) -> Result<i64, DatabaseError> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE feeds SET error = ?, consecutive_failures = consecutive_failures + 1
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(error)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Complete a feed refresh atomically: clear error, reset the circuit
    /// breaker, upsert articles, update the fetch timestamp.
    ///
    /// Returns the number of newly inserted articles. Existing articles get
    /// their content refreshed; their user flags are never touched.
    pub async fn complete_feed_refresh(
        &self,
        feed_id: i64,
        articles: &[ParsedArticle],
    ) -> Result<usize, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE feeds SET error = NULL, consecutive_failures = 0, last_fetched = ? WHERE id = ?",
        )
        .bind(now)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        let inserted = Self::upsert_articles_in(&mut tx, feed_id, articles, now).await?;

        tx.commit().await?;
        Ok(inserted)
    }
}
