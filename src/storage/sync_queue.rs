use std::collections::HashSet;

use super::schema::Database;
use super::types::{DatabaseError, SyncAction, SyncChange, SyncChangeDbRow, SyncQueueStats};

const CHANGE_COLUMNS: &str =
    "id, article_id, article_url, action, enqueued_at, attempts, next_attempt_at, last_error";

impl Database {
    // ========================================================================
    // Sync Queue Operations
    // ========================================================================

    /// Append a pending local->remote change. Returns the queued change.
    ///
    /// New changes start with zero attempts and are eligible immediately.
    pub async fn enqueue_sync_change(
        &self,
        article_id: i64,
        article_url: &str,
        action: SyncAction,
    ) -> Result<SyncChange, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let row: SyncChangeDbRow = sqlx::query_as(&format!(
            "INSERT INTO sync_queue (article_id, article_url, action, enqueued_at, attempts, next_attempt_at)
             VALUES (?, ?, ?, ?, 0, ?)
             RETURNING {}",
            CHANGE_COLUMNS
        ))
        .bind(article_id)
        .bind(article_url)
        .bind(action.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            change_id = row.id,
            article_id = article_id,
            action = %action,
            "Enqueued sync change"
        );
        row.into_change()
    }

    /// Return up to `max` changes that are due at `now`, in enqueue (FIFO)
    /// order.
    ///
    /// A change is due once `next_attempt_at <= now`. Changes behind a
    /// not-yet-due change for the same article are held back with it, so
    /// backing-off rows never fill the batch and never get overtaken.
    /// Changes stay queued until [`Database::remove_sync_change`] is called,
    /// so a crash mid-drain never loses an intent.
    pub async fn dequeue_sync_change_batch(
        &self,
        max: usize,
        now: i64,
    ) -> Result<Vec<SyncChange>, DatabaseError> {
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let rows: Vec<SyncChangeDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_queue
             WHERE next_attempt_at <= ?
               AND NOT EXISTS (
                   SELECT 1 FROM sync_queue earlier
                   WHERE earlier.article_id = sync_queue.article_id
                     AND earlier.id < sync_queue.id
                     AND earlier.next_attempt_at > ?
               )
             ORDER BY id ASC LIMIT ?",
            CHANGE_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncChangeDbRow::into_change).collect()
    }

    /// Remove a change after it was pushed (or dropped). Returns whether a
    /// row was actually removed, so a second removal reports `false`.
    pub async fn remove_sync_change(&self, change_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(change_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed push: bump the attempt count, store the error and the
    /// earliest time of the next attempt. Returns the new attempt count, or
    /// `None` if the change no longer exists.
    pub async fn increment_sync_attempt(
        &self,
        change_id: i64,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<Option<u32>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE sync_queue SET attempts = attempts + 1, next_attempt_at = ?, last_error = ?
             WHERE id = ? RETURNING attempts",
        )
        .bind(next_attempt_at)
        .bind(error)
        .bind(change_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(attempts,)| u32::try_from(attempts).unwrap_or(u32::MAX)))
    }

    /// Article ids that have at least one queued change.
    pub async fn pending_sync_article_ids(&self) -> Result<HashSet<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT DISTINCT article_id FROM sync_queue")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Whether an article has any queued change.
    pub async fn has_pending_sync_change(&self, article_id: i64) -> Result<bool, DatabaseError> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM sync_queue WHERE article_id = ?)")
                .bind(article_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Pending and failed counts for the status indicator.
    pub async fn sync_queue_stats(&self) -> Result<SyncQueueStats, DatabaseError> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN attempts > 0 THEN 1 ELSE 0 END), 0) FROM sync_queue",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(SyncQueueStats {
            pending: row.0,
            failed: row.1,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, SyncAction};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_starts_at_zero_attempts() {
        let db = test_db().await;
        let change = db
            .enqueue_sync_change(7, "https://example.com/x", SyncAction::MarkRead)
            .await
            .unwrap();

        assert_eq!(change.article_id, 7);
        assert_eq!(change.action, SyncAction::MarkRead);
        assert_eq!(change.attempts, 0);
        assert_eq!(change.next_attempt_at, change.enqueued_at);
        assert!(change.last_error.is_none());
    }

    #[tokio::test]
    async fn test_drain_is_fifo() {
        let db = test_db().await;
        db.enqueue_sync_change(1, "https://e.com/1", SyncAction::Favorite)
            .await
            .unwrap();
        db.enqueue_sync_change(2, "https://e.com/2", SyncAction::MarkRead)
            .await
            .unwrap();
        db.enqueue_sync_change(1, "https://e.com/1", SyncAction::Unfavorite)
            .await
            .unwrap();

        let batch = db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap();
        let order: Vec<(i64, SyncAction)> =
            batch.iter().map(|c| (c.article_id, c.action)).collect();
        assert_eq!(
            order,
            vec![
                (1, SyncAction::Favorite),
                (2, SyncAction::MarkRead),
                (1, SyncAction::Unfavorite),
            ]
        );

        let limited = db.dequeue_sync_change_batch(2, i64::MAX).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, batch[0].id);
    }

    #[tokio::test]
    async fn test_drain_skips_changes_not_yet_due() {
        let db = test_db().await;
        let now = chrono::Utc::now().timestamp() + 10;
        let a1 = db
            .enqueue_sync_change(1, "https://e.com/1", SyncAction::Favorite)
            .await
            .unwrap();
        let b1 = db
            .enqueue_sync_change(2, "https://e.com/2", SyncAction::MarkRead)
            .await
            .unwrap();
        db.enqueue_sync_change(1, "https://e.com/1", SyncAction::Unfavorite)
            .await
            .unwrap();
        let c1 = db
            .enqueue_sync_change(3, "https://e.com/3", SyncAction::MarkRead)
            .await
            .unwrap();
        // Article 1's first change and article 2's change are backing off
        db.increment_sync_attempt(a1.id, now + 60, "500").await.unwrap();
        db.increment_sync_attempt(b1.id, now + 60, "500").await.unwrap();

        // A batch of one still reaches the due change at the back of the queue
        let batch = db.dequeue_sync_change_batch(1, now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, c1.id);

        // Article 1's later change waits for its earlier one
        let batch = db.dequeue_sync_change_batch(10, now).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![c1.id]);

        let later = db.dequeue_sync_change_batch(10, now + 60).await.unwrap();
        assert_eq!(later.len(), 4);
        assert_eq!(later[0].id, a1.id);
    }

    #[tokio::test]
    async fn test_fifo_survives_removal() {
        let db = test_db().await;
        let first = db
            .enqueue_sync_change(1, "https://e.com/1", SyncAction::MarkRead)
            .await
            .unwrap();
        db.remove_sync_change(first.id).await.unwrap();
        let second = db
            .enqueue_sync_change(2, "https://e.com/2", SyncAction::MarkRead)
            .await
            .unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_remove_exactly_once() {
        let db = test_db().await;
        let change = db
            .enqueue_sync_change(1, "https://e.com/1", SyncAction::MarkRead)
            .await
            .unwrap();

        assert!(db.remove_sync_change(change.id).await.unwrap());
        assert!(!db.remove_sync_change(change.id).await.unwrap());
        assert!(db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_increment_attempt() {
        let db = test_db().await;
        let change = db
            .enqueue_sync_change(1, "https://e.com/1", SyncAction::MarkRead)
            .await
            .unwrap();

        let attempts = db
            .increment_sync_attempt(change.id, change.enqueued_at + 30, "timeout")
            .await
            .unwrap();
        assert_eq!(attempts, Some(1));

        let stored = &db.dequeue_sync_change_batch(1, i64::MAX).await.unwrap()[0];
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_attempt_at, change.enqueued_at + 30);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        assert_eq!(
            db.increment_sync_attempt(9999, 0, "gone").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_pending_ids_and_stats() {
        let db = test_db().await;
        let a = db
            .enqueue_sync_change(1, "https://e.com/1", SyncAction::MarkRead)
            .await
            .unwrap();
        db.enqueue_sync_change(1, "https://e.com/1", SyncAction::Favorite)
            .await
            .unwrap();
        db.enqueue_sync_change(3, "https://e.com/3", SyncAction::MarkUnread)
            .await
            .unwrap();
        db.increment_sync_attempt(a.id, 0, "err").await.unwrap();

        let ids = db.pending_sync_article_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1) && ids.contains(&3));
        assert!(db.has_pending_sync_change(3).await.unwrap());
        assert!(!db.has_pending_sync_change(2).await.unwrap());

        let stats = db.sync_queue_stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_stats_on_empty_queue() {
        let db = test_db().await;
        let stats = db.sync_queue_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
    }
}
