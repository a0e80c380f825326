use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of feedsync appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored value could not be decoded into its domain type
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feed Kinds
// ============================================================================

/// How a feed's document is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// Plain RSS/Atom over HTTP
    Rss,
    /// Local executable whose stdout is the feed document
    Script,
    /// `rsshub://` route expanded against the configured aggregator endpoint
    Route,
    /// Articles imported from the external reader service, never fetched
    Reader,
    /// RSS/Atom over HTTP with per-feed basic-auth credentials
    Credential,
}

impl FeedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Rss => "rss",
            FeedKind::Script => "script",
            FeedKind::Route => "route",
            FeedKind::Reader => "reader",
            FeedKind::Credential => "credential",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rss" => Ok(FeedKind::Rss),
            "script" => Ok(FeedKind::Script),
            "route" => Ok(FeedKind::Route),
            "reader" => Ok(FeedKind::Reader),
            "credential" => Ok(FeedKind::Credential),
            other => Err(DatabaseError::Corrupt(format!("unknown feed kind '{}'", other))),
        }
    }
}

// ============================================================================
// Article Flags & Sync Actions
// ============================================================================

/// The four independent per-article user flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArticleFlag {
    Read,
    Favorite,
    Hidden,
    ReadLater,
}

impl ArticleFlag {
    /// Column backing this flag. Never user-controlled, safe to splice into SQL.
    pub(crate) fn column(self) -> &'static str {
        match self {
            ArticleFlag::Read => "read",
            ArticleFlag::Favorite => "favorite",
            ArticleFlag::Hidden => "hidden",
            ArticleFlag::ReadLater => "read_later",
        }
    }
}

/// A read/favorite state change that is mirrored to the remote reader service.
///
/// Every action is idempotent at the remote side: applying `MarkRead` twice
/// leaves the item read. Retries after ambiguous failures are therefore safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    MarkRead,
    MarkUnread,
    Favorite,
    Unfavorite,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::MarkRead => "mark_read",
            SyncAction::MarkUnread => "mark_unread",
            SyncAction::Favorite => "favorite",
            SyncAction::Unfavorite => "unfavorite",
        }
    }

    /// The local flag and value this action sets.
    pub fn flag(self) -> (ArticleFlag, bool) {
        match self {
            SyncAction::MarkRead => (ArticleFlag::Read, true),
            SyncAction::MarkUnread => (ArticleFlag::Read, false),
            SyncAction::Favorite => (ArticleFlag::Favorite, true),
            SyncAction::Unfavorite => (ArticleFlag::Favorite, false),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mark_read" | "read" => Ok(SyncAction::MarkRead),
            "mark_unread" | "unread" => Ok(SyncAction::MarkUnread),
            "favorite" | "star" => Ok(SyncAction::Favorite),
            "unfavorite" | "unstar" => Ok(SyncAction::Unfavorite),
            other => Err(DatabaseError::Corrupt(format!(
                "unknown sync action '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Input for creating a feed subscription
#[derive(Clone)]
pub struct NewFeed {
    pub title: String,
    pub url: String,
    pub category: Option<String>,
    pub kind: FeedKind,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    /// Route this feed through a proxy
    pub proxy_enabled: bool,
    /// Feed-specific proxy; the global one is used when unset
    pub proxy_url: Option<String>,
}

impl NewFeed {
    /// A plain RSS/Atom subscription with no category.
    pub fn rss(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            category: None,
            kind: FeedKind::Rss,
            auth_username: None,
            auth_password: None,
            proxy_enabled: false,
            proxy_url: None,
        }
    }
}

/// Represents a parsed article from a feed, keyed by canonical URL
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub url: String,
    pub title: String,
    pub published: Option<i64>,
    pub summary: Option<String>,
}

/// Internal row type for feed queries
#[derive(sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub category: Option<String>,
    pub kind: String,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub proxy_enabled: bool,
    pub proxy_url: Option<String>,
    pub last_fetched: Option<i64>,
    pub error: Option<String>,
    pub consecutive_failures: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Result<Feed, DatabaseError> {
        Ok(Feed {
            id: self.id,
            title: Arc::from(self.title),
            url: self.url,
            category: self.category,
            kind: self.kind.parse()?,
            auth_username: self.auth_username,
            auth_password: self.auth_password,
            proxy_enabled: self.proxy_enabled,
            proxy_url: self.proxy_url,
            last_fetched: self.last_fetched,
            error: self.error,
            consecutive_failures: self.consecutive_failures,
        })
    }
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub read: bool,
    pub favorite: bool,
    pub hidden: bool,
    pub read_later: bool,
    pub fetched_at: i64,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            url: self.url,
            title: Arc::from(self.title),
            published: self.published,
            summary: self.summary.map(Arc::from),
            read: self.read,
            favorite: self.favorite,
            hidden: self.hidden,
            read_later: self.read_later,
            fetched_at: self.fetched_at,
        }
    }
}

/// Internal row type for sync queue queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SyncChangeDbRow {
    pub id: i64,
    pub article_id: i64,
    pub article_url: String,
    pub action: String,
    pub enqueued_at: i64,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

impl SyncChangeDbRow {
    pub(crate) fn into_change(self) -> Result<SyncChange, DatabaseError> {
        Ok(SyncChange {
            id: self.id,
            article_id: self.article_id,
            article_url: self.article_url,
            action: self.action.parse()?,
            enqueued_at: self.enqueued_at,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            next_attempt_at: self.next_attempt_at,
            last_error: self.last_error,
        })
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
///
/// `title` uses `Arc<str>` for cheap cloning into worker futures and log fields.
/// Debug output masks `auth_password` and `proxy_url`, which may carry
/// credentials.
#[derive(Clone)]
pub struct Feed {
    pub id: i64,
    pub title: Arc<str>,
    /// Feed URL, `rsshub://` route, or script file name depending on `kind`
    pub url: String,
    pub category: Option<String>,
    pub kind: FeedKind,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub proxy_enabled: bool,
    pub proxy_url: Option<String>,
    pub last_fetched: Option<i64>,
    pub error: Option<String>,
    /// Number of consecutive fetch failures (circuit breaker)
    pub consecutive_failures: i64,
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("url", &self.url)
            .field("category", &self.category)
            .field("kind", &self.kind)
            .field("auth_username", &self.auth_username)
            .field(
                "auth_password",
                &self.auth_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("proxy_enabled", &self.proxy_enabled)
            .field("proxy_url", &self.proxy_url.as_ref().map(|_| "[REDACTED]"))
            .field("last_fetched", &self.last_fetched)
            .field("error", &self.error)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

/// Article data from database
///
/// `url` is the canonical URL; it is the only key used to match against the
/// remote reader service.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: Arc<str>,
    pub published: Option<i64>,
    pub summary: Option<Arc<str>>,
    pub read: bool,
    pub favorite: bool,
    pub hidden: bool,
    pub read_later: bool,
    pub fetched_at: i64,
}

impl Article {
    pub fn flag(&self, flag: ArticleFlag) -> bool {
        match flag {
            ArticleFlag::Read => self.read,
            ArticleFlag::Favorite => self.favorite,
            ArticleFlag::Hidden => self.hidden,
            ArticleFlag::ReadLater => self.read_later,
        }
    }
}

/// A queued local intent waiting to be pushed to the remote reader service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChange {
    /// Queue position; monotonically increasing, defines FIFO order
    pub id: i64,
    pub article_id: i64,
    /// Canonical URL, the authoritative key for the remote lookup
    pub article_url: String,
    pub action: SyncAction,
    pub enqueued_at: i64,
    pub attempts: u32,
    /// Unix seconds before which the executor will not retry this change
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

/// Aggregate counts over the sync queue, used by the status indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncQueueStats {
    pub pending: i64,
    /// Changes that have failed at least one push attempt
    pub failed: i64,
}
