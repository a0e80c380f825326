//! Persistent store for feeds, articles, settings and the sync queue.
//!
//! All operations hang off the cloneable [`Database`] handle; each submodule
//! adds an `impl Database` block for one table.

mod articles;
mod feeds;
mod schema;
mod settings;
mod sync_queue;
mod types;

pub use feeds::READER_FEED_URL;
pub use schema::Database;
pub use types::{
    Article, ArticleFlag, DatabaseError, Feed, FeedKind, NewFeed, ParsedArticle, SyncAction,
    SyncChange, SyncQueueStats,
};
