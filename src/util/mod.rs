//! Utility functions shared by the fetcher and the sync engine.
//!
//! The main one is URL canonicalization: the only identity key shared between
//! the local article store and the remote reader service.
//!
//! # Examples
//!
//! ```
//! use feedsync::util::canonical_url;
//!
//! let url = canonical_url("https://Example.com/post/").unwrap();
//! assert_eq!(url, "https://example.com/post");
//! ```

mod canonical;

pub use canonical::{canonical_url, UrlError};

/// Current wall-clock time as unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
