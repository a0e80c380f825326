//! Feed retrieval: parsing, fetching, and bounded concurrent fetch cycles.
//!
//! - [`parser`] turns RSS/Atom documents into articles keyed by canonical URL
//! - [`fetcher`] obtains one feed's document (HTTP, route, script) with
//!   retries and size limits, then merges it into the store
//! - [`progress`] publishes the cycle's progress as whole snapshots
//! - [`scheduler`] runs a cycle over many feeds under a concurrency budget
//!
//! # Example
//!
//! ```ignore
//! let fetcher = Fetcher::new(db, client, FetchOptions::default());
//! let report = run_cycle(&fetcher, feeds, 5, &progress, &cancel).await;
//! ```

mod fetcher;
mod parser;
mod progress;
mod scheduler;

pub use fetcher::{
    FeedFailure, FetchError, FetchOptions, Fetcher, ProxySettings, RouteSettings, SourceSettings,
};
pub use parser::{parse_feed, ParseResult};
pub use progress::{FeedProgress, FeedStatus, FetchProgress, ProgressHandle, SkipReason};
pub use scheduler::{concurrency_budget, run_cycle, CycleReport};
