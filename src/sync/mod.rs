//! Read/favorite state synchronization with a remote reader service.
//!
//! Local actions are applied first and pushed best-effort; anything that
//! could not be pushed waits in the durable sync queue. A reconciliation
//! cycle pushes the queue, then pulls remote state for articles that have
//! nothing pending.

mod backoff;
mod executor;
mod greader;

use thiserror::Error;

use crate::storage::DatabaseError;

pub use backoff::BackoffPolicy;
pub use executor::{
    ExecutorOptions, PushOutcome, ReconcileReport, RemoteSource, SyncExecutor, LAST_RECONCILE_KEY,
};
pub use greader::{
    load_remote_config, GReaderClient, ReaderService, RemoteConfig, RemoteItem, RemoteState,
    RemoteSubscription, STREAM_READING_LIST, TAG_READ, TAG_STARRED,
};

/// What the executor does with a change whose push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep it queued and back off
    Retry,
    /// The remote item is gone; retrying can never succeed
    Drop,
    /// Sync is not configured; nothing to do
    FeatureOff,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Sync disabled or credentials missing
    #[error("Sync is not configured")]
    Disabled,
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Authentication failed: {0}")]
    Auth(String),
    /// No remote item carries this URL
    #[error("Remote item not found: {0}")]
    NotFound(String),
    /// The server answered with something we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SyncError {
    pub fn disposition(&self) -> Disposition {
        match self {
            SyncError::Disabled => Disposition::FeatureOff,
            SyncError::NotFound(_) | SyncError::HttpStatus(404 | 410) => Disposition::Drop,
            SyncError::Network(_)
            | SyncError::Timeout
            | SyncError::HttpStatus(_)
            | SyncError::Auth(_)
            | SyncError::Protocol(_)
            | SyncError::Database(_) => Disposition::Retry,
        }
    }

    /// Failure to reach the service at all, as opposed to a per-item problem.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout | SyncError::Auth(_)
        )
    }
}
