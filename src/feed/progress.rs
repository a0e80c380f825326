//! Process-wide fetch progress, published as versioned snapshots.
//!
//! Workers never touch fields directly: every change goes through
//! [`tokio::sync::watch::Sender::send_modify`], so a reader on another task
//! always sees a whole snapshot, never a half-applied update.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::feed::fetcher::FeedFailure;
use crate::storage::Feed;

/// Why a feed was not fetched in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Too many consecutive failures; only a manual refresh retries it
    CircuitOpen,
    /// Articles arrive through the reader service instead
    ReaderSourced,
    /// The cycle was cancelled before this feed was dispatched
    Cancelled,
}

/// State of one feed within the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Pending,
    InFlight,
    Done { new_articles: usize },
    Failed(FeedFailure),
    Skipped(SkipReason),
}

impl FeedStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, FeedStatus::Pending | FeedStatus::InFlight)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedProgress {
    pub title: Arc<str>,
    pub status: FeedStatus,
}

/// Snapshot of the current (or last) fetch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchProgress {
    /// Cycle number; 0 before the first cycle
    pub cycle: u64,
    /// Bumped on every change, lets pollers detect staleness cheaply
    pub version: u64,
    pub running: bool,
    pub total: usize,
    pub completed: usize,
    pub in_flight: usize,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Per-feed entries keyed by feed id
    pub feeds: BTreeMap<i64, FeedProgress>,
}

impl FetchProgress {
    /// Feeds whose fetch failed in this cycle.
    pub fn errors(&self) -> impl Iterator<Item = (i64, &FeedFailure)> {
        self.feeds.iter().filter_map(|(id, entry)| match &entry.status {
            FeedStatus::Failed(failure) => Some((*id, failure)),
            _ => None,
        })
    }

    pub fn status_of(&self, feed_id: i64) -> Option<&FeedStatus> {
        self.feeds.get(&feed_id).map(|entry| &entry.status)
    }
}

/// Shared handle to the progress snapshot. Cloning shares the same state.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<FetchProgress>>,
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(FetchProgress::default());
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> FetchProgress {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<FetchProgress> {
        self.tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.tx.borrow().running
    }

    /// Replace the snapshot for a new cycle over `feeds`. Returns the cycle
    /// number. Previous per-feed entries are discarded.
    pub(crate) fn begin_cycle(&self, feeds: &[Feed]) -> u64 {
        let mut cycle = 0;
        self.tx.send_modify(|p| {
            cycle = p.cycle + 1;
            *p = FetchProgress {
                cycle,
                version: p.version + 1,
                running: true,
                total: feeds.len(),
                started_at: Some(crate::util::now_ts()),
                feeds: feeds
                    .iter()
                    .map(|f| {
                        (
                            f.id,
                            FeedProgress {
                                title: Arc::clone(&f.title),
                                status: FeedStatus::Pending,
                            },
                        )
                    })
                    .collect(),
                ..FetchProgress::default()
            };
        });
        cycle
    }

    pub(crate) fn mark_in_flight(&self, feed_id: i64) {
        self.tx.send_modify(|p| {
            if let Some(entry) = p.feeds.get_mut(&feed_id) {
                if entry.status == FeedStatus::Pending {
                    entry.status = FeedStatus::InFlight;
                    p.in_flight += 1;
                    p.version += 1;
                }
            }
        });
    }

    /// Record a feed's final status. Finishing a feed twice is ignored.
    pub(crate) fn finish_feed(&self, feed_id: i64, status: FeedStatus) {
        self.tx.send_modify(|p| {
            let Some(entry) = p.feeds.get_mut(&feed_id) else {
                return;
            };
            if entry.status.is_finished() {
                return;
            }
            if entry.status == FeedStatus::InFlight {
                p.in_flight = p.in_flight.saturating_sub(1);
            }
            entry.status = status;
            p.completed += 1;
            p.version += 1;
        });
    }

    pub(crate) fn end_cycle(&self) {
        self.tx.send_modify(|p| {
            p.running = false;
            p.finished_at = Some(crate::util::now_ts());
            p.version += 1;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FeedKind;

    fn feed(id: i64) -> Feed {
        Feed {
            id,
            title: Arc::from(format!("Feed {}", id)),
            url: format!("https://example.com/{}", id),
            category: None,
            kind: FeedKind::Rss,
            auth_username: None,
            auth_password: None,
            proxy_enabled: false,
            proxy_url: None,
            last_fetched: None,
            error: None,
            consecutive_failures: 0,
        }
    }

    #[test]
    fn test_cycle_lifecycle() {
        let progress = ProgressHandle::new();
        assert_eq!(progress.snapshot().cycle, 0);

        let cycle = progress.begin_cycle(&[feed(1), feed(2)]);
        assert_eq!(cycle, 1);
        let snap = progress.snapshot();
        assert!(snap.running);
        assert_eq!((snap.total, snap.completed, snap.in_flight), (2, 0, 0));

        progress.mark_in_flight(1);
        progress.mark_in_flight(2);
        assert_eq!(progress.snapshot().in_flight, 2);

        progress.finish_feed(1, FeedStatus::Done { new_articles: 3 });
        progress.finish_feed(
            2,
            FeedStatus::Failed(FeedFailure {
                message: "refused".into(),
                transient: true,
            }),
        );
        progress.end_cycle();

        let snap = progress.snapshot();
        assert!(!snap.running);
        assert_eq!((snap.total, snap.completed, snap.in_flight), (2, 2, 0));
        assert_eq!(snap.errors().count(), 1);
        assert_eq!(
            snap.status_of(1),
            Some(&FeedStatus::Done { new_articles: 3 })
        );
    }

    #[test]
    fn test_finish_is_idempotent() {
        let progress = ProgressHandle::new();
        progress.begin_cycle(&[feed(1)]);
        progress.finish_feed(1, FeedStatus::Skipped(SkipReason::CircuitOpen));
        progress.finish_feed(1, FeedStatus::Done { new_articles: 1 });
        progress.finish_feed(99, FeedStatus::Done { new_articles: 1 });

        let snap = progress.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(
            snap.status_of(1),
            Some(&FeedStatus::Skipped(SkipReason::CircuitOpen))
        );
    }

    #[test]
    fn test_new_cycle_replaces_entries() {
        let progress = ProgressHandle::new();
        progress.begin_cycle(&[feed(1), feed(2)]);
        progress.finish_feed(1, FeedStatus::Done { new_articles: 0 });
        progress.end_cycle();

        let cycle = progress.begin_cycle(&[feed(3)]);
        assert_eq!(cycle, 2);
        let snap = progress.snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.completed, 0);
        assert!(snap.status_of(1).is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let progress = ProgressHandle::new();
        let mut rx = progress.subscribe();
        progress.begin_cycle(&[feed(1)]);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().running);
    }
}
