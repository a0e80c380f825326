use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::feed::fetcher::{FeedFailure, FetchError, Fetcher, SourceSettings};
use crate::feed::progress::{FeedStatus, ProgressHandle, SkipReason};
use crate::storage::{Database, Feed, FeedKind};

/// Outcome of one fetch cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// New articles merged, per successfully fetched feed
    pub merged: HashMap<i64, usize>,
    pub errors: HashMap<i64, FeedFailure>,
    pub skipped: Vec<(i64, SkipReason)>,
    pub cancelled: bool,
    /// Highest number of fetches observed in flight at once
    pub peak_in_flight: usize,
}

impl CycleReport {
    pub fn total_new(&self) -> usize {
        self.merged.values().sum()
    }
}

/// Decrements the in-flight counter even if the worker future is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs one fetch cycle over `feeds` with at most `budget` fetches in flight.
///
/// # Behavior
///
/// - Reader-sourced feeds and feeds with an open circuit breaker are skipped
/// - Each fetch has its own timeout; one hung feed only delays its own slot
/// - A failed feed is recorded in progress and on the feed row, the cycle
///   continues
/// - Cancellation stops dispatching new feeds and aborts in-flight requests;
///   undispatched feeds are reported as skipped
///
/// Never fails: every per-feed error is captured in the returned report.
pub async fn run_cycle(
    fetcher: &Fetcher,
    feeds: Vec<Feed>,
    budget: usize,
    progress: &ProgressHandle,
    cancel: &CancellationToken,
) -> CycleReport {
    let budget = budget.max(1);
    let cycle = progress.begin_cycle(&feeds);
    let mut report = CycleReport {
        cycle,
        ..CycleReport::default()
    };

    let mut active = Vec::with_capacity(feeds.len());
    for feed in feeds {
        let reason = if feed.kind == FeedKind::Reader {
            Some(SkipReason::ReaderSourced)
        } else if feed.consecutive_failures >= Database::CIRCUIT_BREAKER_THRESHOLD {
            Some(SkipReason::CircuitOpen)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                progress.finish_feed(feed.id, FeedStatus::Skipped(reason));
                report.skipped.push((feed.id, reason));
            }
            None => active.push(feed),
        }
    }

    let circuit_open = report
        .skipped
        .iter()
        .filter(|(_, r)| *r == SkipReason::CircuitOpen)
        .count();
    if circuit_open > 0 {
        tracing::info!(
            skipped = circuit_open,
            threshold = Database::CIRCUIT_BREAKER_THRESHOLD,
            "Skipping feeds due to consecutive failures (refresh individually to retry)"
        );
    }

    tracing::info!(
        cycle = cycle,
        feeds = active.len(),
        budget = budget,
        "Fetch cycle started"
    );

    let sources = SourceSettings::load(fetcher.database()).await;
    let in_flight = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);

    // take_until stops pulling feeds from the source once cancelled; the
    // buffered workers still run to completion (or their own cancellation).
    let results: Vec<(i64, Result<usize, FetchError>)> = stream::iter(active)
        .take_until(cancel.cancelled())
        .map(|feed| {
            let sources = &sources;
            let in_flight = &in_flight;
            let peak = &peak;

            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _guard = InFlightGuard(in_flight);
                progress.mark_in_flight(feed.id);

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    r = fetcher.fetch_and_merge(&feed, sources) => r,
                };

                match &result {
                    Ok(count) => {
                        tracing::debug!(feed_id = feed.id, new = *count, "Feed merged");
                        progress.finish_feed(feed.id, FeedStatus::Done { new_articles: *count });
                    }
                    Err(FetchError::Cancelled) => {
                        progress.finish_feed(feed.id, FeedStatus::Skipped(SkipReason::Cancelled));
                    }
                    Err(e) => {
                        tracing::warn!(
                            feed_id = feed.id,
                            title = %feed.title,
                            error = %e,
                            transient = e.is_transient(),
                            "Feed fetch failed"
                        );
                        fetcher.record_failure(&feed, e).await;
                        progress.finish_feed(feed.id, FeedStatus::Failed(FeedFailure::from(e)));
                    }
                }

                (feed.id, result)
            }
        })
        .buffer_unordered(budget)
        .collect()
        .await;

    for (feed_id, result) in results {
        match result {
            Ok(count) => {
                report.merged.insert(feed_id, count);
            }
            Err(FetchError::Cancelled) => report.skipped.push((feed_id, SkipReason::Cancelled)),
            Err(e) => {
                report.errors.insert(feed_id, FeedFailure::from(&e));
            }
        }
    }

    report.cancelled = cancel.is_cancelled();
    if report.cancelled {
        // Feeds never dispatched are still Pending
        let pending: Vec<i64> = progress
            .snapshot()
            .feeds
            .iter()
            .filter(|(_, entry)| entry.status == FeedStatus::Pending)
            .map(|(id, _)| *id)
            .collect();
        for feed_id in pending {
            progress.finish_feed(feed_id, FeedStatus::Skipped(SkipReason::Cancelled));
            report.skipped.push((feed_id, SkipReason::Cancelled));
        }
    }

    report.peak_in_flight = peak.load(Ordering::SeqCst);
    progress.end_cycle();

    tracing::info!(
        cycle = cycle,
        merged = report.merged.len(),
        new_articles = report.total_new(),
        failed = report.errors.len(),
        skipped = report.skipped.len(),
        cancelled = report.cancelled,
        "Fetch cycle finished"
    );

    report
}

/// Derive the concurrency budget for a cycle.
///
/// The recommended value is clamped to `1..=20`, replaced by a configured
/// override when present, then reduced for large feed sets to avoid
/// exhausting connections (>20 feeds: at most 5, >50 feeds: at most 3).
pub fn concurrency_budget(recommended: usize, override_max: Option<usize>, feed_count: usize) -> usize {
    let mut budget = override_max.unwrap_or(recommended).clamp(1, 20);
    if feed_count > 50 {
        budget = budget.min(3);
    } else if feed_count > 20 {
        budget = budget.min(5);
    }
    budget
}
