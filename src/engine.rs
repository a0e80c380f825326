//! Process-wide coordinator: the surface a UI or the CLI talks to.
//!
//! Owns one progress snapshot, one fetcher, one profiler and one sync
//! executor. Fetch cycles and reconciliation run independently of each
//! other; each is exclusive with itself.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::{concurrency_budget, run_cycle, CycleReport, FetchError, FetchOptions, FetchProgress, Fetcher, ProgressHandle};
use crate::network::{cached_profile, save_profile, NetworkProfile, ProbeOptions, Profiler};
use crate::storage::{Database, DatabaseError, SyncAction};
use crate::sync::{ExecutorOptions, PushOutcome, ReconcileReport, RemoteSource, SyncError, SyncExecutor, LAST_RECONCILE_KEY};
use crate::util::now_ts;

/// Settings key written at the end of every fetch cycle.
pub const LAST_ARTICLE_UPDATE_KEY: &str = "last_article_update";

/// After a failed measurement, cycles reuse its fallback for this long
/// before measuring again.
const FAILED_MEASUREMENT_RETRY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A fetch cycle is already running")]
    CycleRunning,
    #[error("Article {0} not found")]
    ArticleNotFound(i64),
    #[error("Feed {0} not found")]
    FeedNotFound(i64),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub fetch: FetchOptions,
    pub probe: ProbeOptions,
    pub executor: ExecutorOptions,
    /// Caps the measured concurrency recommendation
    pub max_concurrency: Option<usize>,
    /// Re-measure a cached network profile older than this
    pub remeasure_after: Option<Duration>,
}

impl EngineOptions {
    pub fn from_config(config: &Config, config_dir: &Path) -> Self {
        Self {
            fetch: config.fetch_options(config_dir),
            probe: config.probe_options(),
            executor: config.executor_options(),
            max_concurrency: config.fetch.max_concurrency,
            remeasure_after: config.remeasure_after(),
        }
    }
}

/// Non-blocking sync health indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub pending: i64,
    pub failed: i64,
    /// Unix seconds of the last finished reconciliation
    pub last_reconcile: Option<i64>,
    /// False only when the service is configured but the last cycle could
    /// not reach it
    pub available: bool,
}

/// Cleared on drop so a panicking cycle cannot wedge the flag.
struct CycleGuard(Arc<AtomicBool>);

impl CycleGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    db: Database,
    fetcher: Fetcher,
    profiler: Profiler,
    executor: SyncExecutor,
    progress: ProgressHandle,
    options: EngineOptions,
    cancel: CancellationToken,
    fetch_running: Arc<AtomicBool>,
    reconcile_lock: Arc<Mutex<()>>,
    sync_available: AtomicBool,
    /// Fallback from the last failed measurement; never persisted
    fallback: StdMutex<Option<(NetworkProfile, Instant)>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Engine whose remote service comes from the `sync.*` settings.
    pub fn new(db: Database, client: reqwest::Client, options: EngineOptions) -> Self {
        let source = RemoteSource::Settings(client.clone());
        Self::with_remote(db, client, options, source)
    }

    pub fn with_remote(
        db: Database,
        client: reqwest::Client,
        options: EngineOptions,
        remote: RemoteSource,
    ) -> Self {
        let fetcher = Fetcher::new(db.clone(), client.clone(), options.fetch.clone());
        let profiler = Profiler::new(client, options.probe.clone());
        let executor = SyncExecutor::new(db.clone(), remote, options.executor.clone());
        Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                profiler,
                executor,
                progress: ProgressHandle::new(),
                options,
                cancel: CancellationToken::new(),
                fetch_running: Arc::new(AtomicBool::new(false)),
                reconcile_lock: Arc::new(Mutex::new(())),
                sync_available: AtomicBool::new(true),
                fallback: StdMutex::new(None),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Token shared by every cycle this engine runs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Start a fetch cycle in the background. Returns false if one is
    /// already running or the engine is shutting down.
    pub fn trigger_fetch_cycle(&self) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        let Some(guard) = CycleGuard::acquire(&self.inner.fetch_running) else {
            tracing::debug!("Fetch cycle already running, trigger ignored");
            return false;
        };

        let engine = self.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = engine.fetch_cycle(guard).await {
                tracing::error!(error = %e, "Fetch cycle failed");
            }
        }));
        true
    }

    /// Run a fetch cycle to completion on the current task.
    ///
    /// # Errors
    ///
    /// `CycleRunning` if another cycle holds the slot; store failures while
    /// loading feeds.
    pub async fn run_fetch_cycle(&self) -> Result<CycleReport, EngineError> {
        let guard = CycleGuard::acquire(&self.inner.fetch_running).ok_or(EngineError::CycleRunning)?;
        Ok(self.fetch_cycle(guard).await?)
    }

    async fn fetch_cycle(&self, _guard: CycleGuard) -> Result<CycleReport, DatabaseError> {
        let feeds = self.inner.db.get_feeds().await?;
        let budget = self.concurrency_for(feeds.len()).await;

        let report = run_cycle(
            &self.inner.fetcher,
            feeds,
            budget,
            &self.inner.progress,
            &self.inner.cancel,
        )
        .await;

        if let Err(e) = self
            .inner
            .db
            .set_setting(LAST_ARTICLE_UPDATE_KEY, &now_ts().to_string())
            .await
        {
            tracing::warn!(error = %e, "Failed to record last article update");
        }
        Ok(report)
    }

    /// Budget for a cycle over `feed_count` feeds, from the cached profile
    /// or a fresh measurement when the cache is missing or stale. A failed
    /// measurement is not repeated within `FAILED_MEASUREMENT_RETRY`.
    async fn concurrency_for(&self, feed_count: usize) -> usize {
        let cached = match cached_profile(&self.inner.db).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read cached network profile");
                None
            }
        };

        let stale = match (&cached, self.inner.options.remeasure_after) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(p), Some(max_age)) => {
                p.is_stale(now_ts(), i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX))
            }
        };

        let profile = match cached {
            Some(p) if !stale => p,
            cached => match (cached, self.recent_fallback()) {
                (Some(old), Some(_)) => old,
                (None, Some(fallback)) => fallback,
                (cached, None) => {
                    let fresh = self.measure_network().await;
                    if !fresh.success {
                        self.remember_fallback(&fresh);
                    }
                    match cached {
                        // A failed measurement should not replace a real, if old, one
                        Some(old) if !fresh.success => old,
                        _ => fresh,
                    }
                }
            },
        };

        concurrency_budget(profile.max_concurrency, self.inner.options.max_concurrency, feed_count)
    }

    fn recent_fallback(&self) -> Option<NetworkProfile> {
        let fallback = self.inner.fallback.lock().ok()?;
        fallback
            .as_ref()
            .filter(|(_, at)| at.elapsed() < FAILED_MEASUREMENT_RETRY)
            .map(|(profile, _)| profile.clone())
    }

    fn remember_fallback(&self, profile: &NetworkProfile) {
        if let Ok(mut fallback) = self.inner.fallback.lock() {
            *fallback = Some((profile.clone(), Instant::now()));
        }
    }

    pub fn fetch_progress(&self) -> FetchProgress {
        self.inner.progress.snapshot()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<FetchProgress> {
        self.inner.progress.subscribe()
    }

    /// Manual refresh of one feed. Bypasses the circuit breaker.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<usize, EngineError> {
        let feed = self
            .inner
            .db
            .get_feed(feed_id)
            .await?
            .ok_or(EngineError::FeedNotFound(feed_id))?;
        Ok(self.inner.fetcher.refresh_one(&feed).await?)
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// Measure the network and persist the result if the measurement succeeded.
    pub async fn measure_network(&self) -> NetworkProfile {
        let profile = self.inner.profiler.measure().await;
        match save_profile(&self.inner.db, &profile).await {
            Ok(true) => tracing::info!(tier = %profile.tier, "Network profile saved"),
            Ok(false) => tracing::debug!("Measurement failed, keeping previous profile"),
            Err(e) => tracing::warn!(error = %e, "Failed to save network profile"),
        }
        profile
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Apply a user action locally, then push it best-effort.
    ///
    /// The local flag is always set first; a failed push only queues the
    /// change.
    pub async fn record_user_action(
        &self,
        article_id: i64,
        action: SyncAction,
    ) -> Result<PushOutcome, EngineError> {
        let article = self
            .inner
            .db
            .get_article(article_id)
            .await?
            .ok_or(EngineError::ArticleNotFound(article_id))?;

        let (flag, value) = action.flag();
        self.inner.db.set_article_flag(article_id, flag, value).await?;

        let outcome = self.inner.executor.push_now(&article, action).await?;
        tracing::debug!(article_id, action = action.as_str(), ?outcome, "User action recorded");
        Ok(outcome)
    }

    /// Start reconciliation in the background. Returns false if one is
    /// already running or the engine is shutting down.
    pub fn trigger_reconcile(&self) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        let Ok(guard) = Arc::clone(&self.inner.reconcile_lock).try_lock_owned() else {
            tracing::debug!("Reconciliation already running, trigger ignored");
            return false;
        };

        let engine = self.clone();
        self.track(tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = engine.reconcile_locked().await {
                tracing::error!(error = %e, "Reconciliation failed");
            }
        }));
        true
    }

    /// Run one reconciliation cycle, waiting for a running one to finish
    /// first.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let _guard = self.inner.reconcile_lock.lock().await;
        self.reconcile_locked().await
    }

    async fn reconcile_locked(&self) -> Result<ReconcileReport, EngineError> {
        let report = self.inner.executor.reconcile_cycle(&self.inner.cancel).await?;
        self.inner
            .sync_available
            .store(report.disabled || !report.unreachable, Ordering::Release);
        Ok(report)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, DatabaseError> {
        let stats = self.inner.db.sync_queue_stats().await?;
        let last_reconcile = self
            .inner
            .db
            .get_setting(LAST_RECONCILE_KEY)
            .await?
            .and_then(|v| v.parse().ok());
        Ok(SyncStatus {
            pending: stats.pending,
            failed: stats.failed,
            last_reconcile,
            available: self.inner.sync_available.load(Ordering::Acquire),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drive fetch cycles and reconciliation on their own timers until the
    /// engine is cancelled. A `None` interval disables that timer.
    pub async fn run_daemon(&self, refresh_every: Option<Duration>, sync_every: Option<Duration>) {
        let mut refresh = refresh_every.map(new_interval);
        let mut sync = sync_every.map(new_interval);
        tracing::info!(?refresh_every, ?sync_every, "Daemon started");

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = tick(&mut refresh) => {
                    self.trigger_fetch_cycle();
                }
                _ = tick(&mut sync) => {
                    self.trigger_reconcile();
                }
            }
        }
        tracing::info!("Daemon stopped");
    }

    /// Cancel running work and wait for background tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task panicked");
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn new_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
