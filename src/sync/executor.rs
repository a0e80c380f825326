use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::greader::{load_remote_config, GReaderClient, ReaderService, RemoteConfig, RemoteItem};
use super::{BackoffPolicy, Disposition, SyncError};
use crate::storage::{Article, ArticleFlag, Database, NewFeed, ParsedArticle, SyncAction, SyncChange};
use crate::util::{canonical_url, now_ts};

/// Settings key holding the unix time of the last finished reconciliation.
pub const LAST_RECONCILE_KEY: &str = "sync.last_reconcile";

/// Tunables for pushing and reconciling.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Changes drained per reconciliation cycle
    pub batch_size: usize,
    /// Per-item push timeout (immediate and queued)
    pub push_timeout: Duration,
    /// Timeout for the bulk remote listing
    pub pull_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// A change that failed this many times is dropped
    pub max_attempts: u32,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            push_timeout: Duration::from_secs(10),
            pull_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            max_attempts: 50,
        }
    }
}

/// Where the executor gets its remote service from.
pub enum RemoteSource {
    /// Build a protocol client from the `sync.*` settings on each use
    Settings(reqwest::Client),
    /// Always use this service
    Fixed(Arc<dyn ReaderService>),
}

/// Result of an immediate push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Handed to the sync queue for a later cycle
    Queued { change_id: i64 },
    /// The remote item does not exist; nothing to retry
    Dropped,
}

/// Counters for one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pushed: usize,
    /// Local flags changed by the pull phase
    pub pulled: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Due changes not attempted because an earlier change for the same
    /// article failed this cycle
    pub skipped: usize,
    /// Remote subscriptions added as local feeds
    pub feeds_added: usize,
    /// Unread remote items stored under the reader feed
    pub imported: usize,
    /// Sync is not configured; nothing was done
    pub disabled: bool,
    pub cancelled: bool,
    /// The service could not be reached at all
    pub unreachable: bool,
    pub pull_error: Option<String>,
}

struct CachedClient {
    server_url: String,
    username: String,
    password: String,
    client: Arc<GReaderClient>,
}

/// Drives pushes and reconciliation against the remote reader service.
pub struct SyncExecutor {
    db: Database,
    source: RemoteSource,
    options: ExecutorOptions,
    /// Reused while the settings stay the same, keeps login and id cache
    cached: Mutex<Option<CachedClient>>,
    /// Articles touched by immediate pushes while a cycle runs; `None`
    /// outside a cycle
    cycle_touched: StdMutex<Option<HashSet<i64>>>,
}

impl SyncExecutor {
    pub fn new(db: Database, source: RemoteSource, options: ExecutorOptions) -> Self {
        Self {
            db,
            source,
            options,
            cached: Mutex::new(None),
            cycle_touched: StdMutex::new(None),
        }
    }

    /// The configured remote service, or `None` when sync is off.
    pub async fn remote(&self) -> Result<Option<Arc<dyn ReaderService>>, SyncError> {
        let client = match &self.source {
            RemoteSource::Fixed(service) => return Ok(Some(Arc::clone(service))),
            RemoteSource::Settings(client) => client,
        };

        let Some(config) = load_remote_config(&self.db).await? else {
            *self.cached.lock().await = None;
            return Ok(None);
        };

        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if same_config(entry, &config) {
                return Ok(Some(Arc::clone(&entry.client) as Arc<dyn ReaderService>));
            }
        }

        let service = Arc::new(GReaderClient::new(client.clone(), config.clone()));
        *cached = Some(CachedClient {
            server_url: config.server_url,
            username: config.username,
            password: config.password.expose_secret().to_string(),
            client: Arc::clone(&service),
        });
        Ok(Some(service as Arc<dyn ReaderService>))
    }

    /// Best-effort immediate push for a user action whose local flag is
    /// already set.
    ///
    /// Any failure other than "remote item gone" enqueues the change, so the
    /// intent survives restarts. If the article already has queued changes
    /// the new one is queued behind them rather than overtaking them.
    ///
    /// # Errors
    ///
    /// Only a store failure while enqueueing is returned.
    pub async fn push_now(&self, article: &Article, action: SyncAction) -> Result<PushOutcome, SyncError> {
        if self.db.has_pending_sync_change(article.id).await? {
            tracing::debug!(article_id = article.id, "Earlier changes pending, queueing behind them");
            return self.enqueue(article, action).await;
        }

        let remote = match self.remote().await {
            Ok(Some(remote)) => remote,
            Ok(None) => return self.enqueue(article, action).await,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load sync settings");
                return self.enqueue(article, action).await;
            }
        };

        // The running cycle's snapshot may predate this push
        self.mark_touched(article.id);

        match self.push_one(remote.as_ref(), &article.url, action).await {
            Ok(()) => Ok(PushOutcome::Pushed),
            Err(e) if e.disposition() == Disposition::Drop => {
                tracing::info!(article_id = article.id, error = %e, "Remote item gone, change dropped");
                Ok(PushOutcome::Dropped)
            }
            Err(e) => {
                tracing::debug!(article_id = article.id, error = %e, "Immediate push failed, queueing");
                self.enqueue(article, action).await
            }
        }
    }

    fn mark_touched(&self, article_id: i64) {
        if let Ok(mut touched) = self.cycle_touched.lock() {
            if let Some(set) = touched.as_mut() {
                set.insert(article_id);
            }
        }
    }

    fn touched_in_cycle(&self, article_id: i64) -> bool {
        self.cycle_touched
            .lock()
            .map(|touched| touched.as_ref().is_some_and(|set| set.contains(&article_id)))
            .unwrap_or(false)
    }

    fn set_cycle_tracking(&self, active: bool) {
        if let Ok(mut touched) = self.cycle_touched.lock() {
            *touched = active.then(HashSet::new);
        }
    }

    async fn enqueue(&self, article: &Article, action: SyncAction) -> Result<PushOutcome, SyncError> {
        let change = self
            .db
            .enqueue_sync_change(article.id, &article.url, action)
            .await?;
        Ok(PushOutcome::Queued { change_id: change.id })
    }

    async fn push_one(&self, remote: &dyn ReaderService, url: &str, action: SyncAction) -> Result<(), SyncError> {
        tokio::time::timeout(self.options.push_timeout, remote.push(url, action))
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// One reconciliation cycle: push queued changes, pull remote state,
    /// then import what the remote has and the store lacks.
    ///
    /// The pull only runs after the push phase and never touches articles
    /// with queued changes, articles pushed in this cycle, or articles pushed
    /// immediately while the cycle runs. Cancellation is checked between
    /// items. Cycles must not overlap on one executor.
    ///
    /// # Errors
    ///
    /// Only store failures are returned; remote failures are recorded on the
    /// queued changes and in the report.
    pub async fn reconcile_cycle(&self, cancel: &CancellationToken) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport::default();

        let Some(remote) = self.remote().await? else {
            report.disabled = true;
            return Ok(report);
        };

        self.set_cycle_tracking(true);
        let result = self.run_phases(remote.as_ref(), cancel, &mut report).await;
        self.set_cycle_tracking(false);
        result?;

        if !report.cancelled && !report.unreachable {
            self.db
                .set_setting(LAST_RECONCILE_KEY, &now_ts().to_string())
                .await?;
        }

        tracing::info!(
            pushed = report.pushed,
            pulled = report.pulled,
            failed = report.failed,
            dropped = report.dropped,
            skipped = report.skipped,
            feeds_added = report.feeds_added,
            imported = report.imported,
            unreachable = report.unreachable,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn run_phases(
        &self,
        remote: &dyn ReaderService,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        let pushed_articles = self.push_phase(remote, cancel, report).await?;

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }
        if report.unreachable {
            return Ok(());
        }

        let Some(unread) = self.pull_phase(remote, &pushed_articles, report).await? else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }
        self.import_phase(remote, &unread, report).await
    }

    /// Returns ids of articles whose changes were pushed in this phase.
    async fn push_phase(
        &self,
        remote: &dyn ReaderService,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<HashSet<i64>, SyncError> {
        let now = now_ts();
        // Only due changes; rows behind a backing-off change stay queued
        let batch = self
            .db
            .dequeue_sync_change_batch(self.options.batch_size, now)
            .await?;
        // Articles whose earlier change was not applied this cycle
        let mut blocked: HashSet<i64> = HashSet::new();
        let mut pushed = HashSet::new();

        for change in batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if blocked.contains(&change.article_id) {
                report.skipped += 1;
                continue;
            }
            if change.attempts >= self.options.max_attempts {
                tracing::warn!(
                    change_id = change.id,
                    article_id = change.article_id,
                    attempts = change.attempts,
                    last_error = change.last_error.as_deref().unwrap_or(""),
                    "Giving up on sync change"
                );
                self.db.remove_sync_change(change.id).await?;
                report.dropped += 1;
                continue;
            }

            match self.push_one(remote, &change.article_url, change.action).await {
                Ok(()) => {
                    self.db.remove_sync_change(change.id).await?;
                    pushed.insert(change.article_id);
                    report.pushed += 1;
                }
                Err(e) => {
                    if self.handle_push_failure(&change, &e, now).await? {
                        report.dropped += 1;
                    } else {
                        report.failed += 1;
                        blocked.insert(change.article_id);
                    }
                    if e.is_unreachable() {
                        // Remaining changes would fail the same way
                        report.unreachable = true;
                        break;
                    }
                }
            }
        }

        Ok(pushed)
    }

    /// Returns true if the change was dropped.
    async fn handle_push_failure(&self, change: &SyncChange, error: &SyncError, now: i64) -> Result<bool, SyncError> {
        if error.disposition() == Disposition::Drop {
            tracing::info!(
                change_id = change.id,
                article_id = change.article_id,
                error = %error,
                "Remote item gone, dropping sync change"
            );
            self.db.remove_sync_change(change.id).await?;
            return Ok(true);
        }

        let attempts = change.attempts.saturating_add(1);
        let next = self.options.backoff.next_attempt_at(now, attempts);
        self.db
            .increment_sync_attempt(change.id, next, &error.to_string())
            .await?;
        tracing::debug!(
            change_id = change.id,
            attempts = attempts,
            retry_in_secs = next - now,
            error = %error,
            "Sync push failed"
        );
        Ok(false)
    }

    /// Apply the remote snapshot to local flags. Returns the unread items
    /// for the import, or `None` when the snapshot could not be fetched.
    async fn pull_phase(
        &self,
        remote: &dyn ReaderService,
        pushed: &HashSet<i64>,
        report: &mut ReconcileReport,
    ) -> Result<Option<Vec<RemoteItem>>, SyncError> {
        let state = match tokio::time::timeout(self.options.pull_timeout, remote.fetch_state()).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Pulling remote state failed");
                report.unreachable = e.is_unreachable();
                report.pull_error = Some(e.to_string());
                return Ok(None);
            }
            Err(_) => {
                tracing::warn!("Pulling remote state timed out");
                report.unreachable = true;
                report.pull_error = Some(SyncError::Timeout.to_string());
                return Ok(None);
            }
        };

        // Read after the push phase so it reflects what is still queued now
        let pending = self.db.pending_sync_article_ids().await?;
        let untouchable =
            |id: i64| pending.contains(&id) || pushed.contains(&id) || self.touched_in_cycle(id);

        // An item in both listings changed between the two requests; leave it
        let unread: HashSet<&str> = state
            .unread
            .iter()
            .map(|item| item.url.as_str())
            .filter(|url| !state.read.contains(*url))
            .collect();

        let mut urls: Vec<String> = state.read.union(&state.starred).cloned().collect();
        urls.extend(unread.iter().map(|u| u.to_string()));
        for article in self.db.get_articles_by_urls(&urls).await? {
            if untouchable(article.id) {
                continue;
            }
            if state.read.contains(&article.url) && !article.read {
                if self.db.set_article_flag(article.id, ArticleFlag::Read, true).await? {
                    report.pulled += 1;
                }
            }
            if unread.contains(article.url.as_str()) && article.read {
                if self.db.set_article_flag(article.id, ArticleFlag::Read, false).await? {
                    report.pulled += 1;
                }
            }
            if state.starred.contains(&article.url) && !article.favorite {
                if self.db.set_article_flag(article.id, ArticleFlag::Favorite, true).await? {
                    report.pulled += 1;
                }
            }
        }

        // Absence only means "not starred" if the listing was complete
        if state.starred_complete {
            for article in self.db.get_favorite_articles().await? {
                if untouchable(article.id) || state.starred.contains(&article.url) {
                    continue;
                }
                if self.db.set_article_flag(article.id, ArticleFlag::Favorite, false).await? {
                    report.pulled += 1;
                }
            }
        }

        Ok(Some(state.unread))
    }

    /// Subscribe to remote feeds missing locally and store unread remote
    /// items that no local feed carries under the reader feed. Remote
    /// failures are logged; the cycle still counts as reconciled.
    async fn import_phase(
        &self,
        remote: &dyn ReaderService,
        unread: &[RemoteItem],
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        match tokio::time::timeout(self.options.pull_timeout, remote.subscriptions()).await {
            Ok(Ok(subscriptions)) if !subscriptions.is_empty() => {
                let known: HashSet<String> = self
                    .db
                    .get_feeds()
                    .await?
                    .iter()
                    .map(|feed| canonical_url(&feed.url).unwrap_or_else(|_| feed.url.clone()))
                    .collect();
                for sub in subscriptions {
                    let key = canonical_url(&sub.url).unwrap_or_else(|_| sub.url.clone());
                    if known.contains(&key) {
                        continue;
                    }
                    let feed = NewFeed {
                        category: sub.category,
                        ..NewFeed::rss(sub.title, sub.url)
                    };
                    if self.db.insert_feed_if_missing(&feed).await? {
                        tracing::info!(url = %feed.url, "Added feed from reader subscriptions");
                        report.feeds_added += 1;
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Listing reader subscriptions failed"),
            Err(_) => tracing::warn!("Listing reader subscriptions timed out"),
        }

        if unread.is_empty() {
            return Ok(());
        }
        let urls: Vec<String> = unread.iter().map(|item| item.url.clone()).collect();
        let known: HashSet<String> = self
            .db
            .get_articles_by_urls(&urls)
            .await?
            .into_iter()
            .map(|article| article.url)
            .collect();
        let fresh: Vec<ParsedArticle> = unread
            .iter()
            .filter(|item| !known.contains(&item.url))
            .map(|item| ParsedArticle {
                url: item.url.clone(),
                title: item.title.clone(),
                published: item.published,
                summary: item.summary.clone(),
            })
            .collect();

        report.imported += self.db.import_reader_articles(&fresh).await?;
        Ok(())
    }
}

fn same_config(entry: &CachedClient, config: &RemoteConfig) -> bool {
    entry.server_url == config.server_url
        && entry.username == config.username
        && entry.password == config.password.expose_secret()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeedKind, READER_FEED_URL};
    use crate::sync::{RemoteState, RemoteSubscription};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    /// In-memory reader service. Pushes mutate its state idempotently.
    #[derive(Default)]
    struct FakeReader {
        state: StdMutex<RemoteState>,
        pushes: StdMutex<Vec<(String, SyncAction)>>,
        /// Every call fails as unreachable
        offline: StdMutex<bool>,
        /// Pushes for these URLs fail with a server error
        failing: StdMutex<HashSet<String>>,
        /// URLs the remote has never heard of
        unknown: StdMutex<HashSet<String>>,
        /// Returned by fetch_state instead of the live state
        stale_snapshot: StdMutex<Option<RemoteState>>,
        subscriptions: StdMutex<Vec<RemoteSubscription>>,
    }

    fn remote_item(url: &str) -> RemoteItem {
        RemoteItem {
            url: url.to_string(),
            title: format!("Remote {}", url),
            published: Some(1_700_000_000),
            summary: None,
        }
    }

    #[async_trait]
    impl ReaderService for FakeReader {
        async fn push(&self, url: &str, action: SyncAction) -> Result<(), SyncError> {
            if *self.offline.lock().unwrap() {
                return Err(SyncError::Timeout);
            }
            if self.unknown.lock().unwrap().contains(url) {
                return Err(SyncError::NotFound(url.to_string()));
            }
            if self.failing.lock().unwrap().contains(url) {
                return Err(SyncError::HttpStatus(500));
            }
            self.pushes.lock().unwrap().push((url.to_string(), action));
            let mut state = self.state.lock().unwrap();
            match action {
                SyncAction::MarkRead => {
                    state.unread.retain(|item| item.url != url);
                    state.read.insert(url.to_string());
                }
                SyncAction::MarkUnread => {
                    if state.read.remove(url) {
                        state.unread.push(remote_item(url));
                    }
                }
                SyncAction::Favorite => {
                    state.starred.insert(url.to_string());
                }
                SyncAction::Unfavorite => {
                    state.starred.remove(url);
                }
            };
            Ok(())
        }

        async fn fetch_state(&self) -> Result<RemoteState, SyncError> {
            if *self.offline.lock().unwrap() {
                return Err(SyncError::Timeout);
            }
            if let Some(stale) = self.stale_snapshot.lock().unwrap().clone() {
                return Ok(stale);
            }
            let mut state = self.state.lock().unwrap().clone();
            state.starred_complete = true;
            Ok(state)
        }

        async fn subscriptions(&self) -> Result<Vec<RemoteSubscription>, SyncError> {
            Ok(self.subscriptions.lock().unwrap().clone())
        }
    }

    struct Fixture {
        db: Database,
        fake: Arc<FakeReader>,
        executor: SyncExecutor,
        articles: Vec<Article>,
    }

    async fn fixture(n: usize) -> Fixture {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .insert_feed(&NewFeed::rss("F", "https://example.com/feed"))
            .await
            .unwrap();
        let parsed: Vec<ParsedArticle> = (0..n)
            .map(|i| ParsedArticle {
                url: format!("https://example.com/{}", i),
                title: format!("A{}", i),
                published: None,
                summary: None,
            })
            .collect();
        db.upsert_articles(feed_id, &parsed).await.unwrap();
        let mut articles = Vec::new();
        for p in &parsed {
            articles.push(db.get_article_by_url(&p.url).await.unwrap().unwrap());
        }

        let fake = Arc::new(FakeReader::default());
        let executor = SyncExecutor::new(
            db.clone(),
            RemoteSource::Fixed(fake.clone()),
            ExecutorOptions::default(),
        );
        Fixture {
            db,
            fake,
            executor,
            articles,
        }
    }

    async fn article(db: &Database, id: i64) -> Article {
        db.get_article(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_push_now_success_leaves_queue_empty() {
        let f = fixture(1).await;
        let outcome = f.executor.push_now(&f.articles[0], SyncAction::MarkRead).await.unwrap();
        assert_eq!(outcome, PushOutcome::Pushed);
        assert!(f.fake.state.lock().unwrap().read.contains(&f.articles[0].url));
        assert_eq!(f.db.sync_queue_stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_push_now_failure_enqueues_with_zero_attempts() {
        let f = fixture(1).await;
        *f.fake.offline.lock().unwrap() = true;

        let outcome = f.executor.push_now(&f.articles[0], SyncAction::MarkRead).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Queued { .. }));

        let queued = f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].article_id, f.articles[0].id);
        assert_eq!(queued[0].article_url, f.articles[0].url);
        assert_eq!(queued[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_push_now_when_unconfigured_enqueues() {
        let f = fixture(1).await;
        let executor = SyncExecutor::new(
            f.db.clone(),
            RemoteSource::Settings(reqwest::Client::new()),
            ExecutorOptions::default(),
        );
        let outcome = executor.push_now(&f.articles[0], SyncAction::Favorite).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Queued { .. }));

        // Reconcile is a silent no-op while sync is off
        let report = executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert!(report.disabled);
        assert_eq!(f.db.sync_queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_push_now_queues_behind_pending_changes() {
        let f = fixture(1).await;
        let a = &f.articles[0];
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::Favorite).await.unwrap();

        let outcome = f.executor.push_now(a, SyncAction::Unfavorite).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Queued { .. }));
        assert!(f.fake.pushes.lock().unwrap().is_empty());

        f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            *f.fake.pushes.lock().unwrap(),
            vec![
                (a.url.clone(), SyncAction::Favorite),
                (a.url.clone(), SyncAction::Unfavorite),
            ]
        );
        assert!(!f.fake.state.lock().unwrap().starred.contains(&a.url));
    }

    #[tokio::test]
    async fn test_push_now_unknown_item_is_dropped() {
        let f = fixture(1).await;
        f.fake.unknown.lock().unwrap().insert(f.articles[0].url.clone());
        let outcome = f.executor.push_now(&f.articles[0], SyncAction::MarkRead).await.unwrap();
        assert_eq!(outcome, PushOutcome::Dropped);
        assert_eq!(f.db.sync_queue_stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_offline_mark_read_then_reconcile_removes_change() {
        let f = fixture(1).await;
        let x = &f.articles[0];
        f.db.set_article_flag(x.id, ArticleFlag::Read, true).await.unwrap();
        *f.fake.offline.lock().unwrap() = true;
        f.executor.push_now(x, SyncAction::MarkRead).await.unwrap();
        assert_eq!(f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap()[0].attempts, 0);

        *f.fake.offline.lock().unwrap() = false;
        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.pushed, 1);
        assert!(f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap().is_empty());
        assert!(article(&f.db, x.id).await.read);
        assert!(f.db.get_setting(LAST_RECONCILE_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_backs_off_and_blocks_later_changes_for_article() {
        let f = fixture(2).await;
        let (a, b) = (&f.articles[0], &f.articles[1]);
        f.fake.failing.lock().unwrap().insert(a.url.clone());
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::Favorite).await.unwrap();
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::Unfavorite).await.unwrap();
        f.db.enqueue_sync_change(b.id, &b.url, SyncAction::MarkRead).await.unwrap();

        let before = now_ts();
        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!((report.pushed, report.failed, report.skipped), (1, 1, 1));

        let queue = f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].action, SyncAction::Favorite);
        assert_eq!(queue[0].attempts, 1);
        assert!(queue[0].next_attempt_at >= before + 30);
        assert_eq!(queue[0].last_error.as_deref(), Some("HTTP error: status 500"));
        // The later change for the same article was never attempted
        assert_eq!(queue[1].action, SyncAction::Unfavorite);
        assert_eq!(queue[1].attempts, 0);

        // Still backing off: nothing is attempted on the next cycle
        f.fake.failing.lock().unwrap().clear();
        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!((report.pushed, report.failed, report.skipped), (0, 0, 0));
        assert_eq!(f.db.sync_queue_stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_backing_off_changes_do_not_starve_later_ones() {
        let f = fixture(3).await;
        let executor = SyncExecutor::new(
            f.db.clone(),
            RemoteSource::Fixed(f.fake.clone()),
            ExecutorOptions {
                batch_size: 2,
                ..ExecutorOptions::default()
            },
        );
        for a in &f.articles {
            f.db.enqueue_sync_change(a.id, &a.url, SyncAction::MarkRead).await.unwrap();
        }
        // The two oldest changes keep failing with a server error
        f.fake.failing.lock().unwrap().insert(f.articles[0].url.clone());
        f.fake.failing.lock().unwrap().insert(f.articles[1].url.clone());

        let first = executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!((first.pushed, first.failed), (0, 2));

        let second = executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!((second.pushed, second.failed), (1, 0));
        assert_eq!(
            *f.fake.pushes.lock().unwrap(),
            vec![(f.articles[2].url.clone(), SyncAction::MarkRead)]
        );
        assert_eq!(f.db.sync_queue_stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_not_found_and_exhausted_changes_are_dropped() {
        let f = fixture(2).await;
        let (a, b) = (&f.articles[0], &f.articles[1]);
        f.fake.unknown.lock().unwrap().insert(a.url.clone());
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::MarkRead).await.unwrap();
        let exhausted = f.db.enqueue_sync_change(b.id, &b.url, SyncAction::MarkRead).await.unwrap();

        let options = ExecutorOptions {
            max_attempts: 1,
            ..ExecutorOptions::default()
        };
        f.db.increment_sync_attempt(exhausted.id, 0, "boom").await.unwrap();
        let executor = SyncExecutor::new(f.db.clone(), RemoteSource::Fixed(f.fake.clone()), options);

        let report = executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dropped, 2);
        assert!(f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap().is_empty());
        assert!(f.fake.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_stops_push_phase_and_skips_pull() {
        let f = fixture(2).await;
        for a in &f.articles {
            f.db.enqueue_sync_change(a.id, &a.url, SyncAction::MarkRead).await.unwrap();
        }
        *f.fake.offline.lock().unwrap() = true;

        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert!(report.unreachable);
        assert_eq!(report.failed, 1);
        let queue = f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap();
        assert_eq!(queue[0].attempts, 1);
        assert_eq!(queue[1].attempts, 0);
        assert!(f.db.get_setting(LAST_RECONCILE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_applies_remote_state_except_pending() {
        let f = fixture(4).await;
        let [a, b, c, d] = [&f.articles[0], &f.articles[1], &f.articles[2], &f.articles[3]];
        {
            let mut state = f.fake.state.lock().unwrap();
            state.read.insert(a.url.clone());
            state.read.insert(b.url.clone());
            state.starred.insert(a.url.clone());
            state.read.insert("https://example.com/not-local".into());
        }
        // c is a local favorite the remote does not have
        f.db.set_article_flag(c.id, ArticleFlag::Favorite, true).await.unwrap();
        // d is a local favorite with a pending unread change; remote knows nothing
        f.db.set_article_flag(d.id, ArticleFlag::Favorite, true).await.unwrap();
        // b has a pending mark-unread that cannot be pushed yet
        f.fake.failing.lock().unwrap().insert(b.url.clone());
        f.fake.failing.lock().unwrap().insert(d.url.clone());
        f.db.enqueue_sync_change(b.id, &b.url, SyncAction::MarkUnread).await.unwrap();
        f.db.enqueue_sync_change(d.id, &d.url, SyncAction::MarkUnread).await.unwrap();

        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();

        let a = article(&f.db, a.id).await;
        assert!(a.read && a.favorite);
        // Pending local change wins over the remote snapshot
        assert!(!article(&f.db, b.id).await.read);
        assert!(!article(&f.db, c.id).await.favorite);
        assert!(article(&f.db, d.id).await.favorite);
        assert_eq!(report.pulled, 3);
    }

    #[tokio::test]
    async fn test_pull_applies_remote_unread() {
        let f = fixture(3).await;
        let [a, b, c] = [&f.articles[0], &f.articles[1], &f.articles[2]];
        for x in [a, b, c] {
            f.db.set_article_flag(x.id, ArticleFlag::Read, true).await.unwrap();
        }
        {
            let mut state = f.fake.state.lock().unwrap();
            state.unread = vec![remote_item(&a.url), remote_item(&b.url), remote_item(&c.url)];
            // c changed between the two listings; neither wins
            state.read.insert(c.url.clone());
        }
        // b's local mark-read is still waiting to be pushed
        f.fake.failing.lock().unwrap().insert(b.url.clone());
        f.db.enqueue_sync_change(b.id, &b.url, SyncAction::MarkRead).await.unwrap();

        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();

        assert!(!article(&f.db, a.id).await.read);
        assert!(article(&f.db, b.id).await.read);
        assert!(article(&f.db, c.id).await.read);
        assert_eq!(report.pulled, 1);
    }

    #[tokio::test]
    async fn test_import_adds_subscriptions_and_unknown_unread_items() {
        let f = fixture(1).await;
        let local = &f.articles[0];
        *f.fake.subscriptions.lock().unwrap() = vec![
            // Same feed as the local one once canonicalized
            RemoteSubscription {
                title: "Remote name".into(),
                url: "https://Example.com/feed/".into(),
                category: None,
            },
            RemoteSubscription {
                title: "News".into(),
                url: "https://news.example.org/rss".into(),
                category: Some("Daily".into()),
            },
        ];
        f.fake.state.lock().unwrap().unread = vec![
            remote_item(&local.url),
            remote_item("https://elsewhere.example.net/story"),
        ];

        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!((report.feeds_added, report.imported), (1, 1));

        let feeds = f.db.get_feeds().await.unwrap();
        assert_eq!(feeds.len(), 3);
        let added = feeds
            .iter()
            .find(|feed| feed.url == "https://news.example.org/rss")
            .unwrap();
        assert_eq!(added.kind, FeedKind::Rss);
        assert_eq!(added.category.as_deref(), Some("Daily"));

        let reader = feeds.iter().find(|feed| feed.url == READER_FEED_URL).unwrap();
        assert_eq!(reader.kind, FeedKind::Reader);
        let imported = f.db.get_articles_for_feed(reader.id, None).await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].url, "https://elsewhere.example.net/story");
        assert_eq!(&*imported[0].title, "Remote https://elsewhere.example.net/story");
        assert!(!imported[0].read);

        // Nothing new the second time round
        let again = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!((again.feeds_added, again.imported), (0, 0));
    }

    /// Serves a fixed snapshot, pausing inside `fetch_state` until released.
    struct GatedReader {
        snapshot: RemoteState,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReaderService for GatedReader {
        async fn push(&self, _url: &str, _action: SyncAction) -> Result<(), SyncError> {
            Ok(())
        }

        async fn fetch_state(&self) -> Result<RemoteState, SyncError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.snapshot.clone())
        }
    }

    #[tokio::test]
    async fn test_immediate_push_during_pull_is_not_reverted() {
        let f = fixture(1).await;
        let x = f.articles[0].clone();
        f.db.set_article_flag(x.id, ArticleFlag::Favorite, true).await.unwrap();

        // Snapshot taken while x was still starred remotely
        let reader = Arc::new(GatedReader {
            snapshot: RemoteState {
                starred: [x.url.clone()].into_iter().collect(),
                starred_complete: true,
                ..RemoteState::default()
            },
            entered: Notify::new(),
            release: Notify::new(),
        });
        let executor = SyncExecutor::new(
            f.db.clone(),
            RemoteSource::Fixed(reader.clone()),
            ExecutorOptions::default(),
        );

        let cancel = CancellationToken::new();
        let (report, outcome) = tokio::join!(executor.reconcile_cycle(&cancel), async {
            reader.entered.notified().await;
            f.db.set_article_flag(x.id, ArticleFlag::Favorite, false).await.unwrap();
            let outcome = executor.push_now(&x, SyncAction::Unfavorite).await.unwrap();
            reader.release.notify_one();
            outcome
        });

        assert_eq!(outcome, PushOutcome::Pushed);
        assert_eq!(report.unwrap().pulled, 0);
        assert!(!article(&f.db, x.id).await.favorite);

        // Tracking ends with the cycle
        assert!(!executor.touched_in_cycle(x.id));
    }

    #[tokio::test]
    async fn test_incomplete_starred_listing_never_unfavorites() {
        let f = fixture(1).await;
        let a = &f.articles[0];
        f.db.set_article_flag(a.id, ArticleFlag::Favorite, true).await.unwrap();
        *f.fake.stale_snapshot.lock().unwrap() = Some(RemoteState {
            starred_complete: false,
            ..RemoteState::default()
        });

        f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert!(article(&f.db, a.id).await.favorite);
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_revert_freshly_pushed_change() {
        let f = fixture(1).await;
        let x = &f.articles[0];
        f.db.set_article_flag(x.id, ArticleFlag::Favorite, true).await.unwrap();
        f.db.set_article_flag(x.id, ArticleFlag::Read, true).await.unwrap();
        f.db.enqueue_sync_change(x.id, &x.url, SyncAction::Favorite).await.unwrap();
        f.db.enqueue_sync_change(x.id, &x.url, SyncAction::MarkRead).await.unwrap();
        // Snapshot taken before the push: neither read nor starred
        *f.fake.stale_snapshot.lock().unwrap() = Some(RemoteState {
            starred_complete: true,
            ..RemoteState::default()
        });

        let report = f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 2);
        let x = article(&f.db, x.id).await;
        assert!(x.read && x.favorite);
    }

    #[tokio::test]
    async fn test_duplicate_push_is_idempotent() {
        let f = fixture(1).await;
        let a = &f.articles[0];
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::MarkRead).await.unwrap();
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::MarkRead).await.unwrap();

        f.executor.reconcile_cycle(&CancellationToken::new()).await.unwrap();
        let once = f.fake.state.lock().unwrap().clone();
        f.executor.push_now(a, SyncAction::MarkRead).await.unwrap();
        let twice = f.fake.state.lock().unwrap().clone();

        assert_eq!(once, twice);
        assert_eq!(once.read.len(), 1);
        assert!(f.db.dequeue_sync_change_batch(10, i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_pushes_nothing() {
        let f = fixture(1).await;
        let a = &f.articles[0];
        f.db.enqueue_sync_change(a.id, &a.url, SyncAction::MarkRead).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.executor.reconcile_cycle(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.pushed, 0);
        assert_eq!(f.db.sync_queue_stats().await.unwrap().pending, 1);
    }
}
