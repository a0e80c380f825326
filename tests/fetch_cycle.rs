//! Integration tests for fetch cycles: merge, failure isolation, progress,
//! and network profile fallback.
//!
//! Each test creates its own in-memory SQLite database and mock HTTP server.

use std::time::Duration;

use feedsync::engine::{Engine, EngineOptions};
use feedsync::feed::{run_cycle, FeedStatus, FetchOptions, Fetcher, ProgressHandle};
use feedsync::network::{cached_profile, save_profile, ProbeOptions, Profiler, SpeedTier};
use feedsync::storage::{ArticleFlag, Database, NewFeed};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rss(prefix: &str, n: usize) -> String {
    let items: String = (0..n)
        .map(|i| {
            format!(
                "<item><title>{p} {i}</title><link>https://{p}.example.com/post/{i}/</link>\
                 <description>Body {i}</description></item>",
                p = prefix,
                i = i
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{}</title>{}</channel></rss>"#,
        prefix, items
    )
}

fn fast_options() -> FetchOptions {
    FetchOptions {
        timeout: Duration::from_secs(5),
        max_retries: 0,
        retry_base_delay: Duration::from_millis(10),
        ..FetchOptions::default()
    }
}

async fn mount_feed(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_one_feed_merges_while_other_is_refused() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a.xml", rss("a", 10)).await;

    let db = Database::open(":memory:").await.unwrap();
    let a = db
        .insert_feed(&NewFeed::rss("A", format!("{}/a.xml", server.uri())))
        .await
        .unwrap();
    let b = db
        .insert_feed(&NewFeed::rss("B", "http://127.0.0.1:1/b.xml"))
        .await
        .unwrap();

    let fetcher = Fetcher::new(db.clone(), reqwest::Client::new(), fast_options());
    let progress = ProgressHandle::new();
    let feeds = db.get_feeds().await.unwrap();

    let report = run_cycle(&fetcher, feeds, 2, &progress, &CancellationToken::new()).await;

    assert_eq!(report.merged.get(&a), Some(&10));
    let failure = report.errors.get(&b).expect("feed B should have failed");
    assert!(failure.transient);
    assert!(!report.cancelled);

    let snapshot = progress.snapshot();
    assert_eq!((snapshot.completed, snapshot.total), (2, 2));
    assert!(!snapshot.running);
    assert!(matches!(
        snapshot.status_of(a),
        Some(FeedStatus::Done { new_articles: 10 })
    ));
    assert!(matches!(snapshot.status_of(b), Some(FeedStatus::Failed(_))));

    let articles = db.get_articles_for_feed(a, None).await.unwrap();
    assert_eq!(articles.len(), 10);
    assert!(articles.iter().all(|x| !x.read && !x.favorite && !x.hidden));
    // Links are stored canonical: no trailing slash
    assert!(articles.iter().all(|x| !x.url.ends_with('/')));

    let b_row = db.get_feed(b).await.unwrap().unwrap();
    assert_eq!(b_row.consecutive_failures, 1);
    assert!(b_row.error.is_some());
}

#[tokio::test]
async fn test_refetch_never_resets_user_flags() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a.xml", rss("a", 3)).await;

    let db = Database::open(":memory:").await.unwrap();
    let feed_id = db
        .insert_feed(&NewFeed::rss("A", format!("{}/a.xml", server.uri())))
        .await
        .unwrap();
    let fetcher = Fetcher::new(db.clone(), reqwest::Client::new(), fast_options());
    let progress = ProgressHandle::new();
    let cancel = CancellationToken::new();

    let first = run_cycle(&fetcher, db.get_feeds().await.unwrap(), 2, &progress, &cancel).await;
    assert_eq!(first.total_new(), 3);

    let article = db
        .get_article_by_url("https://a.example.com/post/1")
        .await
        .unwrap()
        .unwrap();
    db.set_article_flag(article.id, ArticleFlag::Read, true).await.unwrap();
    db.set_article_flag(article.id, ArticleFlag::Favorite, true).await.unwrap();
    db.set_article_flag(article.id, ArticleFlag::Hidden, true).await.unwrap();

    let second = run_cycle(&fetcher, db.get_feeds().await.unwrap(), 2, &progress, &cancel).await;
    assert_eq!(second.total_new(), 0);
    assert_eq!(second.cycle, first.cycle + 1);

    let after = db.get_article(article.id).await.unwrap().unwrap();
    assert!(after.read && after.favorite && after.hidden);
    assert_eq!(db.get_articles_for_feed(feed_id, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_budget_holds_with_slow_feeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss("slow", 1))
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    for i in 0..8 {
        db.insert_feed(&NewFeed::rss(format!("F{}", i), format!("{}/f{}.xml", server.uri(), i)))
            .await
            .unwrap();
    }
    let fetcher = Fetcher::new(db.clone(), reqwest::Client::new(), fast_options());
    let progress = ProgressHandle::new();

    // Observe every published snapshot while the cycle runs
    let mut rx = progress.subscribe();
    let observer = tokio::spawn(async move {
        let mut max_seen = 0;
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            max_seen = max_seen.max(snapshot.in_flight);
            if snapshot.cycle > 0 && !snapshot.running {
                break;
            }
        }
        max_seen
    });

    let report = run_cycle(
        &fetcher,
        db.get_feeds().await.unwrap(),
        3,
        &progress,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.merged.len(), 8);
    assert!(report.peak_in_flight >= 1 && report.peak_in_flight <= 3);
    assert!(observer.await.unwrap() <= 3);
}

#[tokio::test]
async fn test_failed_probe_falls_back_to_lowest_tier() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let profiler = Profiler::new(
        reqwest::Client::new(),
        ProbeOptions {
            endpoints: vec![format!("{}/__down", server.uri()), "http://127.0.0.1:1/".into()],
            timeout: Duration::from_secs(2),
            ..ProbeOptions::default()
        },
    );
    let profile = profiler.measure().await;

    assert!(!profile.success);
    assert_eq!(profile.tier, SpeedTier::Slow);
    assert_eq!(profile.max_concurrency, SpeedTier::Slow.max_concurrency());

    let db = Database::open(":memory:").await.unwrap();
    assert!(!save_profile(&db, &profile).await.unwrap());
    assert!(cached_profile(&db).await.unwrap().is_none());
}

#[tokio::test]
async fn test_engine_cycle_respects_concurrency_override() {
    let server = MockServer::start().await;
    mount_feed(&server, "/a.xml", rss("a", 2)).await;
    mount_feed(&server, "/b.xml", rss("b", 2)).await;

    let db = Database::open(":memory:").await.unwrap();
    for name in ["a", "b"] {
        db.insert_feed(&NewFeed::rss(name, format!("{}/{}.xml", server.uri(), name)))
            .await
            .unwrap();
    }

    let engine = Engine::new(
        db.clone(),
        reqwest::Client::new(),
        EngineOptions {
            fetch: fast_options(),
            probe: ProbeOptions {
                endpoints: Vec::new(),
                ..ProbeOptions::default()
            },
            max_concurrency: Some(1),
            ..EngineOptions::default()
        },
    );

    let report = engine.run_fetch_cycle().await.unwrap();
    assert_eq!(report.total_new(), 4);
    assert_eq!(report.peak_in_flight, 1);
    assert!(db.get_setting("last_article_update").await.unwrap().is_some());

    engine.shutdown().await;
}
