use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::redirect::Policy;
use std::path::PathBuf;
use std::time::Duration;

use feedsync::config::Config;
use feedsync::engine::{Engine, EngineOptions};
use feedsync::feed::FeedStatus;
use feedsync::storage::{Database, DatabaseError, FeedKind, NewFeed, SyncAction};
use feedsync::sync::PushOutcome;

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

#[derive(Parser, Debug)]
#[command(
    name = "feedsync",
    about = "Adaptive feed fetcher with Google Reader style read-state sync"
)]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (overrides the config file)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one fetch cycle over all feeds, or refresh a single feed
    Refresh {
        /// Refresh only this feed, ignoring its circuit breaker
        #[arg(long)]
        feed: Option<i64>,
    },
    /// Run one reconciliation cycle with the remote reader service
    Sync,
    /// Measure the network and store the profile
    Measure,
    /// Set a read/favorite flag and push it to the remote service
    Mark {
        article_id: i64,
        #[arg(value_enum)]
        action: MarkAction,
    },
    /// Show sync queue and network status
    Status,
    /// Subscribe to a feed
    AddFeed {
        url: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, value_enum, default_value_t = KindArg::Rss)]
        kind: KindArg,
        #[arg(long)]
        category: Option<String>,
        /// Basic-auth user for credential feeds
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
        /// Fetch through the global proxy
        #[arg(long)]
        use_proxy: bool,
        /// Fetch through this proxy instead of the global one
        #[arg(long, value_name = "URL")]
        proxy: Option<String>,
    },
    /// List subscribed feeds
    Feeds,
    /// Unsubscribe from a feed and delete its articles
    RemoveFeed { feed_id: i64 },
    /// Store remote sync credentials, or turn sync off
    ConfigureSync {
        #[arg(long, required_unless_present = "disable")]
        server: Option<String>,
        #[arg(long, required_unless_present = "disable")]
        username: Option<String>,
        /// Read from FEEDSYNC_PASSWORD when omitted
        #[arg(long)]
        password: Option<String>,
        /// Turn sync off and forget the stored password
        #[arg(long, conflicts_with_all = ["server", "username", "password"])]
        disable: bool,
    },
    /// Set the global proxy used by feeds that opt in, or turn it off
    ConfigureProxy {
        #[arg(long, required_unless_present = "disable")]
        url: Option<String>,
        #[arg(long, conflicts_with = "url")]
        disable: bool,
    },
    /// Fetch and sync on timers until interrupted
    Daemon,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MarkAction {
    Read,
    Unread,
    Favorite,
    Unfavorite,
}

impl From<MarkAction> for SyncAction {
    fn from(action: MarkAction) -> Self {
        match action {
            MarkAction::Read => SyncAction::MarkRead,
            MarkAction::Unread => SyncAction::MarkUnread,
            MarkAction::Favorite => SyncAction::Favorite,
            MarkAction::Unfavorite => SyncAction::Unfavorite,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Rss,
    Script,
    Route,
    Reader,
    Credential,
}

impl From<KindArg> for FeedKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Rss => FeedKind::Rss,
            KindArg::Script => FeedKind::Script,
            KindArg::Route => FeedKind::Route,
            KindArg::Reader => FeedKind::Reader,
            KindArg::Credential => FeedKind::Credential,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // The settings table holds sync credentials; keep the directory user-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config_path = args.config.unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .db
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("feedsync.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of feedsync appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let http_client = reqwest::Client::builder()
        .redirect(create_redirect_policy())
        .user_agent(config.fetch.user_agent.clone())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    let engine = Engine::new(db.clone(), http_client, EngineOptions::from_config(&config, &config_dir));

    // Ctrl-C cancels whatever is running; cycles wind down on their own
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            cancel.cancel();
        }
    });

    match args.command {
        Command::Refresh { feed: Some(feed_id) } => {
            let new_articles = engine.refresh_feed(feed_id).await?;
            println!("Feed {}: {} new articles", feed_id, new_articles);
        }
        Command::Refresh { feed: None } => {
            let report = engine.run_fetch_cycle().await?;
            let progress = engine.fetch_progress();
            println!(
                "Fetched {}/{} feeds: {} new articles, {} errors, {} skipped{}",
                progress.completed,
                progress.total,
                report.total_new(),
                report.errors.len(),
                report.skipped.len(),
                if report.cancelled { " (cancelled)" } else { "" }
            );
            for (feed_id, entry) in &progress.feeds {
                if let FeedStatus::Failed(failure) = &entry.status {
                    let kind = if failure.transient { "transient" } else { "permanent" };
                    eprintln!("  [{}] {} ({}): {}", feed_id, entry.title, kind, failure.message);
                }
            }
        }
        Command::Sync => {
            let report = engine.reconcile().await?;
            if report.disabled {
                println!("Sync is not configured. Run `feedsync configure-sync` first.");
            } else if report.unreachable {
                println!("Remote service unreachable; {} changes still queued", engine.sync_status().await?.pending);
            } else {
                println!(
                    "Pushed {}, pulled {}, failed {}, dropped {}, deferred {}",
                    report.pushed, report.pulled, report.failed, report.dropped, report.skipped
                );
                if report.feeds_added > 0 || report.imported > 0 {
                    println!(
                        "Imported {} feeds and {} articles from the reader service",
                        report.feeds_added, report.imported
                    );
                }
                if let Some(error) = report.pull_error {
                    eprintln!("Pull failed: {}", error);
                }
            }
        }
        Command::Measure => {
            let profile = engine.measure_network().await;
            if profile.success {
                println!(
                    "{}: {:.2} Mbps, {} ms latency, concurrency {}",
                    profile.tier, profile.bandwidth_mbps, profile.latency_ms, profile.max_concurrency
                );
            } else {
                println!(
                    "Measurement failed; using {} (concurrency {})",
                    profile.tier, profile.max_concurrency
                );
            }
        }
        Command::Mark { article_id, action } => {
            let outcome = engine.record_user_action(article_id, action.into()).await?;
            match outcome {
                PushOutcome::Pushed => println!("Done"),
                PushOutcome::Queued { .. } => println!("Done (queued for sync)"),
                PushOutcome::Dropped => println!("Done (not on remote service)"),
            }
        }
        Command::Status => {
            let status = engine.sync_status().await?;
            println!("Sync queue: {} pending, {} failed", status.pending, status.failed);
            match status.last_reconcile.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)) {
                Some(when) => println!("Last sync: {}", when.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last sync: never"),
            }
            match feedsync::network::cached_profile(&db).await? {
                Some(p) => println!(
                    "Network: {} ({:.2} Mbps, {} ms), concurrency {}",
                    p.tier, p.bandwidth_mbps, p.latency_ms, p.max_concurrency
                ),
                None => println!("Network: not measured"),
            }
        }
        Command::AddFeed {
            url,
            title,
            kind,
            category,
            username,
            password,
            use_proxy,
            proxy,
        } => {
            let feed = NewFeed {
                title: title.unwrap_or_else(|| url.clone()),
                url,
                category,
                kind: kind.into(),
                auth_username: username,
                auth_password: password,
                proxy_enabled: use_proxy || proxy.is_some(),
                proxy_url: proxy,
            };
            let feed_id = db.insert_feed(&feed).await.context("Failed to add feed")?;
            println!("Added feed {}", feed_id);
        }
        Command::Feeds => {
            for feed in db.get_feeds().await? {
                let state = match (&feed.error, feed.consecutive_failures) {
                    (_, n) if n >= Database::CIRCUIT_BREAKER_THRESHOLD => " [circuit open]".to_string(),
                    (Some(e), _) => format!(" [error: {}]", e),
                    (None, _) => String::new(),
                };
                println!("{:>5}  {:<10} {}  {}{}", feed.id, feed.kind, feed.title, feed.url, state);
            }
        }
        Command::RemoveFeed { feed_id } => {
            if db.get_feed(feed_id).await?.is_none() {
                anyhow::bail!("Feed {} not found", feed_id);
            }
            let removed = db.delete_feed(feed_id).await.context("Failed to remove feed")?;
            println!("Removed feed {} and {} articles", feed_id, removed);
        }
        Command::ConfigureSync {
            server,
            username,
            password,
            disable,
        } => {
            if disable {
                db.set_setting("sync.enabled", "false").await?;
                db.delete_setting("sync.password").await?;
                println!("Sync disabled");
            } else {
                let password = match password {
                    Some(p) => p,
                    None => std::env::var("FEEDSYNC_PASSWORD")
                        .context("Pass --password or set FEEDSYNC_PASSWORD")?,
                };
                db.set_settings(&[
                    ("sync.enabled", "true".to_string()),
                    ("sync.server_url", server.unwrap_or_default()),
                    ("sync.username", username.unwrap_or_default()),
                    ("sync.password", password),
                ])
                .await?;
                println!("Sync configured");
            }
        }
        Command::ConfigureProxy { url, disable } => {
            if disable {
                db.set_setting("proxy.enabled", "false").await?;
                db.delete_setting("proxy.url").await?;
                println!("Global proxy disabled");
            } else {
                let url = url.unwrap_or_default();
                reqwest::Proxy::all(url.as_str()).context("Invalid proxy URL")?;
                db.set_settings(&[("proxy.enabled", "true".to_string()), ("proxy.url", url)])
                    .await?;
                println!("Global proxy configured");
            }
        }
        Command::Daemon => {
            let every = |minutes: u64| (minutes > 0).then(|| Duration::from_secs(minutes.saturating_mul(60)));
            engine
                .run_daemon(
                    every(config.refresh_interval_minutes),
                    every(config.sync_interval_minutes),
                )
                .await;
        }
    }

    engine.shutdown().await;
    Ok(())
}
