use crate::feed::parser::{parse_feed, ParseResult};
use crate::storage::{Database, Feed, FeedKind};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Default aggregator instance for `rsshub://` routes.
pub const DEFAULT_ROUTE_ENDPOINT: &str = "https://rsshub.app";

const ROUTE_SCHEME: &str = "rsshub://";

/// Errors that can occur during feed fetching operations.
///
/// These errors cover the full lifecycle of a fetch: obtaining the document,
/// HTTP errors, parsing failures, and storing the merged articles.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The per-feed timeout elapsed
    #[error("Request timed out")]
    Timeout,
    /// Document could not be parsed as a feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Database operation failed during article storage
    #[error("Database error: {0}")]
    Database(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Feed script could not be run or exited unsuccessfully
    #[error("Script failed: {0}")]
    Script(String),
    /// Feed source is malformed (bad route, unsafe script name, ...)
    #[error("Invalid feed source: {0}")]
    InvalidSource(String),
    /// The cycle was cancelled while this fetch was in flight
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    ///
    /// Transport failures, timeouts and server-side errors are transient;
    /// malformed payloads, client errors and bad sources are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::RateLimited(_)
            | FetchError::IncompleteResponse { .. }
            | FetchError::Cancelled => true,
            FetchError::HttpStatus(status) => *status >= 500 || *status == 408,
            FetchError::Parse(_)
            | FetchError::Database(_)
            | FetchError::ResponseTooLarge
            | FetchError::Script(_)
            | FetchError::InvalidSource(_) => false,
        }
    }
}

/// Cloneable record of a failed fetch, kept in progress snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFailure {
    pub message: String,
    pub transient: bool,
}

impl From<&FetchError> for FeedFailure {
    fn from(err: &FetchError) -> Self {
        Self {
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }
}

/// Tunables for a single feed fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Upper bound for obtaining one feed document, retries included
    pub timeout: Duration,
    pub max_retries: u32,
    /// First retry delay; doubles per retry
    pub retry_base_delay: Duration,
    pub max_feed_size: usize,
    /// Directory holding executables for `script` feeds
    pub scripts_dir: PathBuf,
    /// User agent for clients built per proxy
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            max_feed_size: 10 * 1024 * 1024,
            scripts_dir: PathBuf::from("scripts"),
            user_agent: concat!("feedsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Aggregator settings used to expand `rsshub://` routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ROUTE_ENDPOINT.to_string(),
            api_key: None,
        }
    }
}

impl RouteSettings {
    /// Read `rsshub.endpoint` / `rsshub.api_key`, falling back to defaults on
    /// missing values or a store error.
    pub async fn load(db: &Database) -> Self {
        let endpoint = match db.get_setting("rsshub.endpoint").await {
            Ok(Some(v)) if !v.trim().is_empty() => v.trim().to_string(),
            Ok(_) => DEFAULT_ROUTE_ENDPOINT.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read route endpoint, using default");
                DEFAULT_ROUTE_ENDPOINT.to_string()
            }
        };
        let api_key = db
            .get_setting("rsshub.api_key")
            .await
            .ok()
            .flatten()
            .filter(|k| !k.is_empty());
        Self { endpoint, api_key }
    }

    /// Expand `rsshub://<route>` into a concrete URL on the endpoint.
    pub fn expand(&self, feed_url: &str) -> Result<String, FetchError> {
        let route = feed_url
            .strip_prefix(ROUTE_SCHEME)
            .ok_or_else(|| FetchError::InvalidSource(format!("not a route: {}", feed_url)))?
            .trim_start_matches('/');
        if route.is_empty() {
            return Err(FetchError::InvalidSource("empty route".into()));
        }

        let joined = format!("{}/{}", self.endpoint.trim_end_matches('/'), route);
        let mut url = url::Url::parse(&joined)
            .map_err(|e| FetchError::InvalidSource(format!("{}: {}", joined, e)))?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url.into())
    }
}

/// Global proxy from `proxy.enabled` / `proxy.url`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    /// Set only while the global proxy is enabled
    pub url: Option<String>,
}

impl ProxySettings {
    /// Read the global proxy, treating a store error as "no proxy".
    pub async fn load(db: &Database) -> Self {
        let enabled = match db.get_setting("proxy.enabled").await {
            Ok(v) => v.as_deref().map(str::trim) == Some("true"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read proxy settings, fetching directly");
                false
            }
        };
        if !enabled {
            return Self::default();
        }
        let url = db
            .get_setting("proxy.url")
            .await
            .ok()
            .flatten()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        Self { url }
    }

    /// Proxy for one feed. Feeds opt in; their own proxy wins over the
    /// global one.
    pub fn for_feed<'a>(&'a self, feed: &'a Feed) -> Option<&'a str> {
        if !feed.proxy_enabled {
            return None;
        }
        feed.proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .or(self.url.as_deref())
    }
}

/// Settings read once per cycle that decide where documents come from.
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub routes: RouteSettings,
    pub proxy: ProxySettings,
}

impl SourceSettings {
    pub async fn load(db: &Database) -> Self {
        Self {
            routes: RouteSettings::load(db).await,
            proxy: ProxySettings::load(db).await,
        }
    }
}

/// Where a feed's document comes from, after resolving its kind.
#[derive(Debug, PartialEq, Eq)]
enum Source {
    Http {
        url: String,
        username: Option<String>,
        password: Option<String>,
        proxy: Option<String>,
    },
    Script(PathBuf),
}

/// Fetches feed documents and merges them into the store.
///
/// Cheap to clone; one instance is shared by every worker of a cycle.
#[derive(Clone)]
pub struct Fetcher {
    db: Database,
    client: reqwest::Client,
    options: Arc<FetchOptions>,
    /// proxy URL -> client routed through it
    proxied: Arc<Mutex<HashMap<String, reqwest::Client>>>,
}

impl Fetcher {
    pub fn new(db: Database, client: reqwest::Client, options: FetchOptions) -> Self {
        Self {
            db,
            client,
            options: Arc::new(options),
            proxied: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The shared client, or one routed through `proxy`. Proxied clients are
    /// built once per proxy URL.
    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let Some(proxy_url) = proxy else {
            return Ok(self.client.clone());
        };

        let mut proxied = self
            .proxied
            .lock()
            .map_err(|_| FetchError::InvalidSource("proxy client cache poisoned".into()))?;
        if let Some(client) = proxied.get(proxy_url) {
            return Ok(client.clone());
        }

        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| FetchError::InvalidSource(format!("bad proxy URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .user_agent(self.options.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        tracing::debug!("Built proxied HTTP client");
        proxied.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }

    /// Refreshes a single feed and records the outcome on the feed row.
    ///
    /// Bypasses the circuit breaker used by scheduled cycles: the fetch is
    /// always attempted. Success resets the failure counter via
    /// `complete_feed_refresh`.
    pub async fn refresh_one(&self, feed: &Feed) -> Result<usize, FetchError> {
        if feed.kind == FeedKind::Reader {
            return Ok(0);
        }

        let sources = SourceSettings::load(&self.db).await;
        let result = self.fetch_and_merge(feed, &sources).await;
        if let Err(e) = &result {
            self.record_failure(feed, e).await;
        }
        result
    }

    /// Obtain, parse and merge one feed. The per-feed timeout covers obtaining
    /// the document (retries included); parsing and merging are local.
    pub(crate) async fn fetch_and_merge(
        &self,
        feed: &Feed,
        sources: &SourceSettings,
    ) -> Result<usize, FetchError> {
        let bytes = tokio::time::timeout(self.options.timeout, self.fetch_document(feed, sources))
            .await
            .map_err(|_| FetchError::Timeout)??;

        let ParseResult { articles, skipped } =
            parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        if skipped > 0 {
            tracing::warn!(
                feed_id = feed.id,
                filtered = skipped,
                "Entries without a usable link skipped"
            );
        }

        // Clears the error, resets the breaker and upserts in one transaction
        self.db
            .complete_feed_refresh(feed.id, &articles)
            .await
            .map_err(|e| FetchError::Database(e.to_string()))
    }

    /// Store the error on the feed row and bump its consecutive failure count.
    /// Store errors are logged, never propagated.
    pub(crate) async fn record_failure(&self, feed: &Feed, error: &FetchError) {
        match self.db.record_feed_failure(feed.id, &error.to_string()).await {
            Ok(failures) => {
                if failures >= Database::CIRCUIT_BREAKER_THRESHOLD {
                    tracing::info!(
                        feed_id = feed.id,
                        title = %feed.title,
                        failures = failures,
                        "Feed circuit breaker tripped - will be skipped until manual refresh"
                    );
                }
            }
            Err(db_err) => {
                tracing::warn!(
                    feed_id = feed.id,
                    error = %db_err,
                    "Failed to record feed failure"
                );
            }
        }
    }

    fn resolve_source(&self, feed: &Feed, sources: &SourceSettings) -> Result<Source, FetchError> {
        let proxy = sources.proxy.for_feed(feed).map(str::to_string);
        match feed.kind {
            FeedKind::Rss => Ok(Source::Http {
                url: feed.url.clone(),
                username: None,
                password: None,
                proxy,
            }),
            FeedKind::Credential => Ok(Source::Http {
                url: feed.url.clone(),
                username: feed.auth_username.clone(),
                password: feed.auth_password.clone(),
                proxy,
            }),
            FeedKind::Route => Ok(Source::Http {
                url: sources.routes.expand(&feed.url)?,
                username: None,
                password: None,
                proxy,
            }),
            FeedKind::Script => script_path(&self.options.scripts_dir, &feed.url).map(Source::Script),
            FeedKind::Reader => Err(FetchError::InvalidSource(
                "reader-sourced feeds are not fetched directly".into(),
            )),
        }
    }

    async fn fetch_document(&self, feed: &Feed, sources: &SourceSettings) -> Result<Vec<u8>, FetchError> {
        match self.resolve_source(feed, sources)? {
            Source::Http {
                url,
                username,
                password,
                proxy,
            } => {
                let client = self.client_for(proxy.as_deref())?;
                self.fetch_http(&client, &url, username.as_deref(), password.as_deref())
                    .await
            }
            Source::Script(path) => run_script(&path, self.options.max_feed_size).await,
        }
    }

    async fn fetch_http(
        &self,
        client: &reqwest::Client,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let max_retries = self.options.max_retries;
        let mut retry_count = 0;

        loop {
            let mut request = client.get(url);
            if let Some(user) = username {
                request = request.basic_auth(user, password);
            }
            let response = request.send().await.map_err(FetchError::Network)?;
            let status = response.status();

            // Rate limiting and server errors back off exponentially
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= max_retries {
                    return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(max_retries)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }

                let delay = self.retry_delay(retry_count);
                tracing::warn!(
                    feed = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Transient HTTP status, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, self.options.max_feed_size).await {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < max_retries =>
                {
                    let delay = self.retry_delay(retry_count);
                    tracing::debug!(
                        feed = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn retry_delay(&self, retry_count: u32) -> Duration {
        self.options
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }
}

/// Resolve a script feed's file name inside the scripts directory. Names
/// that could escape the directory are rejected.
fn script_path(scripts_dir: &Path, name: &str) -> Result<PathBuf, FetchError> {
    let name = name.trim();
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(FetchError::InvalidSource(format!(
            "unsafe script name '{}'",
            name
        )));
    }
    Ok(scripts_dir.join(name))
}

/// Run a feed script and capture stdout as the document.
///
/// Interpreted scripts are launched through their interpreter by extension;
/// anything else is executed directly. The child is killed if the fetch
/// future is dropped (timeout or cancellation).
async fn run_script(path: &Path, limit: usize) -> Result<Vec<u8>, FetchError> {
    let interpreter = match path.extension().and_then(|e| e.to_str()) {
        Some("sh") => Some("sh"),
        Some("py") => Some("python3"),
        Some("js") => Some("node"),
        Some("rb") => Some("ruby"),
        _ => None,
    };

    let mut command = match interpreter {
        Some(program) => {
            let mut c = tokio::process::Command::new(program);
            c.arg(path);
            c
        }
        None => tokio::process::Command::new(path),
    };
    if let Some(dir) = path.parent() {
        command.current_dir(dir);
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let output = command
        .output()
        .await
        .map_err(|e| FetchError::Script(format!("{}: {}", path.display(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().next().unwrap_or("").trim();
        return Err(FetchError::Script(format!(
            "{} exited with {}{}{}",
            path.display(),
            output.status,
            if detail.is_empty() { "" } else { ": " },
            detail
        )));
    }
    if output.stdout.len() > limit {
        return Err(FetchError::ResponseTooLarge);
    }
    Ok(output.stdout)
}

pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // Interrupted transfers deliver fewer bytes than announced
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
