//! Client for Google Reader style sync APIs (FreshRSS `api/greader.php` and
//! compatible servers).
//!
//! Items are addressed by canonical URL. The remote item id needed by
//! `edit-tag` is resolved through the listed streams and cached.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::SyncError;
use crate::storage::{Database, DatabaseError, SyncAction};
use crate::util::canonical_url;

pub const TAG_READ: &str = "user/-/state/com.google/read";
pub const TAG_STARRED: &str = "user/-/state/com.google/starred";
pub const STREAM_READING_LIST: &str = "user/-/state/com.google/reading-list";

const API_SUFFIX: &str = "/api/greader.php";

/// Snapshot of the remote read/starred sets, as canonical URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
    pub read: HashSet<String>,
    pub starred: HashSet<String>,
    /// The starred listing was not truncated, so absence means "not starred"
    pub starred_complete: bool,
    /// Items the service reports as unread, newest first
    pub unread: Vec<RemoteItem>,
}

/// An item listed by the remote service, keyed by canonical URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub url: String,
    pub title: String,
    pub published: Option<i64>,
    pub summary: Option<String>,
}

/// A feed the account is subscribed to on the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscription {
    pub title: String,
    pub url: String,
    /// Label of the first category, if any
    pub category: Option<String>,
}

/// The remote reader service as seen by the sync executor.
#[async_trait]
pub trait ReaderService: Send + Sync {
    /// Apply one state change to the item with this canonical URL.
    /// Must be idempotent: repeating an action is a no-op remotely.
    async fn push(&self, url: &str, action: SyncAction) -> Result<(), SyncError>;

    /// Current read, starred and unread sets.
    async fn fetch_state(&self) -> Result<RemoteState, SyncError>;

    /// Feeds subscribed on the remote side.
    async fn subscriptions(&self) -> Result<Vec<RemoteSubscription>, SyncError> {
        Ok(Vec::new())
    }
}

/// Remote credentials from the settings store.
#[derive(Clone)]
pub struct RemoteConfig {
    pub server_url: String,
    pub username: String,
    pub password: SecretString,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Load remote credentials. Returns `None` when sync is disabled or any
/// credential is missing: the feature is simply off.
pub async fn load_remote_config(db: &Database) -> Result<Option<RemoteConfig>, DatabaseError> {
    let enabled = db.get_setting("sync.enabled").await?;
    if enabled.as_deref().map(str::trim) != Some("true") {
        return Ok(None);
    }

    let server_url = db.get_setting("sync.server_url").await?.unwrap_or_default();
    let username = db.get_setting("sync.username").await?.unwrap_or_default();
    let password = db.get_setting("sync.password").await?.unwrap_or_default();
    if server_url.trim().is_empty() || username.trim().is_empty() || password.is_empty() {
        tracing::debug!("Sync enabled but credentials incomplete");
        return Ok(None);
    }

    Ok(Some(RemoteConfig {
        server_url: server_url.trim().to_string(),
        username: username.trim().to_string(),
        password: SecretString::from(password),
    }))
}

#[derive(Debug, Deserialize)]
struct StreamContents {
    #[serde(default)]
    items: Vec<StreamItem>,
    #[serde(default)]
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamItem {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    published: Option<i64>,
    #[serde(default)]
    summary: Option<ItemContent>,
    #[serde(default)]
    canonical: Vec<Href>,
    #[serde(default)]
    alternate: Vec<Href>,
}

#[derive(Debug, Deserialize)]
struct Href {
    href: String,
}

#[derive(Debug, Deserialize)]
struct ItemContent {
    #[serde(default)]
    content: String,
}

impl StreamItem {
    fn canonical_url(&self) -> Option<String> {
        self.canonical
            .iter()
            .chain(self.alternate.iter())
            .find_map(|h| canonical_url(&h.href).ok())
    }

    fn into_remote(self, url: String) -> RemoteItem {
        RemoteItem {
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| url.clone()),
            url,
            published: self.published,
            summary: self.summary.map(|s| s.content).filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    #[serde(default)]
    subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    categories: Vec<CategoryEntry>,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    #[serde(default)]
    label: String,
}

/// One stream listing, possibly truncated at `max_items`.
struct Listing {
    items: Vec<RemoteItem>,
    complete: bool,
}

impl Listing {
    fn urls(&self) -> HashSet<String> {
        self.items.iter().map(|i| i.url.clone()).collect()
    }
}

/// A stream to list, optionally excluding items carrying a tag.
#[derive(Debug, Clone, Copy)]
struct StreamQuery<'a> {
    id: &'a str,
    exclude: Option<&'a str>,
}

impl<'a> StreamQuery<'a> {
    fn all(id: &'a str) -> Self {
        Self { id, exclude: None }
    }
}

/// Google Reader protocol client.
pub struct GReaderClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: SecretString,
    /// Items requested per stream page
    page_size: usize,
    /// Upper bound on items listed per stream
    max_items: usize,
    auth: Mutex<Option<String>>,
    /// canonical URL -> remote item id
    ids: Mutex<HashMap<String, String>>,
}

impl GReaderClient {
    pub fn new(client: reqwest::Client, config: RemoteConfig) -> Self {
        let trimmed = config.server_url.trim_end_matches('/');
        let base_url = if trimmed.ends_with(API_SUFFIX) {
            trimmed.to_string()
        } else {
            format!("{}{}", trimmed, API_SUFFIX)
        };

        Self {
            client,
            base_url,
            username: config.username,
            password: config.password,
            page_size: 1000,
            max_items: 10_000,
            auth: Mutex::new(None),
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Override paging limits (mostly for tests).
    pub fn with_limits(mut self, page_size: usize, max_items: usize) -> Self {
        self.page_size = page_size.max(1);
        self.max_items = max_items.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn auth_token(&self) -> Result<String, SyncError> {
        let mut auth = self.auth.lock().await;
        if let Some(token) = auth.as_ref() {
            return Ok(token.clone());
        }

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Email", &self.username)
            .append_pair("Passwd", self.password.expose_secret())
            .finish();
        let response = self
            .client
            .post(format!("{}/accounts/ClientLogin", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("login rejected with status {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(SyncError::HttpStatus(status.as_u16()));
        }

        let text = response.text().await?;
        let token = text
            .lines()
            .find_map(|line| line.trim().strip_prefix("Auth="))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Protocol("auth token not found in login response".into()))?
            .to_string();

        tracing::debug!(server = %self.base_url, "Reader service login succeeded");
        *auth = Some(token.clone());
        Ok(token)
    }

    /// Forget the cached login after the server rejected it.
    async fn invalidate_auth(&self) {
        *self.auth.lock().await = None;
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            self.invalidate_auth().await;
            return Err(SyncError::Auth(format!("request rejected with status {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(SyncError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }

    async fn write_token(&self, auth: &str) -> Result<String, SyncError> {
        let response = self
            .client
            .get(format!("{}/reader/api/0/token", self.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("GoogleLogin auth={}", auth))
            .send()
            .await?;
        let token = self.check(response).await?.text().await?;
        Ok(token.trim().to_string())
    }

    async fn stream_page(
        &self,
        auth: &str,
        stream: StreamQuery<'_>,
        continuation: Option<&str>,
    ) -> Result<StreamContents, SyncError> {
        // The serializer is not Send; finish it before the first await
        let query = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            query
                .append_pair("output", "json")
                .append_pair("n", &self.page_size.to_string());
            if let Some(tag) = stream.exclude {
                query.append_pair("xt", tag);
            }
            if let Some(c) = continuation {
                query.append_pair("c", c);
            }
            query.finish()
        };

        let response = self
            .client
            .get(format!(
                "{}/reader/api/0/stream/contents/{}?{}",
                self.base_url, stream.id, query
            ))
            .header(reqwest::header::AUTHORIZATION, format!("GoogleLogin auth={}", auth))
            .send()
            .await?;
        let bytes = self.check(response).await?.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Protocol(format!("invalid stream contents: {}", e)))
    }

    /// Page through a stream, caching URL -> id as items are seen. Stops
    /// early once `stop_at` is seen.
    async fn list_stream(
        &self,
        auth: &str,
        stream: StreamQuery<'_>,
        stop_at: Option<&str>,
    ) -> Result<Listing, SyncError> {
        let mut items: Vec<RemoteItem> = Vec::new();
        let mut seen_urls = HashSet::new();
        let mut seen = 0usize;
        let mut continuation: Option<String> = None;

        loop {
            let page = self.stream_page(auth, stream, continuation.as_deref()).await?;
            seen += page.items.len();
            let page_len = page.items.len();

            let mut found = false;
            {
                let mut ids = self.ids.lock().await;
                for item in page.items {
                    let Some(url) = item.canonical_url() else {
                        continue;
                    };
                    ids.insert(url.clone(), item.id.clone());
                    found |= stop_at == Some(url.as_str());
                    if seen_urls.insert(url.clone()) {
                        items.push(item.into_remote(url));
                    }
                }
            }

            if found {
                return Ok(Listing {
                    items,
                    complete: false,
                });
            }

            continuation = page.continuation.filter(|c| !c.is_empty());
            if continuation.is_none() || page_len == 0 {
                return Ok(Listing {
                    items,
                    complete: true,
                });
            }
            if seen >= self.max_items {
                tracing::debug!(stream = stream.id, items = seen, "Stream listing truncated");
                return Ok(Listing {
                    items,
                    complete: false,
                });
            }
        }
    }

    async fn resolve_item_id(&self, auth: &str, url: &str) -> Result<String, SyncError> {
        if let Some(id) = self.ids.lock().await.get(url) {
            return Ok(id.clone());
        }

        self.list_stream(auth, StreamQuery::all(STREAM_READING_LIST), Some(url))
            .await?;
        self.ids
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(url.to_string()))
    }

    async fn edit_tag(&self, auth: &str, item_id: &str, action: SyncAction) -> Result<(), SyncError> {
        let token = self.write_token(auth).await?;
        let (op, tag) = match action {
            SyncAction::MarkRead => ("a", TAG_READ),
            SyncAction::MarkUnread => ("r", TAG_READ),
            SyncAction::Favorite => ("a", TAG_STARRED),
            SyncAction::Unfavorite => ("r", TAG_STARRED),
        };
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("T", &token)
            .append_pair("i", item_id)
            .append_pair(op, tag)
            .finish();

        let response = self
            .client
            .post(format!("{}/reader/api/0/edit-tag", self.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("GoogleLogin auth={}", auth))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ReaderService for GReaderClient {
    async fn push(&self, url: &str, action: SyncAction) -> Result<(), SyncError> {
        let auth = self.auth_token().await?;
        let item_id = self.resolve_item_id(&auth, url).await?;
        self.edit_tag(&auth, &item_id, action).await?;
        tracing::debug!(url = %url, action = %action, "Pushed state change");
        Ok(())
    }

    async fn fetch_state(&self) -> Result<RemoteState, SyncError> {
        let auth = self.auth_token().await?;
        let read = self.list_stream(&auth, StreamQuery::all(TAG_READ), None).await?;
        let starred = self.list_stream(&auth, StreamQuery::all(TAG_STARRED), None).await?;
        let unread = self
            .list_stream(
                &auth,
                StreamQuery {
                    id: STREAM_READING_LIST,
                    exclude: Some(TAG_READ),
                },
                None,
            )
            .await?;
        Ok(RemoteState {
            read: read.urls(),
            starred: starred.urls(),
            starred_complete: starred.complete,
            unread: unread.items,
        })
    }

    async fn subscriptions(&self) -> Result<Vec<RemoteSubscription>, SyncError> {
        let auth = self.auth_token().await?;
        let response = self
            .client
            .get(format!("{}/reader/api/0/subscription/list?output=json", self.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("GoogleLogin auth={}", auth))
            .send()
            .await?;
        let bytes = self.check(response).await?.bytes().await?;
        let list: SubscriptionList = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Protocol(format!("invalid subscription list: {}", e)))?;

        Ok(list
            .subscriptions
            .into_iter()
            .filter(|s| !s.url.trim().is_empty())
            .map(|s| RemoteSubscription {
                title: if s.title.trim().is_empty() {
                    s.url.clone()
                } else {
                    s.title
                },
                url: s.url,
                category: s
                    .categories
                    .into_iter()
                    .map(|c| c.label)
                    .find(|l| !l.is_empty()),
            })
            .collect())
    }
}
