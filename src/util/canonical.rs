use thiserror::Error;
use url::Url;

/// Errors that can occur while turning an article or feed link into a
/// canonical URL.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UrlError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Normalizes a link into the canonical form used as the cross-system
/// identity key for articles.
///
/// The local store and the remote reader service have unrelated id spaces, so
/// URL equality is the only join key between them. Both sides must go through
/// this function before comparison:
///
/// - surrounding whitespace is trimmed
/// - scheme and host are lowercased, default ports removed (via [`Url`])
/// - the fragment is dropped
/// - trailing slashes are removed from non-root paths
/// - an empty query (`?`) is removed
///
/// Only `http` and `https` links are accepted.
///
/// # Examples
///
/// ```
/// use feedsync::util::canonical_url;
///
/// let a = canonical_url("HTTPS://Example.COM/posts/1/#comments").unwrap();
/// let b = canonical_url("https://example.com/posts/1").unwrap();
/// assert_eq!(a, b);
///
/// assert!(canonical_url("javascript:alert(1)").is_err());
/// ```
pub fn canonical_url(raw: &str) -> Result<String, UrlError> {
    let mut url = Url::parse(raw.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
        let trimmed = trimmed.to_owned();
        url.set_path(&trimmed);
    }

    Ok(url.into())
}
