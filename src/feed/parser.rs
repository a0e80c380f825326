use anyhow::Result;
use feed_rs::model::{Entry, Link};
use feed_rs::parser;

use crate::storage::ParsedArticle;
use crate::util::canonical_url;

/// Outcome of parsing one feed document.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub articles: Vec<ParsedArticle>,
    /// Entries dropped because they had no usable http(s) link
    pub skipped: usize,
}

/// Parse an RSS/Atom/JSON feed document into articles keyed by canonical URL.
///
/// Entries without a link that canonicalizes are skipped rather than failing
/// the whole document; only a document that is not a feed at all is an error.
pub fn parse_feed(bytes: &[u8]) -> Result<ParseResult> {
    let feed = parser::parse(bytes)?;

    let mut result = ParseResult::default();
    for entry in feed.entries {
        match convert_entry(entry) {
            Some(article) => result.articles.push(article),
            None => result.skipped += 1,
        }
    }

    Ok(result)
}

fn convert_entry(entry: Entry) -> Option<ParsedArticle> {
    let url = pick_link(&entry.links).and_then(|href| canonical_url(href).ok())?;

    let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let summary = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .filter(|s| !s.trim().is_empty());
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    Some(ParsedArticle {
        url,
        title,
        published,
        summary,
    })
}

/// Prefer the `alternate` link (or one without a rel), fall back to the first.
fn pick_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.as_str())
}
