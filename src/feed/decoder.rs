//! Response body decoders.
//!
//! Each decoder turns a fetched document into [`RawEntry`] records plus
//! feed-level metadata. Decoders are looked up by name from a static table;
//! `"auto"` picks one from the response's `Content-Type` and first byte.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::parser::RawEntry;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid RSS/Atom document: {0}")]
    Syndication(#[from] feed_rs::parser::ParseFeedError),

    #[error("Invalid JSON Feed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported JSON Feed version: {0}")]
    UnsupportedVersion(String),

    #[error("Unknown decoder '{0}'")]
    UnknownDecoder(String),
}

/// Feed-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedFeed {
    pub info: FeedInfo,
    pub entries: Vec<RawEntry>,
}

pub trait FeedDecoder: Send + Sync {
    /// Identifier used in configuration.
    fn name(&self) -> &'static str;

    fn decode(&self, body: &[u8]) -> Result<DecodedFeed, DecodeError>;
}

static DECODERS: &[&dyn FeedDecoder] = &[&SyndicationDecoder, &JsonFeedDecoder];

/// Decoder registered under `name`. `"auto"` is not a decoder; use [`sniff`].
pub fn decoder_for(name: &str) -> Result<&'static dyn FeedDecoder, DecodeError> {
    DECODERS
        .iter()
        .copied()
        .find(|decoder| decoder.name().eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| DecodeError::UnknownDecoder(name.to_string()))
}

/// Pick a decoder for a response.
///
/// JSON content types and bodies starting with `{` go to the JSON Feed
/// decoder; everything else is treated as RSS/Atom.
pub fn sniff(content_type: Option<&str>, body: &[u8]) -> &'static dyn FeedDecoder {
    let json_type = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
    let json_body = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'{');

    if json_type || json_body {
        &JsonFeedDecoder
    } else {
        &SyndicationDecoder
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ============================================================================
// RSS / Atom
// ============================================================================

/// RSS 0.9x/1.0/2.0 and Atom via `feed-rs`.
pub struct SyndicationDecoder;

impl FeedDecoder for SyndicationDecoder {
    fn name(&self) -> &'static str {
        "syndication"
    }

    fn decode(&self, body: &[u8]) -> Result<DecodedFeed, DecodeError> {
        let feed = feed_rs::parser::parse(body)?;

        let info = FeedInfo {
            title: feed.title.and_then(|t| non_empty(t.content)),
            description: feed.description.and_then(|t| non_empty(t.content)),
            link: feed.links.into_iter().next().map(|l| l.href),
            language: feed.language.and_then(non_empty),
        };

        let entries = feed
            .entries
            .into_iter()
            .map(|entry| RawEntry {
                id: non_empty(entry.id),
                title: entry.title.map(|t| t.content),
                link: entry
                    .links
                    .iter()
                    .find(|l| l.rel.as_deref().is_none_or(|rel| rel == "alternate"))
                    .or_else(|| entry.links.first())
                    .map(|l| l.href.clone()),
                author: entry.authors.into_iter().map(|p| p.name).find_map(non_empty),
                summary: entry.summary.map(|t| t.content),
                content: entry.content.and_then(|c| c.body),
                published: entry.published,
                updated: entry.updated,
                tags: entry
                    .categories
                    .into_iter()
                    .map(|c| c.label.unwrap_or(c.term))
                    .collect(),
                language: entry.language.or_else(|| info.language.clone()),
            })
            .collect();

        Ok(DecodedFeed { info, entries })
    }
}

// ============================================================================
// JSON Feed
// ============================================================================

/// JSON Feed 1.0 / 1.1 (<https://jsonfeed.org>).
pub struct JsonFeedDecoder;

#[derive(Debug, Deserialize)]
struct JsonFeedDocument {
    version: String,
    title: Option<String>,
    home_page_url: Option<String>,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedItem {
    id: Option<serde_json::Value>,
    url: Option<String>,
    external_url: Option<String>,
    title: Option<String>,
    content_html: Option<String>,
    content_text: Option<String>,
    summary: Option<String>,
    date_published: Option<DateTime<Utc>>,
    date_modified: Option<DateTime<Utc>>,
    // 1.0 used a single author, 1.1 a list
    author: Option<JsonFeedAuthor>,
    #[serde(default)]
    authors: Vec<JsonFeedAuthor>,
    #[serde(default)]
    tags: Vec<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedAuthor {
    name: Option<String>,
}

impl FeedDecoder for JsonFeedDecoder {
    fn name(&self) -> &'static str {
        "json-feed"
    }

    fn decode(&self, body: &[u8]) -> Result<DecodedFeed, DecodeError> {
        let doc: JsonFeedDocument = serde_json::from_slice(body)?;
        if !doc.version.starts_with("https://jsonfeed.org/version/") {
            return Err(DecodeError::UnsupportedVersion(doc.version));
        }

        let info = FeedInfo {
            title: doc.title.and_then(non_empty),
            description: doc.description.and_then(non_empty),
            link: doc.home_page_url,
            language: doc.language.and_then(non_empty),
        };

        let entries = doc
            .items
            .into_iter()
            .map(|item| {
                let id = item.id.and_then(|v| match v {
                    serde_json::Value::String(s) => non_empty(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                RawEntry {
                    link: item
                        .url
                        .or(item.external_url)
                        .or_else(|| id.clone().filter(|id| id.starts_with("http"))),
                    id,
                    title: item.title,
                    author: item
                        .authors
                        .into_iter()
                        .chain(item.author)
                        .find_map(|a| a.name.and_then(non_empty)),
                    summary: item.summary,
                    content: item.content_html.or(item.content_text),
                    published: item.date_published,
                    updated: item.date_modified,
                    tags: item.tags,
                    language: item.language.or_else(|| info.language.clone()),
                }
            })
            .collect();

        Ok(DecodedFeed { info, entries })
    }
}
