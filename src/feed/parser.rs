use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::config::ParserConfig;
use crate::util::{
    collapse_whitespace, compute_hashes, strip_control_chars, strip_markup, truncate_chars,
    word_count,
};

/// Titles longer than this are cut.
const MAX_TITLE_CHARS: usize = 1000;

/// An entry as a decoder produced it, before any cleanup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub language: Option<String>,
}

/// A normalized entry ready for dedup, filtering and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub title: String,
    pub link: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<i64>,
    pub tags: Vec<String>,
    pub language: Option<String>,
    pub reading_time_seconds: u32,
    pub link_hash: String,
    pub title_hash: String,
    pub content_hash: Option<String>,
}

impl EntryDraft {
    /// Content if present, otherwise the summary.
    pub fn body(&self) -> Option<&str> {
        self.content.as_deref().or(self.summary.as_deref())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryParseError {
    #[error("Entry has no title")]
    MissingTitle,

    #[error("Entry has no link")]
    MissingLink,

    #[error("Entry link is not a usable http(s) URL: {0}")]
    InvalidLink(String),
}

/// Turns [`RawEntry`] records into [`EntryDraft`]s.
#[derive(Debug, Clone)]
pub struct EntryParser {
    max_content_length: usize,
    reading_speed_wpm: u32,
    detect_language: bool,
}

impl EntryParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            max_content_length: config.max_content_length,
            reading_speed_wpm: config.reading_speed_wpm.max(1),
            detect_language: config.detect_language,
        }
    }

    pub fn normalize(&self, raw: RawEntry) -> Result<EntryDraft, EntryParseError> {
        let title = raw
            .title
            .as_deref()
            .map(|t| clean_text(t, MAX_TITLE_CHARS))
            .filter(|t| !t.is_empty())
            .ok_or(EntryParseError::MissingTitle)?;

        let link = raw
            .link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(EntryParseError::MissingLink)?
            .to_string();

        let summary = self.clean_body(raw.summary.as_deref());
        let content = self.clean_body(raw.content.as_deref());
        let body = content.as_deref().or(summary.as_deref());

        let hashes = compute_hashes(&title, &link, body)
            .ok_or_else(|| EntryParseError::InvalidLink(link.clone()))?;

        let language = raw
            .language
            .as_deref()
            .and_then(primary_subtag)
            .or_else(|| self.detect(&title, body));

        let reading_time_seconds = self.reading_time(body.map_or(0, word_count));

        Ok(EntryDraft {
            author: raw
                .author
                .as_deref()
                .map(|a| collapse_whitespace(&strip_control_chars(a)))
                .filter(|a| !a.is_empty()),
            published_at: raw.published.or(raw.updated).map(|dt| dt.timestamp()),
            tags: dedup_tags(raw.tags),
            title,
            link,
            summary,
            content,
            language,
            reading_time_seconds,
            link_hash: hashes.link_hash,
            title_hash: hashes.title_hash,
            content_hash: hashes.content_hash,
        })
    }

    /// Normalize every entry, dropping the ones that fail.
    ///
    /// Returns the drafts in input order and the number of dropped entries.
    pub fn normalize_batch(&self, raws: Vec<RawEntry>) -> (Vec<EntryDraft>, usize) {
        let mut drafts = Vec::with_capacity(raws.len());
        let mut dropped = 0;

        for raw in raws {
            let id = raw.id.clone();
            match self.normalize(raw) {
                Ok(draft) => drafts.push(draft),
                Err(e) => {
                    tracing::debug!(entry_id = ?id, error = %e, "Dropping malformed entry");
                    dropped += 1;
                }
            }
        }

        (drafts, dropped)
    }

    fn clean_body(&self, text: Option<&str>) -> Option<String> {
        text.map(|t| clean_text(t, self.max_content_length))
            .filter(|t| !t.is_empty())
    }

    fn detect(&self, title: &str, body: Option<&str>) -> Option<String> {
        if !self.detect_language {
            return None;
        }
        let text = match body {
            Some(body) => format!("{title} {body}"),
            None => title.to_string(),
        };
        whatlang::detect(&text)
            .filter(|info| info.is_reliable())
            .map(|info| info.lang().code().to_string())
    }

    fn reading_time(&self, words: usize) -> u32 {
        let seconds = (words as u64 * 60).div_ceil(u64::from(self.reading_speed_wpm));
        u32::try_from(seconds).unwrap_or(u32::MAX)
    }
}

fn clean_text(input: &str, max_chars: usize) -> String {
    truncate_chars(&strip_markup(input), max_chars).into_owned()
}

/// `"en-US"` -> `"en"`.
fn primary_subtag(tag: &str) -> Option<String> {
    let primary = tag.trim().split(['-', '_']).next()?.trim();
    (!primary.is_empty()).then(|| primary.to_ascii_lowercase())
}

fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}
