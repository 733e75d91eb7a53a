//! Duplicate detection for normalized entries.
//!
//! A draft is compared against stored entries by link, title and content
//! fingerprint. The link always decides first. What happens after that depends
//! on the [`DedupStrategy`]:
//!
//! | Strategy  | Duplicate when an existing entry matches                    |
//! |-----------|-------------------------------------------------------------|
//! | `strict`  | every enabled signal (title and content) on the same entry  |
//! | `medium`  | any enabled signal                                          |
//! | `relaxed` | title or content, regardless of the `check_by_*` switches   |
//!
//! Each row accepts everything the row above it accepts, so for one corpus the
//! duplicate count never decreases from `strict` to `relaxed`.

mod lookup;

pub use lookup::{EntryLookup, FeedScope};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

use crate::config::DedupConfig;
use crate::feed::EntryDraft;
use crate::storage::{DatabaseError, Entry};

// ============================================================================
// Strategy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// One stored entry must match every enabled signal. With
    /// `check_by_content` off this is a title match alone.
    Strict,
    /// Any enabled signal matches.
    #[default]
    Medium,
    /// Title or content, ignoring the `check_by_*` switches.
    Relaxed,
}

impl DedupStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupStrategy::Strict => "strict",
            DedupStrategy::Medium => "medium",
            DedupStrategy::Relaxed => "relaxed",
        }
    }
}

impl FromStr for DedupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(DedupStrategy::Strict),
            "medium" => Ok(DedupStrategy::Medium),
            "relaxed" => Ok(DedupStrategy::Relaxed),
            other => Err(format!(
                "unknown dedup strategy '{other}' (expected strict, medium or relaxed)"
            )),
        }
    }
}

impl fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupReason {
    /// No lookup collaborator was supplied; the check failed open.
    NoSession,
    Unique,
    Link,
    Title,
    Content,
    TitleAndContent,
}

impl fmt::Display for DedupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DedupReason::NoSession => "no database session",
            DedupReason::Unique => "no duplicate",
            DedupReason::Link => "duplicate link",
            DedupReason::Title => "duplicate title",
            DedupReason::Content => "duplicate content",
            DedupReason::TitleAndContent => "duplicate title and content",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupResult {
    pub is_duplicate: bool,
    pub reason: DedupReason,
    /// The stored entry that made this draft a duplicate.
    pub matched_entry_id: Option<i64>,
}

impl DedupResult {
    fn unique(reason: DedupReason) -> Self {
        Self {
            is_duplicate: false,
            reason,
            matched_entry_id: None,
        }
    }

    fn duplicate(reason: DedupReason, entry: &Entry) -> Self {
        Self {
            is_duplicate: true,
            reason,
            matched_entry_id: Some(entry.id),
        }
    }
}

/// Snapshot of the running counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DedupStats {
    pub checks: u64,
    pub duplicates_found: u64,
    pub link_matches: u64,
    pub title_matches: u64,
    pub content_matches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    duplicates_found: AtomicU64,
    link_matches: AtomicU64,
    title_matches: AtomicU64,
    content_matches: AtomicU64,
}

impl Counters {
    fn record(&self, reason: DedupReason) {
        let bump = |c: &AtomicU64| {
            c.fetch_add(1, Ordering::Relaxed);
        };
        match reason {
            DedupReason::NoSession | DedupReason::Unique => return,
            DedupReason::Link => bump(&self.link_matches),
            DedupReason::Title => bump(&self.title_matches),
            DedupReason::Content => bump(&self.content_matches),
            DedupReason::TitleAndContent => {
                bump(&self.title_matches);
                bump(&self.content_matches);
            }
        }
        bump(&self.duplicates_found);
    }
}

// ============================================================================
// Deduplicator
// ============================================================================

/// Decides whether a draft duplicates a stored entry.
///
/// Shared across concurrent cycles; the counters are atomics.
#[derive(Debug)]
pub struct Deduplicator {
    strategy: DedupStrategy,
    check_by_title: bool,
    check_by_content: bool,
    counters: Counters,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            strategy: config.strategy,
            check_by_title: config.check_by_title,
            check_by_content: config.check_by_content,
            counters: Counters::default(),
        }
    }

    pub fn strategy(&self) -> DedupStrategy {
        self.strategy
    }

    /// Check `draft` against entries of `feed_id`.
    ///
    /// With no `lookup` the draft is reported unique
    /// ([`DedupReason::NoSession`]) so ingestion keeps working without storage.
    pub async fn check_duplicate<L: EntryLookup>(
        &self,
        draft: &EntryDraft,
        feed_id: i64,
        lookup: Option<&mut L>,
    ) -> Result<DedupResult, DatabaseError> {
        self.counters.checks.fetch_add(1, Ordering::Relaxed);

        let Some(lookup) = lookup else {
            tracing::debug!(feed_id, "No lookup available, skipping duplicate check");
            return Ok(DedupResult::unique(DedupReason::NoSession));
        };

        let result = self.check_in_feed(draft, feed_id, lookup).await?;
        self.counters.record(result.reason);
        if result.is_duplicate {
            tracing::debug!(
                feed_id,
                link = %draft.link,
                reason = %result.reason,
                matched = ?result.matched_entry_id,
                "Duplicate entry"
            );
        }
        Ok(result)
    }

    async fn check_in_feed<L: EntryLookup>(
        &self,
        draft: &EntryDraft,
        feed_id: i64,
        lookup: &mut L,
    ) -> Result<DedupResult, DatabaseError> {
        let scope = FeedScope::Feed(feed_id);

        if let Some(entry) = lookup.find_by_link_hash(&draft.link_hash, scope).await? {
            return Ok(DedupResult::duplicate(DedupReason::Link, &entry));
        }

        let content_hash = draft.content_hash.as_deref();
        let (use_title, use_content) = match self.strategy {
            DedupStrategy::Relaxed => (true, true),
            _ => (self.check_by_title, self.check_by_content),
        };

        if self.strategy == DedupStrategy::Strict {
            // Conjunction of the enabled signals on one entry
            let found = match (use_title, use_content, content_hash) {
                (true, true, Some(content)) => {
                    lookup
                        .find_by_title_and_content(&draft.title_hash, content, scope)
                        .await?
                        .map(|e| (DedupReason::TitleAndContent, e))
                }
                (true, false, _) => lookup
                    .find_by_title_hash(&draft.title_hash, scope)
                    .await?
                    .map(|e| (DedupReason::Title, e)),
                (false, true, Some(content)) => lookup
                    .find_by_content_hash(content, scope)
                    .await?
                    .map(|e| (DedupReason::Content, e)),
                _ => None,
            };
            return Ok(match found {
                Some((reason, entry)) => DedupResult::duplicate(reason, &entry),
                None => DedupResult::unique(DedupReason::Unique),
            });
        }

        if use_title {
            if let Some(entry) = lookup.find_by_title_hash(&draft.title_hash, scope).await? {
                return Ok(DedupResult::duplicate(DedupReason::Title, &entry));
            }
        }
        if let (true, Some(content)) = (use_content, content_hash) {
            if let Some(entry) = lookup.find_by_content_hash(content, scope).await? {
                return Ok(DedupResult::duplicate(DedupReason::Content, &entry));
            }
        }

        Ok(DedupResult::unique(DedupReason::Unique))
    }

    /// Link then title check without the per-feed restriction.
    ///
    /// `feed_ids` narrows the search to those feeds; `None` searches all.
    /// Not counted in [`stats`](Self::stats).
    pub async fn check_duplicate_across_feeds<L: EntryLookup>(
        &self,
        draft: &EntryDraft,
        feed_ids: Option<&[i64]>,
        lookup: Option<&mut L>,
    ) -> Result<DedupResult, DatabaseError> {
        let Some(lookup) = lookup else {
            return Ok(DedupResult::unique(DedupReason::NoSession));
        };
        let scope = feed_ids.map_or(FeedScope::Any, FeedScope::Among);

        if let Some(entry) = lookup.find_by_link_hash(&draft.link_hash, scope).await? {
            return Ok(DedupResult::duplicate(DedupReason::Link, &entry));
        }
        if self.check_by_title {
            if let Some(entry) = lookup.find_by_title_hash(&draft.title_hash, scope).await? {
                return Ok(DedupResult::duplicate(DedupReason::Title, &entry));
            }
        }
        Ok(DedupResult::unique(DedupReason::Unique))
    }

    pub fn stats(&self) -> DedupStats {
        let c = &self.counters;
        DedupStats {
            checks: c.checks.load(Ordering::Relaxed),
            duplicates_found: c.duplicates_found.load(Ordering::Relaxed),
            link_matches: c.link_matches.load(Ordering::Relaxed),
            title_matches: c.title_matches.load(Ordering::Relaxed),
            content_matches: c.content_matches.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.checks,
            &c.duplicates_found,
            &c.link_matches,
            &c.title_matches,
            &c.content_matches,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
