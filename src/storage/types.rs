use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The database is locked by another process. Close it and try again.")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    #[error("Feed {0} not found")]
    NotFound(i64),

    /// A stored value could not be mapped back to its Rust type
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related sqlx errors to [`DatabaseError::InstanceLocked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feeds
// ============================================================================

/// A subscribed feed and its fetch health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub fetch_interval_minutes: u32,
    /// Raw entries kept per fetch; 0 means unlimited.
    pub max_entries_per_fetch: u32,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetch_error_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub last_fetched_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Feed {
    /// Whether consecutive failures have reached the quarantine ceiling.
    pub fn is_quarantined(&self, max_consecutive_errors: u32) -> bool {
        self.fetch_error_count >= max_consecutive_errors
    }

    /// Display name, falling back to the URL.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Input for [`Database::insert_feed`](super::Database::insert_feed).
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    pub name: Option<String>,
    pub fetch_interval_minutes: u32,
    pub max_entries_per_fetch: u32,
}

impl NewFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            fetch_interval_minutes: 60,
            max_entries_per_fetch: 100,
        }
    }
}

pub(crate) const FEED_COLUMNS: &str = "id, url, name, description, enabled, \
     fetch_interval_minutes, max_entries_per_fetch, etag, last_modified, \
     fetch_error_count, last_error, last_error_at, last_fetched_at, created_at, updated_at";

/// Internal row type for feed queries; converted with `into_feed()`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub fetch_interval_minutes: i64,
    pub max_entries_per_fetch: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetch_error_count: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub last_fetched_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        let clamp = |v: i64| u32::try_from(v.max(0)).unwrap_or(u32::MAX);
        Feed {
            id: self.id,
            url: self.url,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            fetch_interval_minutes: clamp(self.fetch_interval_minutes),
            max_entries_per_fetch: clamp(self.max_entries_per_fetch),
            etag: self.etag,
            last_modified: self.last_modified,
            fetch_error_count: clamp(self.fetch_error_count),
            last_error: self.last_error,
            last_error_at: self.last_error_at,
            last_fetched_at: self.last_fetched_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Outcome of one fetch cycle, applied to the feed row.
///
/// `reset_errors` takes precedence over `increment_error`. Validators are only
/// overwritten when a new value is present.
#[derive(Debug, Clone, Default)]
pub struct FetchInfoUpdate {
    pub last_fetched_at: Option<i64>,
    pub increment_error: bool,
    pub last_error: Option<String>,
    pub reset_errors: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FetchInfoUpdate {
    pub fn success(now: i64, etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            last_fetched_at: Some(now),
            reset_errors: true,
            etag,
            last_modified,
            ..Self::default()
        }
    }

    pub fn failure(now: i64, error: impl Into<String>) -> Self {
        Self {
            last_fetched_at: Some(now),
            increment_error: true,
            last_error: Some(error.into()),
            ..Self::default()
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A persisted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
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
    pub fetched_at: i64,
    /// `false` when a filter rule hid the entry.
    pub enabled: bool,
}

pub(crate) const ENTRY_COLUMNS: &str = "id, feed_id, title, link, author, summary, content, \
     published_at, tags, language, reading_time_seconds, link_hash, title_hash, content_hash, \
     fetched_at, enabled";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub link: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<i64>,
    pub tags: String,
    pub language: Option<String>,
    pub reading_time_seconds: i64,
    pub link_hash: String,
    pub title_hash: String,
    pub content_hash: Option<String>,
    pub fetched_at: i64,
    pub enabled: bool,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self) -> Result<Entry, DatabaseError> {
        let tags: Vec<String> = serde_json::from_str(&self.tags).map_err(|e| {
            DatabaseError::InvalidValue(format!("entry {} tags: {e}", self.id))
        })?;

        Ok(Entry {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            link: self.link,
            author: self.author,
            summary: self.summary,
            content: self.content,
            published_at: self.published_at,
            tags,
            language: self.language,
            reading_time_seconds: u32::try_from(self.reading_time_seconds.max(0))
                .unwrap_or(u32::MAX),
            link_hash: self.link_hash,
            title_hash: self.title_hash,
            content_hash: self.content_hash,
            fetched_at: self.fetched_at,
            enabled: self.enabled,
        })
    }
}

// ============================================================================
// Filter Rules
// ============================================================================

/// What a filter rule's pattern is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Keyword,
    Regex,
    Tag,
    Language,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Keyword => "keyword",
            RuleType::Regex => "regex",
            RuleType::Tag => "tag",
            RuleType::Language => "language",
        }
    }
}

impl FromStr for RuleType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyword" => Ok(RuleType::Keyword),
            "regex" => Ok(RuleType::Regex),
            "tag" => Ok(RuleType::Tag),
            "language" => Ok(RuleType::Language),
            other => Err(DatabaseError::InvalidValue(format!("unknown rule type '{other}'"))),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a matching rule admits or suppresses an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Include,
    Exclude,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Include => "include",
            MatchType::Exclude => "exclude",
        }
    }
}

impl FromStr for MatchType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "include" => Ok(MatchType::Include),
            "exclude" => Ok(MatchType::Exclude),
            other => Err(DatabaseError::InvalidValue(format!("unknown match type '{other}'"))),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    pub match_type: MatchType,
    pub pattern: String,
    /// Higher priorities are evaluated first.
    pub priority: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewFilterRule {
    pub name: String,
    pub rule_type: RuleType,
    pub match_type: MatchType,
    pub pattern: String,
    pub priority: i64,
    pub enabled: bool,
}

pub(crate) const RULE_COLUMNS: &str = "id, name, rule_type, match_type, pattern, priority, enabled";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FilterRuleDbRow {
    pub id: i64,
    pub name: String,
    pub rule_type: String,
    pub match_type: String,
    pub pattern: String,
    pub priority: i64,
    pub enabled: bool,
}

impl FilterRuleDbRow {
    pub(crate) fn into_rule(self) -> Result<FilterRule, DatabaseError> {
        Ok(FilterRule {
            id: self.id,
            name: self.name,
            rule_type: self.rule_type.parse()?,
            match_type: self.match_type.parse()?,
            pattern: self.pattern,
            priority: self.priority,
            enabled: self.enabled,
        })
    }
}
