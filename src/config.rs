//! Configuration file parser for `config.toml`.
//!
//! The config file is optional; a missing or empty file yields
//! `Config::default()`. Every section is `#[serde(default)]`, so any subset of
//! keys may be given. Unknown top-level sections are logged as warnings
//! rather than rejected, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::dedup::DedupStrategy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration, one field per TOML section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherConfig,
    pub parser: ParserConfig,
    pub deduplicator: DedupConfig,
    pub feed: FeedConfig,
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("feedloom.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running fetch cycles.
    pub max_workers: usize,
    /// How often the dispatch loop looks for due feeds.
    pub tick_interval_ms: u64,
    /// Interval for jobs registered without an explicit one.
    pub default_interval_minutes: u64,
    /// Floor applied to every job interval.
    pub min_interval_minutes: u64,
    /// Feeds pulled from storage by `sync_jobs` when no limit is given.
    pub max_feeds_per_sync: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            tick_interval_ms: 1_000,
            default_interval_minutes: 60,
            min_interval_minutes: 10,
            max_feeds_per_sync: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Per-attempt request timeout.
    pub timeout_seconds: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_backoff_ms * 2^n`.
    pub retry_backoff_ms: u64,
    pub user_agent: String,
    /// Response bodies above this size are rejected.
    pub max_feed_size_bytes: usize,
    /// Decoder identifier: `"auto"`, `"syndication"` or `"json-feed"`.
    pub decoder: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            user_agent: format!(
                "feedloom/{} (+https://github.com/feedloom/feedloom)",
                env!("CARGO_PKG_VERSION")
            ),
            max_feed_size_bytes: 10 * 1024 * 1024,
            decoder: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Characters kept from summary and content after markup stripping.
    pub max_content_length: usize,
    pub reading_speed_wpm: u32,
    /// Guess a language from the text when the feed declares none.
    pub detect_language: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_content_length: 100_000,
            reading_speed_wpm: 200,
            detect_language: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub strategy: DedupStrategy,
    pub check_by_title: bool,
    pub check_by_content: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::Medium,
            check_by_title: true,
            check_by_content: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Consecutive failures after which a feed stops being scheduled.
    pub max_consecutive_errors: u32,
    /// Reject private/loopback subscription URLs.
    pub validate_url: bool,
    /// Entries kept per fetch for newly added feeds.
    pub default_max_entries_per_fetch: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 10,
            validate_url: true,
            default_max_entries_per_fetch: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Capacity of the compiled-regex LRU cache.
    pub cache_size: usize,
    /// Store filtered entries with `enabled = false` instead of discarding them.
    pub retain_filtered: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            retain_filtered: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Maximum config file size (1 MiB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_SECTIONS: [&'static str; 8] = [
        "database",
        "scheduler",
        "fetcher",
        "parser",
        "deduplicator",
        "feed",
        "filter",
        "logging",
    ];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing or blank file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            strategy = %config.deduplicator.strategy,
            max_workers = config.scheduler.max_workers,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_SECTIONS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown section in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 7] = [
            (self.scheduler.max_workers >= 1, "scheduler.max_workers must be at least 1"),
            (
                self.scheduler.min_interval_minutes >= 1,
                "scheduler.min_interval_minutes must be at least 1",
            ),
            (self.scheduler.tick_interval_ms >= 1, "scheduler.tick_interval_ms must be at least 1"),
            (self.fetcher.timeout_seconds >= 1, "fetcher.timeout_seconds must be at least 1"),
            (self.fetcher.max_retries <= 10, "fetcher.max_retries must be at most 10"),
            (self.parser.reading_speed_wpm >= 1, "parser.reading_speed_wpm must be at least 1"),
            (
                self.feed.max_consecutive_errors >= 1,
                "feed.max_consecutive_errors must be at least 1",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
