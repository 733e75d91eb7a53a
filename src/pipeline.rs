//! One ingestion cycle for one feed.
//!
//! fetch -> normalize -> dedup -> filter -> persist -> update feed metadata.
//!
//! Everything after the network round-trip runs in a single
//! [`UnitOfWork`](crate::storage::UnitOfWork): a failure part-way through
//! leaves no entries behind. The failure itself is then recorded on the feed
//! in a separate write.

use std::fmt;

use chrono::Utc;
use thiserror::Error;

use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::feed::{EntryParser, FetchError, FetchResult, Fetcher};
use crate::filter::FilterEngine;
use crate::storage::{Database, DatabaseError, Feed, FetchInfoUpdate};

#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Disabled,
    Quarantined,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NotFound => "feed not found",
            SkipReason::Disabled => "feed disabled",
            SkipReason::Quarantined => "feed quarantined",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleStatus {
    Completed,
    /// The server answered 304.
    NotModified,
    /// The error recorded on the feed.
    Failed(String),
    Skipped(SkipReason),
}

/// What a cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub feed_id: i64,
    pub status: CycleStatus,
    /// Raw entries received from the fetcher.
    pub fetched: usize,
    /// Entries the parser rejected.
    pub dropped: usize,
    pub duplicates: usize,
    /// Entries hidden by filter rules, stored or not.
    pub filtered: usize,
    /// Rows written, visible and hidden.
    pub stored: usize,
    pub fetch_time_seconds: f64,
}

impl CycleReport {
    fn new(feed_id: i64, status: CycleStatus) -> Self {
        Self {
            feed_id,
            status,
            fetched: 0,
            dropped: 0,
            duplicates: 0,
            filtered: 0,
            stored: 0,
            fetch_time_seconds: 0.0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, CycleStatus::Failed(_))
    }
}

/// Runs ingestion cycles. Shared by the scheduler's workers.
pub struct Ingestor {
    store: Database,
    fetcher: Fetcher,
    parser: EntryParser,
    dedup: Deduplicator,
    filter: FilterEngine,
    max_consecutive_errors: u32,
    retain_filtered: bool,
}

impl Ingestor {
    pub fn new(store: Database, config: &Config) -> Result<Self, FetchError> {
        Ok(Self {
            fetcher: Fetcher::new(&config.fetcher)?,
            parser: EntryParser::new(&config.parser),
            dedup: Deduplicator::new(&config.deduplicator),
            filter: FilterEngine::new(Vec::new(), config.filter.cache_size),
            max_consecutive_errors: config.feed.max_consecutive_errors,
            retain_filtered: config.filter.retain_filtered,
            store,
        })
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn max_consecutive_errors(&self) -> u32 {
        self.max_consecutive_errors
    }

    /// Run one cycle for `feed_id`.
    ///
    /// Disabled and quarantined feeds are skipped; `force` lets a quarantined
    /// feed through so a manual fetch can clear its error streak.
    pub async fn run_cycle(&self, feed_id: i64, force: bool) -> CycleReport {
        let feed = match self.store.get_feed(feed_id).await {
            Ok(feed) => feed,
            Err(DatabaseError::NotFound(_)) => {
                tracing::debug!(feed_id, "Feed vanished before its cycle");
                return CycleReport::new(feed_id, CycleStatus::Skipped(SkipReason::NotFound));
            }
            Err(e) => {
                tracing::warn!(feed_id, error = %e, "Failed to load feed");
                return CycleReport::new(feed_id, CycleStatus::Failed(e.to_string()));
            }
        };

        if !feed.enabled {
            tracing::debug!(feed_id, "Skipping disabled feed");
            return CycleReport::new(feed_id, CycleStatus::Skipped(SkipReason::Disabled));
        }
        if !force && feed.is_quarantined(self.max_consecutive_errors) {
            tracing::debug!(
                feed_id,
                errors = feed.fetch_error_count,
                "Skipping quarantined feed"
            );
            return CycleReport::new(feed_id, CycleStatus::Skipped(SkipReason::Quarantined));
        }

        let mut report = CycleReport::new(feed_id, CycleStatus::Completed);
        let mut fetch = self.fetcher.fetch_feed(&feed).await;
        report.fetch_time_seconds = fetch.fetch_time_seconds;
        report.fetched = fetch.entries_count;

        let outcome = match fetch.error.take() {
            Some(e) => Err(CycleError::from(e)),
            None => self
                .persist(&feed, fetch, &mut report)
                .await
                .map_err(CycleError::from),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    feed_id,
                    feed = %feed.display_name(),
                    fetched = report.fetched,
                    stored = report.stored,
                    duplicates = report.duplicates,
                    filtered = report.filtered,
                    dropped = report.dropped,
                    not_modified = report.status == CycleStatus::NotModified,
                    "Feed cycle completed"
                );
                report
            }
            Err(e) => self.record_failure(&feed, report, e).await,
        }
    }

    async fn persist(
        &self,
        feed: &Feed,
        fetch: FetchResult,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().timestamp();
        let mut uow = self.store.begin().await?;

        if fetch.not_modified {
            let update = FetchInfoUpdate::success(now, fetch.etag, fetch.last_modified);
            uow.update_fetch_info(feed.id, &update).await?;
            uow.commit().await?;
            report.status = CycleStatus::NotModified;
            return Ok(());
        }

        self.filter.replace_rules(uow.get_enabled_rules().await?);
        let rules = self.filter.snapshot();

        let (drafts, dropped) = self.parser.normalize_batch(fetch.entries);
        report.dropped = dropped;

        for draft in &drafts {
            let dedup = self
                .dedup
                .check_duplicate(draft, feed.id, Some(&mut uow))
                .await?;
            if dedup.is_duplicate {
                report.duplicates += 1;
                continue;
            }

            let decision = self.filter.evaluate_in(&rules, draft);
            if !decision.visible {
                report.filtered += 1;
                tracing::debug!(
                    feed_id = feed.id,
                    link = %draft.link,
                    rule = ?decision.matched_rule,
                    "Entry filtered"
                );
                if !self.retain_filtered {
                    continue;
                }
            }

            match uow.create_entry(feed.id, draft, decision.visible, now).await? {
                Some(_) => report.stored += 1,
                // Same link already stored under another feed
                None => report.duplicates += 1,
            }
        }

        if let Some(info) = &fetch.feed_info {
            uow.update_feed_info(feed.id, info.title.as_deref(), info.description.as_deref())
                .await?;
        }
        let update = FetchInfoUpdate::success(now, fetch.etag, fetch.last_modified);
        uow.update_fetch_info(feed.id, &update).await?;
        uow.commit().await
    }

    /// Fold a panic caught at the cycle boundary into the feed's error streak.
    pub async fn record_panic(&self, feed_id: i64, message: &str) {
        let update = FetchInfoUpdate::failure(
            Utc::now().timestamp(),
            format!("Cycle panicked: {message}"),
        );
        match self.store.update_fetch_info(feed_id, &update).await {
            Ok(feed) if feed.fetch_error_count == self.max_consecutive_errors => {
                tracing::info!(
                    feed_id,
                    feed = %feed.display_name(),
                    errors = feed.fetch_error_count,
                    "Feed quarantined, will be skipped until its errors are reset"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(feed_id, error = %e, "Failed to record feed panic");
            }
        }
    }

    async fn record_failure(
        &self,
        feed: &Feed,
        mut report: CycleReport,
        error: CycleError,
    ) -> CycleReport {
        let message = error.to_string();
        let update = FetchInfoUpdate::failure(Utc::now().timestamp(), message.clone());

        match self.store.update_fetch_info(feed.id, &update).await {
            Ok(updated) => {
                tracing::warn!(
                    feed_id = feed.id,
                    errors = updated.fetch_error_count,
                    error = %message,
                    "Feed cycle failed"
                );
                if updated.is_quarantined(self.max_consecutive_errors)
                    && !feed.is_quarantined(self.max_consecutive_errors)
                {
                    tracing::info!(
                        feed_id = feed.id,
                        feed = %feed.display_name(),
                        errors = updated.fetch_error_count,
                        "Feed quarantined, will be skipped until its errors are reset"
                    );
                }
            }
            Err(db_err) => {
                tracing::warn!(
                    feed_id = feed.id,
                    error = %db_err,
                    cycle_error = %message,
                    "Failed to record feed error"
                );
            }
        }

        report.status = CycleStatus::Failed(message);
        report
    }
}
