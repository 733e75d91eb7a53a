use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tracing_subscriber::EnvFilter;

use feedloom::config::Config;
use feedloom::pipeline::{CycleReport, CycleStatus, Ingestor};
use feedloom::scheduler::{RunOutcome, Scheduler};
use feedloom::storage::{Database, DatabaseError, MatchType, NewFeed, NewFilterRule, RuleType};
use feedloom::util::validate_url;

/// How often `run` picks up feeds added or un-quarantined since startup.
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Default config path (~/.config/feedloom/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("feedloom")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedloom",
    version,
    about = "Scheduled feed ingestion with deduplication and rule-based filtering"
)]
struct Args {
    /// Configuration file (default: ~/.config/feedloom/config.toml)
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    AddFeed {
        url: String,
        #[arg(long)]
        name: Option<String>,
        /// Fetch interval in minutes
        #[arg(long)]
        interval: Option<u32>,
        /// Raw entries kept per fetch (0 = unlimited)
        #[arg(long)]
        max_entries: Option<u32>,
    },
    /// Add a filter rule
    AddRule {
        name: String,
        pattern: String,
        /// keyword, regex, tag or language
        #[arg(long = "type", default_value = "keyword")]
        rule_type: RuleType,
        /// include or exclude
        #[arg(long = "match", default_value = "exclude")]
        match_type: MatchType,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Fetch due feeds once, or a single feed
    Fetch {
        #[arg(long, value_name = "ID")]
        feed: Option<i64>,
        /// Fetch even if the feed is quarantined
        #[arg(long, requires = "feed")]
        force: bool,
    },
    /// Run the scheduler until interrupted
    Run,
    /// Clear a feed's error streak
    ResetFeed { id: i64 },
    /// List subscriptions with entry counts
    ListFeeds,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid logging.level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db_path = config.database.path.to_string_lossy().into_owned();
    let db = match Database::open(&db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another feedloom process holds the database lock. Please stop it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let result = run_command(args.command, &config, db.clone()).await;
    db.close().await;
    result
}

async fn run_command(command: Command, config: &Config, db: Database) -> Result<()> {
    match command {
        Command::AddFeed {
            url,
            name,
            interval,
            max_entries,
        } => {
            if config.feed.validate_url {
                validate_url(&url).with_context(|| format!("Refusing to subscribe to {url}"))?;
            }
            let default_interval = u32::try_from(config.scheduler.default_interval_minutes)
                .unwrap_or(u32::MAX);
            let feed = db
                .insert_feed(&NewFeed {
                    url,
                    name,
                    fetch_interval_minutes: interval.unwrap_or(default_interval),
                    max_entries_per_fetch: max_entries
                        .unwrap_or(config.feed.default_max_entries_per_fetch),
                })
                .await
                .context("Failed to add feed")?;
            println!("Added feed {} ({})", feed.id, feed.url);
        }

        Command::AddRule {
            name,
            pattern,
            rule_type,
            match_type,
            priority,
        } => {
            let rule = db
                .create_filter_rule(&NewFilterRule {
                    name,
                    rule_type,
                    match_type,
                    pattern,
                    priority,
                    enabled: true,
                })
                .await
                .context("Failed to add filter rule")?;
            println!(
                "Added rule {} '{}': {} {} '{}'",
                rule.id, rule.name, rule.match_type, rule.rule_type, rule.pattern
            );
        }

        Command::Fetch { feed, force } => {
            let scheduler = build_scheduler(config, db.clone())?;
            match feed {
                Some(feed_id) => match scheduler.run_now(feed_id, force).await {
                    RunOutcome::Completed(report) => print_report(&report),
                    RunOutcome::AlreadyRunning => println!("feed {feed_id}: already running"),
                },
                None => {
                    let feeds = db
                        .get_feeds_to_fetch(
                            config.scheduler.max_feeds_per_sync,
                            config.feed.max_consecutive_errors,
                        )
                        .await
                        .context("Failed to load feeds")?;
                    if feeds.is_empty() {
                        println!("No feeds to fetch");
                    }

                    let scheduler = &scheduler;
                    let outcomes: Vec<RunOutcome> = stream::iter(feeds)
                        .map(|feed| async move { scheduler.run_now(feed.id, false).await })
                        .buffer_unordered(config.scheduler.max_workers.max(1))
                        .collect()
                        .await;
                    for outcome in &outcomes {
                        if let RunOutcome::Completed(report) = outcome {
                            print_report(report);
                        }
                    }
                }
            }
        }

        Command::Run => {
            let scheduler = build_scheduler(config, db)?;
            scheduler
                .sync_jobs(config.scheduler.max_feeds_per_sync)
                .await
                .context("Failed to load feeds")?;
            scheduler.start();

            let mut resync = tokio::time::interval(RESYNC_INTERVAL);
            resync.tick().await;
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("Failed to listen for Ctrl-C")?;
                        println!("Shutting down, waiting for running cycles...");
                        break;
                    }
                    _ = resync.tick() => {
                        if let Err(e) = scheduler.sync_jobs(config.scheduler.max_feeds_per_sync).await {
                            tracing::warn!(error = %e, "Failed to synchronize feed jobs");
                        }
                    }
                }
            }
            scheduler.stop(true).await;
        }

        Command::ResetFeed { id } => {
            let feed = db
                .reset_feed_errors(id)
                .await
                .with_context(|| format!("Failed to reset feed {id}"))?;
            println!("Feed {} errors reset", feed.id);
        }

        Command::ListFeeds => {
            for feed in db.list_feeds().await.context("Failed to list feeds")? {
                let counts = db.count_entries(feed.id).await?;
                let state = if !feed.enabled {
                    "disabled".to_string()
                } else if feed.is_quarantined(config.feed.max_consecutive_errors) {
                    format!("quarantined ({} errors)", feed.fetch_error_count)
                } else {
                    "active".to_string()
                };
                println!(
                    "{:>4}  {:<40}  {:>5} entries ({} visible)  {}",
                    feed.id,
                    feed.display_name(),
                    counts.total,
                    counts.visible,
                    state
                );
            }
        }
    }
    Ok(())
}

fn build_scheduler(config: &Config, db: Database) -> Result<Scheduler> {
    let ingestor = Ingestor::new(db, config).context("Failed to create HTTP client")?;
    Ok(Scheduler::new(Arc::new(ingestor), &config.scheduler))
}

fn print_report(report: &CycleReport) {
    match &report.status {
        CycleStatus::Completed => println!(
            "feed {}: {} fetched, {} stored, {} duplicates, {} filtered, {} dropped",
            report.feed_id,
            report.fetched,
            report.stored,
            report.duplicates,
            report.filtered,
            report.dropped
        ),
        CycleStatus::NotModified => println!("feed {}: not modified", report.feed_id),
        CycleStatus::Failed(error) => println!("feed {}: failed: {error}", report.feed_id),
        CycleStatus::Skipped(reason) => println!("feed {}: skipped ({reason})", report.feed_id),
    }
}
