//! End-to-end tests for one ingestion cycle: fetch, normalize, dedup, filter, persist.
//!
//! Each test runs against a wiremock server and its own in-memory database.

use feedloom::config::Config;
use feedloom::feed::{EntryParser, Fetcher, RawEntry};
use feedloom::pipeline::{CycleStatus, Ingestor};
use feedloom::storage::{Database, MatchType, NewFeed, NewFilterRule, RuleType};
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const THREE_ENTRY_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Mixed Feed</title>
    <item>
        <title>Rust 1.80 released</title>
        <link>https://example.com/rust-180</link>
        <description>Lots of improvements to the compiler.</description>
    </item>
    <item>
        <title>A story we already have</title>
        <link>HTTPS://Example.com/seed/?utm_source=rss</link>
        <description>Seen before.</description>
    </item>
    <item>
        <title>Sponsored: buy our course</title>
        <link>https://example.com/ad</link>
        <description>Limited offer.</description>
    </item>
</channel></rss>"#;

fn config(retain_filtered: bool) -> Config {
    let mut config = Config::default();
    config.fetcher.retry_backoff_ms = 1;
    config.fetcher.max_retries = 0;
    config.filter.retain_filtered = retain_filtered;
    config
}

async fn serve(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .mount(&server)
        .await;
    server
}

/// A feed with one stored entry and a top-priority exclude rule for "sponsored".
async fn seeded(config: &Config, url: String) -> (Ingestor, i64) {
    let db = Database::open(":memory:").await.unwrap();
    let feed = db.insert_feed(&NewFeed::new(url)).await.unwrap();

    let parser = EntryParser::new(&config.parser);
    let seed = parser
        .normalize(RawEntry {
            title: Some("Seed entry".to_string()),
            link: Some("https://example.com/seed".to_string()),
            ..Default::default()
        })
        .unwrap();
    db.create_entry(feed.id, &seed, true, 1).await.unwrap().unwrap();

    db.create_filter_rule(&NewFilterRule {
        name: "low priority exclude".to_string(),
        rule_type: RuleType::Keyword,
        match_type: MatchType::Exclude,
        pattern: "never-present-token".to_string(),
        priority: 1,
        enabled: true,
    })
    .await
    .unwrap();
    db.create_filter_rule(&NewFilterRule {
        name: "no ads".to_string(),
        rule_type: RuleType::Keyword,
        match_type: MatchType::Exclude,
        pattern: "Sponsored".to_string(),
        priority: 100,
        enabled: true,
    })
    .await
    .unwrap();

    (Ingestor::new(db, config).unwrap(), feed.id)
}

#[tokio::test]
async fn test_three_entries_with_filtered_entry_retained() {
    let server = serve(THREE_ENTRY_RSS).await;
    let config = config(true);
    let (ingestor, feed_id) = seeded(&config, format!("{}/rss", server.uri())).await;

    let report = ingestor.run_cycle(feed_id, false).await;
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.filtered, 1);
    assert_eq!(report.stored, 2);

    let entries = ingestor.store().get_entries_for_feed(feed_id, None).await.unwrap();
    let mut by_link: Vec<(String, bool)> = entries
        .iter()
        .map(|e| (e.link.clone(), e.enabled))
        .collect();
    by_link.sort();
    assert_eq!(
        by_link,
        vec![
            ("https://example.com/ad".to_string(), false),
            ("https://example.com/rust-180".to_string(), true),
            ("https://example.com/seed".to_string(), true),
        ]
    );

    let counts = ingestor.store().count_entries(feed_id).await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.visible, 2);
}

#[tokio::test]
async fn test_three_entries_with_filtered_entry_dropped() {
    let server = serve(THREE_ENTRY_RSS).await;
    let config = config(false);
    let (ingestor, feed_id) = seeded(&config, format!("{}/rss", server.uri())).await;

    let report = ingestor.run_cycle(feed_id, false).await;
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.filtered, 1);
    assert_eq!(report.stored, 1);

    let entries = ingestor.store().get_entries_for_feed(feed_id, None).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.enabled));
    assert!(entries.iter().any(|e| e.link == "https://example.com/rust-180"));
    assert!(!entries.iter().any(|e| e.link == "https://example.com/ad"));
}

#[tokio::test]
async fn test_unchanged_feed_second_fetch_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("If-None-Match", "\"rev-1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(THREE_ENTRY_RSS)
                .insert_header("ETag", "\"rev-1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = config(true);
    let db = Database::open(":memory:").await.unwrap();
    let feed = db
        .insert_feed(&NewFeed::new(format!("{}/rss", server.uri())))
        .await
        .unwrap();
    let ingestor = Ingestor::new(db.clone(), &config).unwrap();

    let first = ingestor.run_cycle(feed.id, false).await;
    assert_eq!(first.status, CycleStatus::Completed);
    let stored = db.get_feed(feed.id).await.unwrap();
    assert_eq!(stored.etag.as_deref(), Some("\"rev-1\""));

    let fetcher = Fetcher::new(&config.fetcher).unwrap();
    let again = fetcher.fetch_feed(&stored).await;
    assert!(again.success());
    assert!(again.not_modified);
    assert_eq!(again.entries_count, 0);

    let second = ingestor.run_cycle(feed.id, false).await;
    assert_eq!(second.status, CycleStatus::NotModified);
    assert_eq!(second.stored, 0);
    assert_eq!(
        db.get_feed(feed.id).await.unwrap().etag.as_deref(),
        Some("\"rev-1\"")
    );
}

#[tokio::test]
async fn test_same_link_in_another_feed_is_not_stored_twice() {
    let server = serve(THREE_ENTRY_RSS).await;
    let config = config(true);
    let db = Database::open(":memory:").await.unwrap();
    let first = db
        .insert_feed(&NewFeed::new(format!("{}/a", server.uri())))
        .await
        .unwrap();
    let second = db
        .insert_feed(&NewFeed::new(format!("{}/b", server.uri())))
        .await
        .unwrap();
    let ingestor = Ingestor::new(db.clone(), &config).unwrap();

    let report = ingestor.run_cycle(first.id, false).await;
    assert_eq!(report.stored, 3);

    // Per-feed dedup passes, the unique link constraint catches them
    let report = ingestor.run_cycle(second.id, false).await;
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.stored, 0);
    assert_eq!(report.duplicates, 3);
    assert_eq!(db.count_entries(second.id).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_failed_cycle_leaves_no_entries_and_records_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>not a feed</body></html>"))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let feed = db
        .insert_feed(&NewFeed::new(format!("{}/rss", server.uri())))
        .await
        .unwrap();
    let ingestor = Ingestor::new(db.clone(), &config(true)).unwrap();

    let report = ingestor.run_cycle(feed.id, false).await;
    assert!(report.is_failure());

    let feed = db.get_feed(feed.id).await.unwrap();
    assert_eq!(feed.fetch_error_count, 1);
    assert!(feed.last_error.unwrap().starts_with("Decode error"));
    assert!(feed.last_error_at.is_some());
    assert_eq!(db.count_entries(feed.id).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_success_resets_error_streak() {
    let server = serve(THREE_ENTRY_RSS).await;
    let db = Database::open(":memory:").await.unwrap();
    let feed = db
        .insert_feed(&NewFeed::new(format!("{}/rss", server.uri())))
        .await
        .unwrap();
    db.update_fetch_info(
        feed.id,
        &feedloom::storage::FetchInfoUpdate::failure(1, "earlier outage"),
    )
    .await
    .unwrap();

    let ingestor = Ingestor::new(db.clone(), &config(true)).unwrap();
    let report = ingestor.run_cycle(feed.id, false).await;
    assert_eq!(report.status, CycleStatus::Completed);

    let feed = db.get_feed(feed.id).await.unwrap();
    assert_eq!(feed.fetch_error_count, 0);
    assert_eq!(feed.last_error, None);
    assert_eq!(feed.name.as_deref(), Some("Mixed Feed"));
    assert_eq!(ingestor.deduplicator().stats().checks, 3);
}
