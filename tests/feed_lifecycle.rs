//! Integration tests for the feed lifecycle: subscribe, fetch bookkeeping,
//! quarantine, reset, enable/disable.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use feedloom::config::ParserConfig;
use feedloom::feed::{EntryDraft, EntryParser, RawEntry};
use feedloom::storage::{Database, FetchInfoUpdate, NewFeed};
use pretty_assertions::assert_eq;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn draft(title: &str, link: &str) -> EntryDraft {
    EntryParser::new(&ParserConfig::default())
        .normalize(RawEntry {
            title: Some(title.to_string()),
            link: Some(link.to_string()),
            summary: Some("Test summary".to_string()),
            ..Default::default()
        })
        .unwrap()
}

// ============================================================================
// Subscribe Tests
// ============================================================================

#[tokio::test]
async fn test_subscribe_feed_appears_in_list() {
    let db = test_db().await;

    let feed = db
        .insert_feed(&NewFeed::new("https://example.com/feed.xml"))
        .await
        .unwrap();
    assert!(feed.id > 0);
    assert!(feed.enabled);
    assert_eq!(feed.fetch_error_count, 0);
    assert_eq!(feed.last_fetched_at, None);

    let feeds = db.list_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0], feed);
    assert_eq!(feeds[0].display_name(), "https://example.com/feed.xml");
}

#[tokio::test]
async fn test_subscribe_duplicate_url_updates_settings() {
    let db = test_db().await;

    let first = db
        .insert_feed(&NewFeed {
            name: Some("Old Name".to_string()),
            ..NewFeed::new("https://example.com/feed.xml")
        })
        .await
        .unwrap();
    let second = db
        .insert_feed(&NewFeed {
            fetch_interval_minutes: 15,
            ..NewFeed::new("https://example.com/feed.xml")
        })
        .await
        .unwrap();

    // Same row (ON CONFLICT DO UPDATE), name kept when not given
    assert_eq!(first.id, second.id);
    assert_eq!(second.name.as_deref(), Some("Old Name"));
    assert_eq!(second.fetch_interval_minutes, 15);
    assert_eq!(db.list_feeds().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_missing_feed_is_not_found() {
    let db = test_db().await;
    let err = db.get_feed(42).await.unwrap_err();
    assert_eq!(err.to_string(), "Feed 42 not found");
}

// ============================================================================
// Fetch Selection Tests
// ============================================================================

#[tokio::test]
async fn test_feeds_to_fetch_never_fetched_first() {
    let db = test_db().await;
    let a = db.insert_feed(&NewFeed::new("https://a.example/rss")).await.unwrap();
    let b = db.insert_feed(&NewFeed::new("https://b.example/rss")).await.unwrap();
    let c = db.insert_feed(&NewFeed::new("https://c.example/rss")).await.unwrap();

    db.update_fetch_info(a.id, &FetchInfoUpdate::success(2_000, None, None))
        .await
        .unwrap();
    db.update_fetch_info(b.id, &FetchInfoUpdate::success(1_000, None, None))
        .await
        .unwrap();

    let ids: Vec<i64> = db
        .get_feeds_to_fetch(10, 5)
        .await
        .unwrap()
        .iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec![c.id, b.id, a.id]);

    assert_eq!(db.get_feeds_to_fetch(1, 5).await.unwrap()[0].id, c.id);
}

#[tokio::test]
async fn test_one_more_failure_quarantines_feed() {
    let db = test_db().await;
    let feed = db.insert_feed(&NewFeed::new("https://example.com/rss")).await.unwrap();
    let max_errors = 3;

    for _ in 0..max_errors - 1 {
        db.update_fetch_info(feed.id, &FetchInfoUpdate::failure(100, "timeout"))
            .await
            .unwrap();
    }
    assert_eq!(db.get_feeds_to_fetch(10, max_errors).await.unwrap().len(), 1);

    let updated = db
        .update_fetch_info(feed.id, &FetchInfoUpdate::failure(200, "HTTP error: status 500"))
        .await
        .unwrap();
    assert_eq!(updated.fetch_error_count, max_errors);
    assert!(updated.is_quarantined(max_errors));
    assert_eq!(updated.last_error.as_deref(), Some("HTTP error: status 500"));
    assert!(db.get_feeds_to_fetch(10, max_errors).await.unwrap().is_empty());

    // Reset lifts the quarantine
    let reset = db.reset_feed_errors(feed.id).await.unwrap();
    assert_eq!(reset.fetch_error_count, 0);
    assert_eq!(reset.last_error, None);
    assert_eq!(reset.last_error_at, None);
    assert_eq!(db.get_feeds_to_fetch(10, max_errors).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_success_keeps_validators_when_absent() {
    let db = test_db().await;
    let feed = db.insert_feed(&NewFeed::new("https://example.com/rss")).await.unwrap();

    db.update_fetch_info(
        feed.id,
        &FetchInfoUpdate::success(
            100,
            Some("\"v1\"".to_string()),
            Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        ),
    )
    .await
    .unwrap();
    let updated = db
        .update_fetch_info(feed.id, &FetchInfoUpdate::success(200, None, None))
        .await
        .unwrap();

    assert_eq!(updated.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        updated.last_modified.as_deref(),
        Some("Mon, 01 Jan 2024 00:00:00 GMT")
    );
    assert_eq!(updated.last_fetched_at, Some(200));
}

#[tokio::test]
async fn test_disabled_feed_not_fetched_until_enabled() {
    let db = test_db().await;
    let feed = db.insert_feed(&NewFeed::new("https://example.com/rss")).await.unwrap();

    db.disable_feed(feed.id).await.unwrap();
    assert!(!db.get_feed(feed.id).await.unwrap().enabled);
    assert!(db.get_feeds_to_fetch(10, 5).await.unwrap().is_empty());

    db.enable_feed(feed.id).await.unwrap();
    assert_eq!(db.get_feeds_to_fetch(10, 5).await.unwrap().len(), 1);

    assert!(db.enable_feed(999).await.is_err());
}

// ============================================================================
// Entry Tests
// ============================================================================

#[tokio::test]
async fn test_entries_stored_with_hashes_and_counts() {
    let db = test_db().await;
    let feed = db.insert_feed(&NewFeed::new("https://example.com/rss")).await.unwrap();

    let first = draft("First post", "https://example.com/1");
    let entry = db
        .create_entry(feed.id, &first, true, 1_700_000_000)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.feed_id, feed.id);
    assert_eq!(entry.link_hash, first.link_hash);
    assert_eq!(entry.title_hash, first.title_hash);
    assert_eq!(entry.fetched_at, 1_700_000_000);

    db.create_entry(feed.id, &draft("Hidden post", "https://example.com/2"), false, 1)
        .await
        .unwrap()
        .unwrap();

    let counts = db.count_entries(feed.id).await.unwrap();
    assert_eq!(counts.total, 2);
    assert_eq!(counts.visible, 1);
    assert_eq!(db.get_entries_for_feed(feed.id, Some(1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_link_in_two_feeds_stored_once() {
    let db = test_db().await;
    let a = db.insert_feed(&NewFeed::new("https://a.example/rss")).await.unwrap();
    let b = db.insert_feed(&NewFeed::new("https://b.example/rss")).await.unwrap();

    let entry = draft("Shared story", "https://news.example/story");
    assert!(db.create_entry(a.id, &entry, true, 1).await.unwrap().is_some());
    assert!(db.create_entry(b.id, &entry, true, 1).await.unwrap().is_none());

    assert_eq!(db.count_entries(a.id).await.unwrap().total, 1);
    assert_eq!(db.count_entries(b.id).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_rolled_back_unit_of_work_leaves_nothing() {
    let db = test_db().await;
    let feed = db.insert_feed(&NewFeed::new("https://example.com/rss")).await.unwrap();

    let mut uow = db.begin().await.unwrap();
    uow.create_entry(feed.id, &draft("Never kept", "https://example.com/x"), true, 1)
        .await
        .unwrap()
        .unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(db.count_entries(feed.id).await.unwrap().total, 0);
}
