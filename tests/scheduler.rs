//! Scheduler integration tests: dispatch, per-feed single flight, worker
//! limits, shutdown and job bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use feedloom::config::Config;
use feedloom::pipeline::{CycleStatus, Ingestor};
use feedloom::scheduler::{RunOutcome, Scheduler};
use feedloom::storage::{Database, FetchInfoUpdate, NewFeed};
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Scheduled Feed</title>
    <item><title>First</title><link>https://example.com/first</link></item>
    <item><title>Second</title><link>https://example.com/second</link></item>
</channel></rss>"#;

fn config(max_workers: usize) -> Config {
    let mut config = Config::default();
    config.fetcher.max_retries = 0;
    config.fetcher.retry_backoff_ms = 1;
    config.feed.max_consecutive_errors = 3;
    config.scheduler.max_workers = max_workers;
    config.scheduler.tick_interval_ms = 10;
    config.scheduler.min_interval_minutes = 5;
    config
}

async fn scheduler(config: &Config) -> (Scheduler, Database) {
    let db = Database::open(":memory:").await.unwrap();
    let ingestor = Ingestor::new(db.clone(), config).unwrap();
    (Scheduler::new(Arc::new(ingestor), &config.scheduler), db)
}

async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_job_id_names_feed() {
    let (scheduler, _db) = scheduler(&config(2)).await;
    let job = scheduler.add_feed_job(7, 60);
    assert_eq!(job.to_string(), "feed_7");
    assert_eq!(job.feed_id(), 7);
    assert_eq!(scheduler.job_count(), 1);

    assert!(scheduler.remove_feed_job(&job));
    assert!(!scheduler.trigger(&job));
    assert_eq!(scheduler.job_count(), 0);
}

#[tokio::test]
async fn test_busy_feed_is_never_run_twice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(RSS)
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (scheduler, db) = scheduler(&config(4)).await;
    let feed = db
        .insert_feed(&NewFeed::new(format!("{}/slow", server.uri())))
        .await
        .unwrap();
    let job = scheduler.add_feed_job(feed.id, 60);

    assert_eq!(scheduler.tick(), 1);

    // Re-triggered while the first cycle is still fetching
    assert!(scheduler.trigger(&job));
    assert_eq!(scheduler.tick(), 0);
    assert_eq!(
        scheduler.run_now(feed.id, true).await,
        RunOutcome::AlreadyRunning
    );

    scheduler.stop(true).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(db.count_entries(feed.id).await.unwrap().total, 2);
}

#[tokio::test]
async fn test_malformed_feed_does_not_affect_next_feed() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/broken",
        ResponseTemplate::new(200).set_body_string("<html><body>not a feed</body></html>"),
    )
    .await;
    mount(&server, "/good", ResponseTemplate::new(200).set_body_string(RSS)).await;

    let (scheduler, db) = scheduler(&config(4)).await;
    let broken = db
        .insert_feed(&NewFeed::new(format!("{}/broken", server.uri())))
        .await
        .unwrap();
    let good = db
        .insert_feed(&NewFeed::new(format!("{}/good", server.uri())))
        .await
        .unwrap();
    scheduler.add_feed_job(broken.id, 60);
    scheduler.add_feed_job(good.id, 60);

    assert_eq!(scheduler.tick(), 2);
    scheduler.stop(true).await;

    let broken = db.get_feed(broken.id).await.unwrap();
    assert_eq!(broken.fetch_error_count, 1);
    assert!(broken.last_error.is_some());
    assert_eq!(db.count_entries(broken.id).await.unwrap().total, 0);

    let good = db.get_feed(good.id).await.unwrap();
    assert_eq!(good.fetch_error_count, 0);
    assert_eq!(db.count_entries(good.id).await.unwrap().total, 2);

    // Both stay registered for their next run
    assert_eq!(scheduler.job_count(), 2);
}

#[tokio::test]
async fn test_worker_limit_defers_extra_jobs() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/a",
        ResponseTemplate::new(200)
            .set_body_string(RSS)
            .set_delay(Duration::from_millis(100)),
    )
    .await;
    mount(&server, "/b", ResponseTemplate::new(200).set_body_string(RSS)).await;

    let (scheduler, db) = scheduler(&config(1)).await;
    let a = db
        .insert_feed(&NewFeed::new(format!("{}/a", server.uri())))
        .await
        .unwrap();
    let b = db
        .insert_feed(&NewFeed::new(format!("{}/b", server.uri())))
        .await
        .unwrap();
    let job_a = scheduler.add_feed_job(a.id, 60);
    let job_b = scheduler.add_feed_job(b.id, 60);

    let before = Instant::now();
    assert_eq!(scheduler.tick(), 1);
    scheduler.stop(true).await;

    // One job ran and moved a full interval out, the other is still due
    let mut due: Vec<Instant> = [job_a, job_b]
        .iter()
        .map(|job| scheduler.next_run(job).unwrap())
        .collect();
    due.sort();
    assert!(due[0] <= before);
    assert!(due[1] >= before + Duration::from_secs(60 * 60));

    // A stopped scheduler dispatches nothing
    assert_eq!(scheduler.tick(), 0);
}

#[tokio::test]
async fn test_interval_clamped_to_minimum() {
    let server = MockServer::start().await;
    mount(&server, "/rss", ResponseTemplate::new(200).set_body_string(RSS)).await;

    let (scheduler, db) = scheduler(&config(2)).await;
    let feed = db
        .insert_feed(&NewFeed::new(format!("{}/rss", server.uri())))
        .await
        .unwrap();
    let job = scheduler.add_feed_job(feed.id, 1);

    let before = Instant::now();
    match scheduler.run_now(feed.id, false).await {
        RunOutcome::Completed(report) => assert_eq!(report.status, CycleStatus::Completed),
        RunOutcome::AlreadyRunning => panic!("feed was idle"),
    }
    assert!(scheduler.next_run(&job).unwrap() >= before + Duration::from_secs(5 * 60));
}

#[tokio::test]
async fn test_vanished_feed_job_is_dropped() {
    let (scheduler, _db) = scheduler(&config(2)).await;
    scheduler.add_feed_job(999, 60);

    assert_eq!(scheduler.tick(), 1);
    scheduler.stop(true).await;
    assert_eq!(scheduler.job_count(), 0);
}

#[tokio::test]
async fn test_sync_jobs_skips_quarantined_and_disabled() {
    let config = config(2);
    let (scheduler, db) = scheduler(&config).await;
    db.insert_feed(&NewFeed::new("https://a.example/rss"))
        .await
        .unwrap();
    let disabled = db
        .insert_feed(&NewFeed::new("https://b.example/rss"))
        .await
        .unwrap();
    let quarantined = db
        .insert_feed(&NewFeed::new("https://c.example/rss"))
        .await
        .unwrap();
    db.disable_feed(disabled.id).await.unwrap();
    for _ in 0..config.feed.max_consecutive_errors {
        db.update_fetch_info(quarantined.id, &FetchInfoUpdate::failure(1, "timeout"))
            .await
            .unwrap();
    }

    assert_eq!(scheduler.sync_jobs(100).await.unwrap(), 1);
    assert_eq!(scheduler.sync_jobs(100).await.unwrap(), 0);
    assert_eq!(scheduler.job_count(), 1);

    db.reset_feed_errors(quarantined.id).await.unwrap();
    assert_eq!(scheduler.sync_jobs(100).await.unwrap(), 1);
    assert_eq!(scheduler.job_count(), 2);
}

#[tokio::test]
async fn test_dispatch_loop_runs_due_feeds_until_stopped() {
    let server = MockServer::start().await;
    mount(&server, "/rss", ResponseTemplate::new(200).set_body_string(RSS)).await;

    let (scheduler, db) = scheduler(&config(2)).await;
    let feed = db
        .insert_feed(&NewFeed::new(format!("{}/rss", server.uri())))
        .await
        .unwrap();
    assert_eq!(scheduler.sync_jobs(10).await.unwrap(), 1);

    scheduler.start();
    let deadline = Instant::now() + Duration::from_secs(5);
    while db.count_entries(feed.id).await.unwrap().total < 2 {
        assert!(Instant::now() < deadline, "feed was never fetched");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.stop(true).await;

    // Next run is an hour out, so the loop fetched exactly once
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
