use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedDbRow, FetchInfoUpdate, NewFeed, FEED_COLUMNS};
use super::unit_of_work::UnitOfWork;

// ============================================================================
// Shared statements
// ============================================================================

async fn select_feed(conn: &mut SqliteConnection, feed_id: i64) -> Result<Feed, DatabaseError> {
    let row: Option<FeedDbRow> =
        sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
            .bind(feed_id)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(FeedDbRow::into_feed)
        .ok_or(DatabaseError::NotFound(feed_id))
}

async fn apply_fetch_info(
    conn: &mut SqliteConnection,
    feed_id: i64,
    update: &FetchInfoUpdate,
    now: i64,
) -> Result<Feed, DatabaseError> {
    // reset_errors wins over increment_error; validators only overwrite when present
    let row: Option<FeedDbRow> = sqlx::query_as(&format!(
        r#"
        UPDATE feeds SET
            last_fetched_at = COALESCE(?1, last_fetched_at),
            fetch_error_count = CASE
                WHEN ?2 THEN 0
                WHEN ?3 THEN fetch_error_count + 1
                ELSE fetch_error_count END,
            last_error = CASE WHEN ?2 THEN NULL WHEN ?3 THEN ?4 ELSE last_error END,
            last_error_at = CASE WHEN ?2 THEN NULL WHEN ?3 THEN ?7 ELSE last_error_at END,
            etag = COALESCE(NULLIF(?5, ''), etag),
            last_modified = COALESCE(NULLIF(?6, ''), last_modified),
            updated_at = ?7
        WHERE id = ?8
        RETURNING {FEED_COLUMNS}
        "#
    ))
    .bind(update.last_fetched_at)
    .bind(update.reset_errors)
    .bind(update.increment_error)
    .bind(update.last_error.as_deref())
    .bind(update.etag.as_deref())
    .bind(update.last_modified.as_deref())
    .bind(now)
    .bind(feed_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(FeedDbRow::into_feed)
        .ok_or(DatabaseError::NotFound(feed_id))
}

async fn set_enabled(
    conn: &mut SqliteConnection,
    feed_id: i64,
    enabled: bool,
) -> Result<(), DatabaseError> {
    let result = sqlx::query("UPDATE feeds SET enabled = ?, updated_at = ? WHERE id = ?")
        .bind(enabled)
        .bind(chrono::Utc::now().timestamp())
        .bind(feed_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound(feed_id));
    }
    Ok(())
}

// ============================================================================
// Feed Operations
// ============================================================================

impl Database {
    /// Subscribe to a feed. Re-adding a known URL updates its settings and
    /// returns the existing row.
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<Feed, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut uow = self.begin().await?;

        let row: FeedDbRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO feeds (url, name, fetch_interval_minutes, max_entries_per_fetch, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                name = COALESCE(excluded.name, feeds.name),
                fetch_interval_minutes = excluded.fetch_interval_minutes,
                max_entries_per_fetch = excluded.max_entries_per_fetch,
                updated_at = excluded.updated_at
            RETURNING {FEED_COLUMNS}
            "#
        ))
        .bind(feed.url.trim())
        .bind(feed.name.as_deref())
        .bind(i64::from(feed.fetch_interval_minutes))
        .bind(i64::from(feed.max_entries_per_fetch))
        .bind(now)
        .bind(now)
        .fetch_one(uow.conn())
        .await?;

        uow.commit().await?;
        Ok(row.into_feed())
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Feed, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        select_feed(&mut conn, feed_id).await
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Enabled feeds below the error ceiling, least recently fetched first.
    ///
    /// Feeds that were never fetched sort before everything else. Feeds whose
    /// `fetch_error_count` has reached `max_consecutive_errors` are
    /// quarantined and left out until their errors are reset.
    pub async fn get_feeds_to_fetch(
        &self,
        max_feeds: usize,
        max_consecutive_errors: u32,
    ) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            r#"
            SELECT {FEED_COLUMNS} FROM feeds
            WHERE enabled = 1 AND fetch_error_count < ?
            ORDER BY last_fetched_at IS NOT NULL, last_fetched_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(i64::from(max_consecutive_errors))
        .bind(i64::try_from(max_feeds).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Apply a fetch outcome in its own unit of work.
    pub async fn update_fetch_info(
        &self,
        feed_id: i64,
        update: &FetchInfoUpdate,
    ) -> Result<Feed, DatabaseError> {
        let mut uow = self.begin().await?;
        let feed = uow.update_fetch_info(feed_id, update).await?;
        uow.commit().await?;
        Ok(feed)
    }

    pub async fn enable_feed(&self, feed_id: i64) -> Result<(), DatabaseError> {
        let mut uow = self.begin().await?;
        set_enabled(uow.conn(), feed_id, true).await?;
        uow.commit().await
    }

    pub async fn disable_feed(&self, feed_id: i64) -> Result<(), DatabaseError> {
        let mut uow = self.begin().await?;
        uow.disable_feed(feed_id).await?;
        uow.commit().await
    }

    /// Clear the error streak, lifting quarantine.
    pub async fn reset_feed_errors(&self, feed_id: i64) -> Result<Feed, DatabaseError> {
        let update = FetchInfoUpdate {
            reset_errors: true,
            ..FetchInfoUpdate::default()
        };
        self.update_fetch_info(feed_id, &update).await
    }
}

impl UnitOfWork {
    pub async fn get_feed(&mut self, feed_id: i64) -> Result<Feed, DatabaseError> {
        select_feed(self.conn(), feed_id).await
    }

    pub async fn update_fetch_info(
        &mut self,
        feed_id: i64,
        update: &FetchInfoUpdate,
    ) -> Result<Feed, DatabaseError> {
        apply_fetch_info(self.conn(), feed_id, update, chrono::Utc::now().timestamp()).await
    }

    /// Fill `name`/`description` from the feed document where they are still empty.
    pub async fn update_feed_info(
        &mut self,
        feed_id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE feeds SET
                name = COALESCE(NULLIF(name, ''), NULLIF(?, '')),
                description = COALESCE(NULLIF(description, ''), NULLIF(?, ''))
            WHERE id = ?
            "#,
        )
        .bind(name.map(str::trim))
        .bind(description.map(str::trim))
        .bind(feed_id)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn disable_feed(&mut self, feed_id: i64) -> Result<(), DatabaseError> {
        set_enabled(self.conn(), feed_id, false).await
    }
}
