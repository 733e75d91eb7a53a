use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;
use super::types::{DatabaseError, Entry, EntryDbRow, ENTRY_COLUMNS};
use super::unit_of_work::UnitOfWork;
use crate::dedup::{EntryLookup, FeedScope};
use crate::feed::EntryDraft;

/// Stored entry totals for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryCounts {
    pub total: i64,
    /// Entries with `enabled = true`.
    pub visible: i64,
}

// ============================================================================
// Shared statements
// ============================================================================

async fn insert_entry(
    conn: &mut SqliteConnection,
    feed_id: i64,
    draft: &EntryDraft,
    enabled: bool,
    fetched_at: i64,
) -> Result<Option<Entry>, DatabaseError> {
    let tags = serde_json::to_string(&draft.tags)
        .map_err(|e| DatabaseError::InvalidValue(format!("entry tags: {e}")))?;

    // link_hash is UNIQUE: a conflict returns no row instead of failing the cycle
    let row: Option<EntryDbRow> = sqlx::query_as(&format!(
        r#"
        INSERT INTO entries (
            feed_id, title, link, author, summary, content, published_at, tags, language,
            reading_time_seconds, link_hash, title_hash, content_hash, fetched_at, enabled
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(link_hash) DO NOTHING
        RETURNING {ENTRY_COLUMNS}
        "#
    ))
    .bind(feed_id)
    .bind(&draft.title)
    .bind(&draft.link)
    .bind(draft.author.as_deref())
    .bind(draft.summary.as_deref())
    .bind(draft.content.as_deref())
    .bind(draft.published_at)
    .bind(tags)
    .bind(draft.language.as_deref())
    .bind(i64::from(draft.reading_time_seconds))
    .bind(&draft.link_hash)
    .bind(&draft.title_hash)
    .bind(draft.content_hash.as_deref())
    .bind(fetched_at)
    .bind(enabled)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(EntryDbRow::into_entry).transpose()
}

/// First stored entry (lowest id) matching every `column = value` pair within `scope`.
async fn find_entry(
    conn: &mut SqliteConnection,
    conditions: &[(&'static str, &str)],
    scope: FeedScope<'_>,
) -> Result<Option<Entry>, DatabaseError> {
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE 1 = 1"));

    for (column, value) in conditions {
        builder.push(format_args!(" AND {column} = "));
        builder.push_bind(*value);
    }

    match scope {
        FeedScope::Feed(feed_id) => {
            builder.push(" AND feed_id = ");
            builder.push_bind(feed_id);
        }
        FeedScope::Any => {}
        FeedScope::Among([]) => return Ok(None),
        FeedScope::Among(feed_ids) => {
            builder.push(" AND feed_id IN (");
            let mut separated = builder.separated(", ");
            for feed_id in feed_ids {
                separated.push_bind(*feed_id);
            }
            separated.push_unseparated(")");
        }
    }
    builder.push(" ORDER BY id LIMIT 1");

    let row: Option<EntryDbRow> = builder
        .build_query_as()
        .fetch_optional(&mut *conn)
        .await?;
    row.map(EntryDbRow::into_entry).transpose()
}

// ============================================================================
// Entry Operations
// ============================================================================

impl UnitOfWork {
    /// Persist a draft. Returns `None` when an entry with the same link hash
    /// already exists anywhere.
    pub async fn create_entry(
        &mut self,
        feed_id: i64,
        draft: &EntryDraft,
        enabled: bool,
        fetched_at: i64,
    ) -> Result<Option<Entry>, DatabaseError> {
        insert_entry(self.conn(), feed_id, draft, enabled, fetched_at).await
    }
}

impl Database {
    /// [`UnitOfWork::create_entry`] in its own unit of work.
    pub async fn create_entry(
        &self,
        feed_id: i64,
        draft: &EntryDraft,
        enabled: bool,
        fetched_at: i64,
    ) -> Result<Option<Entry>, DatabaseError> {
        let mut uow = self.begin().await?;
        let entry = uow.create_entry(feed_id, draft, enabled, fetched_at).await?;
        uow.commit().await?;
        Ok(entry)
    }

    /// Entries for a feed, newest first. Filtered entries are included.
    pub async fn get_entries_for_feed(
        &self,
        feed_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let rows: Vec<EntryDbRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM entries
            WHERE feed_id = ?
            ORDER BY COALESCE(published_at, fetched_at) DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(feed_id)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EntryDbRow::into_entry).collect()
    }

    pub async fn count_entries(&self, feed_id: i64) -> Result<EntryCounts, DatabaseError> {
        let (total, visible): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM entries WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(EntryCounts { total, visible })
    }
}

// ============================================================================
// Dedup lookups
// ============================================================================

impl EntryLookup for UnitOfWork {
    async fn find_by_link_hash(
        &mut self,
        link_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        find_entry(self.conn(), &[("link_hash", link_hash)], scope).await
    }

    async fn find_by_title_hash(
        &mut self,
        title_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        find_entry(self.conn(), &[("title_hash", title_hash)], scope).await
    }

    async fn find_by_content_hash(
        &mut self,
        content_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        find_entry(self.conn(), &[("content_hash", content_hash)], scope).await
    }

    async fn find_by_title_and_content(
        &mut self,
        title_hash: &str,
        content_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        find_entry(
            self.conn(),
            &[("title_hash", title_hash), ("content_hash", content_hash)],
            scope,
        )
        .await
    }
}

/// Read-only lookups straight from the pool, for callers outside a cycle.
impl EntryLookup for Database {
    async fn find_by_link_hash(
        &mut self,
        link_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        find_entry(&mut conn, &[("link_hash", link_hash)], scope).await
    }

    async fn find_by_title_hash(
        &mut self,
        title_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        find_entry(&mut conn, &[("title_hash", title_hash)], scope).await
    }

    async fn find_by_content_hash(
        &mut self,
        content_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        find_entry(&mut conn, &[("content_hash", content_hash)], scope).await
    }

    async fn find_by_title_and_content(
        &mut self,
        title_hash: &str,
        content_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        find_entry(
            &mut conn,
            &[("title_hash", title_hash), ("content_hash", content_hash)],
            scope,
        )
        .await
    }
}
