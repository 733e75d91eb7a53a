use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed store for feeds, entries and filter rules.
///
/// Reads go straight to the pool. Every write goes through a
/// [`UnitOfWork`](super::UnitOfWork), which holds `write_lock` for its
/// lifetime so SQLite never sees two writers from this process.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// `path` is a file path or `:memory:`. File databases use WAL journaling.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock, `DatabaseError::Migration` if the schema cannot be
    /// created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout: wait up to 5s for another process's lock before SQLITE_BUSY
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        tracing::debug!(path = %path, "Database ready");
        Ok(db)
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables and indexes in one transaction. Idempotent.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                name TEXT,
                description TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                fetch_interval_minutes INTEGER NOT NULL DEFAULT 60,
                max_entries_per_fetch INTEGER NOT NULL DEFAULT 100,
                etag TEXT,
                last_modified TEXT,
                fetch_error_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_at INTEGER,
                last_fetched_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // get_feeds_to_fetch: WHERE enabled AND fetch_error_count < ? ORDER BY last_fetched_at
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_due ON feeds(enabled, fetch_error_count, last_fetched_at)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                author TEXT,
                summary TEXT,
                content TEXT,
                published_at INTEGER,
                tags TEXT NOT NULL DEFAULT '[]',
                language TEXT,
                reading_time_seconds INTEGER NOT NULL DEFAULT 0,
                link_hash TEXT NOT NULL UNIQUE,
                title_hash TEXT NOT NULL,
                content_hash TEXT,
                fetched_at INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Dedup lookups are feed-scoped first, global for the cross-feed variant
        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_title ON entries(feed_id, title_hash)",
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_content ON entries(feed_id, content_hash)",
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_link ON entries(feed_id, link_hash)",
            "CREATE INDEX IF NOT EXISTS idx_entries_title ON entries(title_hash)",
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_published ON entries(feed_id, published_at DESC)",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filter_rules (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                rule_type TEXT NOT NULL CHECK (rule_type IN ('keyword', 'regex', 'tag', 'language')),
                match_type TEXT NOT NULL CHECK (match_type IN ('include', 'exclude')),
                pattern TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_filter_rules_enabled ON filter_rules(enabled, priority DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
