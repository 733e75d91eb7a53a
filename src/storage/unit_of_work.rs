use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::sync::OwnedMutexGuard;

use super::schema::Database;
use super::types::DatabaseError;

/// A write transaction holding the process-wide write lock.
///
/// Nothing is persisted until [`commit`](Self::commit). Dropping the unit of
/// work without committing (early return, `?`, or a panic unwinding through
/// the owner) rolls the transaction back and releases the lock.
pub struct UnitOfWork {
    // Field order matters: the transaction is rolled back before the lock is released.
    tx: Transaction<'static, Sqlite>,
    _write_guard: OwnedMutexGuard<()>,
}

impl Database {
    /// Start a unit of work, waiting for any other writer in this process.
    pub async fn begin(&self) -> Result<UnitOfWork, DatabaseError> {
        let guard = self.write_lock.clone().lock_owned().await;
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(UnitOfWork {
            tx,
            _write_guard: guard,
        })
    }
}

impl UnitOfWork {
    pub async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await.map_err(DatabaseError::from_sqlx)
    }

    /// Roll back explicitly. Equivalent to dropping, but reports errors.
    pub async fn rollback(self) -> Result<(), DatabaseError> {
        self.tx.rollback().await.map_err(DatabaseError::from_sqlx)
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }
}
