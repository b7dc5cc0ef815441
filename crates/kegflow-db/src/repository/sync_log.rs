//! # Sync Log Repository
//!
//! Read access to the append-only sync audit log. Writes happen inside the
//! consumption repository's `mark_synced`/`mark_sync_failed` transactions
//! so a log row can never exist without its matching record update.

use sqlx::SqlitePool;

use crate::error::DbResult;
use kegflow_core::SyncLogEntry;

/// Repository for sync audit log reads.
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    /// Creates a new SyncLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    /// All attempts for one consumption record, oldest first.
    pub async fn for_consumption(&self, consumption_id: &str) -> DbResult<Vec<SyncLogEntry>> {
        let entries = sqlx::query_as::<_, SyncLogEntry>(
            r#"
            SELECT * FROM sync_log
            WHERE consumption_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(consumption_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// The most recent attempts across all records, newest first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<SyncLogEntry>> {
        let entries = sqlx::query_as::<_, SyncLogEntry>(
            r#"
            SELECT * FROM sync_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
