//! # Consumption Repository
//!
//! Database operations for consumption records.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Consumption Record Lifecycle                          │
//! │                                                                         │
//! │  1. CREATE (once, by the dispense controller)                          │
//! │     └── save() → ConsumptionRecord { sync_status: Pending }            │
//! │                                                                         │
//! │  2. RECONCILE (only the sync service touches the row again)            │
//! │     └── mark_synced()      → Synced  + sync_log row (same tx)          │
//! │     └── mark_sync_failed() → Failed  + sync_log row (same tx)          │
//! │                                                                         │
//! │  3. NEVER DELETED - this table is the audit trail                      │
//! │                                                                         │
//! │  UNIQUE(sale_id) guarantees one record per sale no matter how many     │
//! │  times an authorize is retried.                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use kegflow_core::{ConsumptionRecord, OutcomeStatus, StoreStats, SyncState};

// =============================================================================
// Insert Parameters
// =============================================================================

/// Everything the dispense controller knows when an attempt finishes.
///
/// The repository fills in id, duration, sync defaults, and created_at.
#[derive(Debug, Clone)]
pub struct NewConsumption {
    pub sale_id: String,
    pub token_id: Option<String>,
    pub beverage_id: String,
    pub tap_id: i64,
    pub volume_authorized_ml: i64,
    pub volume_dispensed_ml: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pulse_count: i64,
    pub flow_rate_avg: f64,
    pub status: OutcomeStatus,
    pub error_message: Option<String>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for consumption record operations.
#[derive(Debug, Clone)]
pub struct ConsumptionRepository {
    pool: SqlitePool,
}

impl ConsumptionRepository {
    /// Creates a new ConsumptionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ConsumptionRepository { pool }
    }

    /// Persists a finished dispense attempt.
    ///
    /// ## Errors
    /// `DbError::UniqueViolation` when a record for the same `sale_id`
    /// already exists - the double-accounting guard.
    pub async fn save(&self, new: NewConsumption) -> DbResult<ConsumptionRecord> {
        let now = Utc::now();
        let record = ConsumptionRecord {
            id: Uuid::new_v4().to_string(),
            sale_id: new.sale_id,
            token_id: new.token_id,
            beverage_id: new.beverage_id,
            tap_id: new.tap_id,
            volume_authorized_ml: new.volume_authorized_ml,
            volume_dispensed_ml: new.volume_dispensed_ml,
            started_at: new.started_at,
            finished_at: new.finished_at,
            duration_seconds: (new.finished_at - new.started_at).num_milliseconds() as f64
                / 1000.0,
            pulse_count: new.pulse_count,
            flow_rate_avg: new.flow_rate_avg,
            status: new.status,
            sync_status: SyncState::Pending,
            sync_attempts: 0,
            last_sync_attempt: None,
            error_message: new.error_message,
            created_at: now,
        };

        debug!(
            id = %record.id,
            sale_id = %record.sale_id,
            status = %record.status,
            volume_ml = record.volume_dispensed_ml,
            "Saving consumption record"
        );

        sqlx::query(
            r#"
            INSERT INTO consumptions (
                id, sale_id, token_id, beverage_id, tap_id,
                volume_authorized_ml, volume_dispensed_ml,
                started_at, finished_at, duration_seconds,
                pulse_count, flow_rate_avg, status,
                sync_status, sync_attempts, last_sync_attempt,
                error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.sale_id)
        .bind(&record.token_id)
        .bind(&record.beverage_id)
        .bind(record.tap_id)
        .bind(record.volume_authorized_ml)
        .bind(record.volume_dispensed_ml)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_seconds)
        .bind(record.pulse_count)
        .bind(record.flow_rate_avg)
        .bind(record.status)
        .bind(record.sync_status)
        .bind(record.sync_attempts)
        .bind(record.last_sync_attempt)
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// Gets a record by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<ConsumptionRecord>> {
        let record = sqlx::query_as::<_, ConsumptionRecord>(
            "SELECT * FROM consumptions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Gets a record by sale ID.
    pub async fn get_by_sale(&self, sale_id: &str) -> DbResult<Option<ConsumptionRecord>> {
        let record = sqlx::query_as::<_, ConsumptionRecord>(
            "SELECT * FROM consumptions WHERE sale_id = ?",
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Gets records pending sync, oldest first.
    pub async fn get_pending(&self, limit: u32) -> DbResult<Vec<ConsumptionRecord>> {
        let records = sqlx::query_as::<_, ConsumptionRecord>(
            r#"
            SELECT * FROM consumptions
            WHERE sync_status = 'pending'
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Gets failed records that have not exhausted their retry budget.
    pub async fn get_failed(&self, max_attempts: i64) -> DbResult<Vec<ConsumptionRecord>> {
        let records = sqlx::query_as::<_, ConsumptionRecord>(
            r#"
            SELECT * FROM consumptions
            WHERE sync_status = 'failed' AND sync_attempts < ?
            ORDER BY last_sync_attempt ASC
            LIMIT 20
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Marks a record as synced and logs the attempt.
    ///
    /// Both writes happen in one transaction so the audit log can never
    /// disagree with the record's sync state.
    pub async fn mark_synced(
        &self,
        id: &str,
        response_code: i64,
        response_body: Option<&str>,
    ) -> DbResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE consumptions
            SET sync_status = 'synced',
                sync_attempts = sync_attempts + 1,
                last_sync_attempt = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sync_log (consumption_id, attempted_at, success, response_code, response_body)
            VALUES (?, ?, 1, ?, ?)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(response_code)
        .bind(response_body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(id = %id, code = response_code, "Marked record synced");
        Ok(())
    }

    /// Marks a sync attempt as failed and logs it.
    pub async fn mark_sync_failed(
        &self,
        id: &str,
        error_message: &str,
        response_code: Option<i64>,
    ) -> DbResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE consumptions
            SET sync_status = 'failed',
                sync_attempts = sync_attempts + 1,
                last_sync_attempt = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(error_message)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sync_log (consumption_id, attempted_at, success, response_code, error_message)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(response_code)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(id = %id, error = %error_message, "Marked sync attempt failed");
        Ok(())
    }

    /// Aggregate counters for operator attention and the status surface.
    pub async fn stats(&self) -> DbResult<StoreStats> {
        let row: (i64, i64, i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'synced' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(volume_dispensed_ml), 0.0)
            FROM consumptions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total: row.0,
            pending: row.1,
            synced: row.2,
            failed: row.3,
            total_volume_ml: row.4,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
