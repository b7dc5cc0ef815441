//! # Used Token Repository
//!
//! Replay-protection ledger. A nonce row is written the moment a token is
//! accepted, so a crash between validation and dispense still leaves the
//! token burned. Rows are purged lazily once past their expiry.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use kegflow_core::UsedToken;

/// Repository for the used-token (nonce) ledger.
#[derive(Debug, Clone)]
pub struct UsedTokenRepository {
    pool: SqlitePool,
}

impl UsedTokenRepository {
    /// Creates a new UsedTokenRepository.
    pub fn new(pool: SqlitePool) -> Self {
        UsedTokenRepository { pool }
    }

    /// Checks whether a nonce has already been consumed.
    pub async fn is_used(&self, nonce: &str) -> DbResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM used_tokens WHERE nonce = ?")
            .bind(nonce)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// Claims a nonce, returning true if this call was the first to do so.
    ///
    /// The primary key on `nonce` makes the claim atomic: when two requests
    /// validate the same token concurrently, exactly one insert lands and
    /// the other observes `false`. This is what commits single-use at
    /// validation time rather than dispense time.
    pub async fn mark_used(&self, nonce: &str, ttl_secs: i64) -> DbResult<bool> {
        let now = Utc::now();
        let expires = now + Duration::seconds(ttl_secs);

        let result = sqlx::query(
            r#"
            INSERT INTO used_tokens (nonce, used_at, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(nonce) DO NOTHING
            "#,
        )
        .bind(nonce)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Loads a ledger entry, mostly for diagnostics.
    pub async fn get(&self, nonce: &str) -> DbResult<Option<UsedToken>> {
        let entry = sqlx::query_as::<_, UsedToken>("SELECT * FROM used_tokens WHERE nonce = ?")
            .bind(nonce)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    /// Removes entries past their expiry. Returns the number deleted.
    pub async fn purge_expired(&self) -> DbResult<u64> {
        let now = Utc::now();

        let result = sqlx::query("DELETE FROM used_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "Purged expired token entries");
        }

        Ok(deleted)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
