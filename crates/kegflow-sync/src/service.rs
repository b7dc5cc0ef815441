//! # Sync Service
//!
//! The background reconciliation loop.
//!
//! ## Cycle Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Sync Cycle                                  │
//! │                                                                         │
//! │  probe health ──► unreachable? ──► count failure, skip to purge        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  sync_pending: POST oldest-first                                       │
//! │       │         3 consecutive failures → abort batch                   │
//! │       ▼         (connectivity, not per-record corruption)              │
//! │  made progress (or nothing pending)?                                   │
//! │       └──► retry_failed: previously failed rows, attempts < cap        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  purge expired used-token entries                                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  sleep: base interval while healthy,                                   │
//! │         min(cap, base * 2^(failures-1)) while failing                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records that exhaust the retry cap stay `failed` forever and are
//! surfaced through `stats()` - deliberately never dropped, never retried
//! into a dead backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use kegflow_core::{ConsumptionRecord, StoreStats};
use kegflow_db::Database;

use crate::client::{PushOutcome, RemoteClient};
use crate::error::{SyncError, SyncResult};

/// Consecutive push failures that abort a batch.
const BATCH_ABORT_THRESHOLD: usize = 3;

/// Stored response bodies are clipped to this many bytes.
const BODY_CLIP: usize = 500;

// =============================================================================
// Configuration
// =============================================================================

/// Sync service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backend base URL, e.g. `https://api.example.com`.
    pub base_url: String,

    /// API key for machine authentication.
    pub api_key: String,

    /// Machine identity reported with every record.
    pub machine_id: String,

    /// Base interval between cycles, seconds.
    pub interval_secs: u64,

    /// Per-request timeout, seconds.
    pub timeout_secs: u64,

    /// Retry budget per record; beyond this a record stays `failed`.
    pub max_retries: i64,

    /// Max pending records fetched per cycle.
    pub batch_limit: u32,

    /// Backoff ceiling, seconds.
    pub max_backoff_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            base_url: "http://localhost:3001".to_string(),
            api_key: String::new(),
            machine_id: String::new(),
            interval_secs: 15,
            timeout_secs: 10,
            max_retries: 3,
            batch_limit: 50,
            max_backoff_secs: 60,
        }
    }
}

impl SyncConfig {
    /// Validates fields the loop cannot run without.
    pub fn validate(&self) -> SyncResult<()> {
        if self.base_url.is_empty() {
            return Err(SyncError::InvalidConfig("base_url is empty".into()));
        }
        if self.machine_id.is_empty() {
            return Err(SyncError::InvalidConfig("machine_id is empty".into()));
        }
        if self.interval_secs == 0 {
            return Err(SyncError::InvalidConfig("interval_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Reports & Status
// =============================================================================

/// Result of one `sync_pending` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    /// Records still pending after the pass (batch limit or early abort).
    pub pending: usize,
}

/// Result of one `retry_failed` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub synced: usize,
    pub failed: usize,
    /// Failed records still within the retry budget.
    pub remaining: usize,
}

/// Result of a blocking `force_sync`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForceReport {
    pub synced: usize,
    pub failed: usize,
    pub pending: usize,
    pub retried: usize,
}

/// Snapshot of the service for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_success: bool,
    pub consecutive_failures: u32,
    pub remote_reachable: bool,
    pub records: StoreStats,
}

#[derive(Debug)]
struct StatusInner {
    running: bool,
    last_sync_time: Option<DateTime<Utc>>,
    last_success: bool,
    consecutive_failures: u32,
    remote_reachable: bool,
}

impl Default for StatusInner {
    fn default() -> Self {
        StatusInner {
            running: false,
            last_sync_time: None,
            last_success: true,
            consecutive_failures: 0,
            remote_reachable: false,
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Inter-cycle delay for a given consecutive-failure count.
///
/// `base` with zero failures, then `min(cap, base * 2^(failures-1))`.
/// The exponent is clamped so the multiplication cannot overflow long
/// before the cap kicks in.
pub fn backoff_delay(base: Duration, cap: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return base;
    }

    let exponent = (consecutive_failures - 1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(cap)
}

// =============================================================================
// Sync Service
// =============================================================================

/// Background reconciliation service.
///
/// Cheap to clone; all clones share state. `start()` spawns the loop,
/// `stop()` shuts it down; the per-pass methods are also callable directly
/// (that is what `force_sync` and the tests do).
#[derive(Clone)]
pub struct SyncService {
    db: Database,
    client: Arc<RemoteClient>,
    config: Arc<SyncConfig>,
    status: Arc<RwLock<StatusInner>>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl SyncService {
    /// Creates a sync service over the given store and configuration.
    pub fn new(db: Database, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let client = RemoteClient::new(
            &config.base_url,
            &config.api_key,
            &config.machine_id,
            Duration::from_secs(config.timeout_secs),
        )?;

        Ok(SyncService {
            db,
            client: Arc::new(client),
            config: Arc::new(config),
            status: Arc::new(RwLock::new(StatusInner::default())),
            shutdown_tx: Arc::new(Mutex::new(None)),
        })
    }

    /// Starts the background loop. No-op if already running.
    pub async fn start(&self) {
        let mut guard = self.shutdown_tx.lock().await;
        if guard.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel(1);
        *guard = Some(tx);
        drop(guard);

        self.status.write().await.running = true;

        let service = self.clone();
        tokio::spawn(service.run_loop(rx));

        info!(interval_secs = self.config.interval_secs, "Sync service started");
    }

    /// Stops the background loop. No-op if not running.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        self.status.write().await.running = false;
        info!("Sync service stopped");
    }

    async fn run_loop(self, mut shutdown_rx: mpsc::Receiver<()>) {
        loop {
            self.run_cycle().await;

            let failures = self.status.read().await.consecutive_failures;
            let delay = backoff_delay(self.config.interval(), self.config.max_backoff(), failures);
            debug!(delay_secs = delay.as_secs_f64(), failures, "Sync loop sleeping");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    debug!("Sync loop received shutdown");
                    break;
                }
            }
        }
    }

    /// One full cycle: probe, push, retry, purge. Public so a caller can
    /// drive the service manually instead of (or while) running the loop.
    pub async fn run_cycle(&self) {
        if !self.client.health().await {
            warn!("Backend unreachable - skipping sync cycle");
            let mut status = self.status.write().await;
            status.remote_reachable = false;
            status.last_success = false;
            status.consecutive_failures += 1;
        } else {
            let mut cycle_clean = true;

            match self.sync_pending().await {
                Ok(report) => {
                    cycle_clean &= report.failed == 0;

                    // Retrying into a batch that made no progress just burns
                    // the retry budget; only follow up when something moved
                    // or the pending queue is drained.
                    if report.synced > 0 || report.pending == 0 {
                        match self.retry_failed().await {
                            Ok(retry) => cycle_clean &= retry.failed == 0,
                            Err(e) => {
                                error!(error = %e, "Retry pass failed");
                                cycle_clean = false;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Sync pass failed");
                    cycle_clean = false;
                }
            }

            let mut status = self.status.write().await;
            status.remote_reachable = true;
            status.last_sync_time = Some(Utc::now());
            status.last_success = cycle_clean;
            if cycle_clean {
                status.consecutive_failures = 0;
            } else {
                status.consecutive_failures += 1;
            }
        }

        // Housekeeping runs whether or not the backend was reachable
        if let Err(e) = self.db.used_tokens().purge_expired().await {
            error!(error = %e, "Token purge failed");
        }
    }

    /// Pushes pending records, oldest first.
    ///
    /// Aborts the batch after three consecutive failures - at that point
    /// the problem is connectivity, and hammering the rest of the queue
    /// would only inflate every record's attempt count.
    pub async fn sync_pending(&self) -> SyncResult<SyncReport> {
        let pending = self
            .db
            .consumptions()
            .get_pending(self.config.batch_limit)
            .await?;

        if pending.is_empty() {
            return Ok(SyncReport::default());
        }

        info!(count = pending.len(), "Syncing pending records");

        let mut synced = 0;
        let mut failed = 0;
        let mut consecutive = 0;

        for record in &pending {
            if self.push_one(record).await? {
                synced += 1;
                consecutive = 0;
            } else {
                failed += 1;
                consecutive += 1;
                if consecutive >= BATCH_ABORT_THRESHOLD {
                    warn!("Multiple consecutive failures - aborting sync batch");
                    break;
                }
            }
        }

        let remaining = self
            .db
            .consumptions()
            .get_pending(self.config.batch_limit)
            .await?
            .len();

        Ok(SyncReport {
            synced,
            failed,
            pending: remaining,
        })
    }

    /// Retries previously failed records within the retry budget.
    pub async fn retry_failed(&self) -> SyncResult<RetryReport> {
        let failed_records = self
            .db
            .consumptions()
            .get_failed(self.config.max_retries)
            .await?;

        if failed_records.is_empty() {
            return Ok(RetryReport::default());
        }

        info!(count = failed_records.len(), "Retrying failed records");

        let mut synced = 0;
        let mut failed = 0;

        for record in &failed_records {
            if self.push_one(record).await? {
                synced += 1;
            } else {
                failed += 1;
            }
        }

        let remaining = self
            .db
            .consumptions()
            .get_failed(self.config.max_retries)
            .await?
            .len();

        Ok(RetryReport {
            synced,
            failed,
            remaining,
        })
    }

    /// Blocking combined pass: pending then failed.
    pub async fn force_sync(&self) -> SyncResult<ForceReport> {
        info!("Force sync requested");

        let report = self.sync_pending().await?;
        let retry = self.retry_failed().await?;

        Ok(ForceReport {
            synced: report.synced + retry.synced,
            failed: report.failed,
            pending: report.pending,
            retried: retry.synced,
        })
    }

    /// Pushes one record and updates its sync bookkeeping.
    ///
    /// Returns true on acceptance. Only store failures propagate; push
    /// failures are recorded on the row.
    async fn push_one(&self, record: &ConsumptionRecord) -> SyncResult<bool> {
        match self.client.push_consumption(record).await {
            PushOutcome::Accepted { code, body } => {
                self.db
                    .consumptions()
                    .mark_synced(&record.id, code as i64, Some(clip(&body, BODY_CLIP)))
                    .await?;
                info!(
                    sale_id = %record.sale_id,
                    ml = record.volume_dispensed_ml,
                    "Record synced"
                );
                Ok(true)
            }

            PushOutcome::Rejected { code, body } => {
                let message = format!("HTTP {code}: {}", clip(&body, 200));
                self.db
                    .consumptions()
                    .mark_sync_failed(&record.id, &message, Some(code as i64))
                    .await?;
                warn!(sale_id = %record.sale_id, code, "Record rejected by backend");
                Ok(false)
            }

            PushOutcome::Unreachable { reason } => {
                self.db
                    .consumptions()
                    .mark_sync_failed(&record.id, &reason, None)
                    .await?;
                warn!(sale_id = %record.sale_id, reason = %reason, "Record push unreachable");
                Ok(false)
            }
        }
    }

    /// Snapshot for the status surface, including a live reachability probe.
    pub async fn status(&self) -> SyncStatus {
        let records = self.db.consumptions().stats().await.unwrap_or_default();
        let remote_reachable = self.client.health().await;
        let inner = self.status.read().await;

        SyncStatus {
            running: inner.running,
            last_sync_time: inner.last_sync_time,
            last_success: inner.last_success,
            consecutive_failures: inner.consecutive_failures,
            remote_reachable,
            records,
        }
    }
}

fn clip(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_base_when_healthy() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, cap, 0), base);
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(60);

        let mut last = Duration::ZERO;
        for failures in 1..20 {
            let delay = backoff_delay(base, cap, failures);
            assert!(delay >= last, "backoff regressed at {failures}");
            assert!(delay <= cap, "backoff exceeded cap at {failures}");
            last = delay;
        }

        // 15, 30, 60, 60, ...
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(15));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, cap, 10), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_no_overflow_at_extreme_counts() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, cap, u32::MAX), cap);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig {
            machine_id: "machine-1".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.machine_id.clear();
        assert!(config.validate().is_err());

        config.machine_id = "machine-1".into();
        config.base_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("hello", 10), "hello");
        assert_eq!(clip("hello", 3), "hel");
        // Multi-byte: clip counts chars, never splits one
        assert_eq!(clip("héllo", 2), "hé");
    }
}
