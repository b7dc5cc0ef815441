//! # Domain Types
//!
//! Core domain types used throughout KegFlow.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌───────────────────┐   ┌─────────────────┐   ┌─────────────────┐     │
//! │  │ ConsumptionRecord │   │   FlowReading   │   │  SyncLogEntry   │     │
//! │  │  ───────────────  │   │  ─────────────  │   │  ─────────────  │     │
//! │  │  id (UUID)        │   │  pulse_count    │   │  consumption_id │     │
//! │  │  sale_id (unique) │   │  volume_ml      │   │  attempted_at   │     │
//! │  │  outcome + sync   │   │  flow_rate_ml_s │   │  success / code │     │
//! │  │  bookkeeping      │   │  (derived only) │   │  (append-only)  │     │
//! │  └───────────────────┘   └─────────────────┘   └─────────────────┘     │
//! │                                                                         │
//! │  ┌───────────────────┐   ┌─────────────────┐   ┌─────────────────┐     │
//! │  │  DispenseStatus   │   │  OutcomeStatus  │   │    SyncState    │     │
//! │  │  ───────────────  │   │  ─────────────  │   │  ─────────────  │     │
//! │  │  Idle             │   │  Completed      │   │  Pending        │     │
//! │  │  Validating       │   │  Interrupted    │   │  Synced         │     │
//! │  │  Dispensing       │   │  Error          │   │  Failed         │     │
//! │  │  + terminal trio  │   └─────────────────┘   └─────────────────┘     │
//! │  └───────────────────┘                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Dispense Status
// =============================================================================

/// Live state of the dispense controller.
///
/// ## State Machine
/// ```text
/// Idle ──► Validating ──► Dispensing ──► {Completed | Interrupted | Error}
///   ▲                                                  │
///   └──────────────── grace window ────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispenseStatus {
    /// Nothing in flight; ready to accept an authorization.
    #[default]
    Idle,

    /// Payload accepted, hardware being prepared.
    Validating,

    /// Pump energized, metering loop running.
    Dispensing,

    /// Target volume reached.
    Completed,

    /// Stopped early: cancel, safety timeout, or no flow.
    Interrupted,

    /// Actuator or internal failure.
    Error,
}

impl DispenseStatus {
    /// Returns true while a dispense owns the actuator.
    pub fn is_active(&self) -> bool {
        matches!(self, DispenseStatus::Validating | DispenseStatus::Dispensing)
    }

    /// Returns true for the three terminal outcomes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispenseStatus::Completed | DispenseStatus::Interrupted | DispenseStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispenseStatus::Idle => "idle",
            DispenseStatus::Validating => "validating",
            DispenseStatus::Dispensing => "dispensing",
            DispenseStatus::Completed => "completed",
            DispenseStatus::Interrupted => "interrupted",
            DispenseStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for DispenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Outcome Status
// =============================================================================

/// Terminal outcome of one dispense attempt, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum OutcomeStatus {
    Completed,
    Interrupted,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Interrupted => "interrupted",
            OutcomeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OutcomeStatus> for DispenseStatus {
    fn from(outcome: OutcomeStatus) -> Self {
        match outcome {
            OutcomeStatus::Completed => DispenseStatus::Completed,
            OutcomeStatus::Interrupted => DispenseStatus::Interrupted,
            OutcomeStatus::Error => DispenseStatus::Error,
        }
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Where a record stands against the remote backend.
///
/// Records move `Pending → Synced` on success and `Pending → Failed` on a
/// rejected or unreachable push. `Failed` records are retried up to the
/// configured cap and then stay `Failed` forever - they are never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum SyncState {
    #[default]
    Pending,
    Synced,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Consumption Record
// =============================================================================

/// One row per dispense attempt - the permanent local audit trail.
///
/// Created exactly once when an attempt finishes (success or failure).
/// Only the sync fields (`sync_status`, `sync_attempts`,
/// `last_sync_attempt`, `error_message`) are ever mutated afterwards, and
/// only by the sync service. Rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ConsumptionRecord {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Sale this pour settled. UNIQUE: one record per sale, ever.
    pub sale_id: String,

    /// Raw token used for the authorization, for upstream correlation.
    pub token_id: Option<String>,

    /// Beverage that was poured.
    pub beverage_id: String,

    /// Tap the pour ran on.
    pub tap_id: i64,

    /// Volume the token authorized.
    pub volume_authorized_ml: i64,

    /// Volume the meter actually saw.
    pub volume_dispensed_ml: f64,

    /// When the pump was commanded on.
    pub started_at: DateTime<Utc>,

    /// When the attempt reached a terminal state.
    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration of the attempt.
    pub duration_seconds: f64,

    /// Raw sensor pulses counted during the attempt.
    pub pulse_count: i64,

    /// Average flow rate over the attempt (ml/s).
    pub flow_rate_avg: f64,

    /// Terminal outcome.
    pub status: OutcomeStatus,

    /// Reconciliation state against the remote backend.
    pub sync_status: SyncState,

    /// Number of sync attempts so far.
    pub sync_attempts: i64,

    /// When the last sync attempt ran.
    pub last_sync_attempt: Option<DateTime<Utc>>,

    /// Interruption reason or last sync error.
    pub error_message: Option<String>,

    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Flow Reading
// =============================================================================

/// A snapshot of the flow sensor, derived on demand - never persisted.
///
/// `volume_ml = pulse_count / pulses_per_liter * 1000`, and the rate is
/// volume over elapsed time since the counter was last reset (0 when no
/// time has elapsed).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowReading {
    pub pulse_count: u64,
    pub volume_ml: f64,
    pub duration_seconds: f64,
    pub flow_rate_ml_s: f64,
    pub timestamp: DateTime<Utc>,
}

impl FlowReading {
    /// Computes a reading from raw counter state.
    pub fn compute(
        pulse_count: u64,
        pulses_per_liter: f64,
        elapsed_seconds: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let volume_ml = if pulses_per_liter > 0.0 {
            pulse_count as f64 / pulses_per_liter * 1000.0
        } else {
            0.0
        };
        let flow_rate_ml_s = if elapsed_seconds > 0.0 {
            volume_ml / elapsed_seconds
        } else {
            0.0
        };

        FlowReading {
            pulse_count,
            volume_ml,
            duration_seconds: elapsed_seconds,
            flow_rate_ml_s,
            timestamp,
        }
    }
}

// =============================================================================
// Used Token Entry
// =============================================================================

/// Replay-protection ledger entry. Persisted so a token cannot be replayed
/// across a crash/restart window; purged lazily once past `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UsedToken {
    pub nonce: String,
    pub used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// Sync Log Entry
// =============================================================================

/// Append-only audit of one remote sync attempt. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncLogEntry {
    pub id: i64,
    pub consumption_id: String,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub response_code: Option<i64>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

// =============================================================================
// Dispense Outcome
// =============================================================================

/// What the caller gets back from one dispense attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseOutcome {
    /// True only for a completed pour.
    pub success: bool,

    /// Terminal outcome.
    pub status: OutcomeStatus,

    pub sale_id: String,
    pub volume_authorized_ml: i64,
    pub volume_dispensed_ml: f64,
    pub duration_seconds: f64,
    pub pulse_count: i64,

    /// Interruption/error reason, when there is one.
    pub error_message: Option<String>,

    /// Id of the persisted ConsumptionRecord, when persistence succeeded.
    pub record_id: Option<String>,

    /// False when the store write failed after the pour. The physical
    /// outcome above is still authoritative; the attempt is un-audited
    /// locally and this flag is how that gap is surfaced.
    pub record_persisted: bool,
}

// =============================================================================
// Store Stats
// =============================================================================

/// Aggregate counters over the consumptions table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: i64,
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
    pub total_volume_ml: f64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(DispenseStatus::Dispensing.is_active());
        assert!(DispenseStatus::Validating.is_active());
        assert!(!DispenseStatus::Idle.is_active());
        assert!(!DispenseStatus::Completed.is_active());

        assert!(DispenseStatus::Completed.is_terminal());
        assert!(DispenseStatus::Interrupted.is_terminal());
        assert!(DispenseStatus::Error.is_terminal());
        assert!(!DispenseStatus::Dispensing.is_terminal());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(DispenseStatus::Idle.as_str(), "idle");
        assert_eq!(OutcomeStatus::Interrupted.as_str(), "interrupted");
        assert_eq!(SyncState::Pending.as_str(), "pending");
    }

    #[test]
    fn test_flow_reading_math() {
        // 450 pulses/L sensor: 225 pulses = 500 ml
        let now = Utc::now();
        let reading = FlowReading::compute(225, 450.0, 5.0, now);
        assert!((reading.volume_ml - 500.0).abs() < 1e-9);
        assert!((reading.flow_rate_ml_s - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_flow_reading_zero_elapsed() {
        let reading = FlowReading::compute(10, 450.0, 0.0, Utc::now());
        assert_eq!(reading.flow_rate_ml_s, 0.0);
    }

    #[test]
    fn test_outcome_maps_to_status() {
        let status: DispenseStatus = OutcomeStatus::Interrupted.into();
        assert_eq!(status, DispenseStatus::Interrupted);
    }
}
