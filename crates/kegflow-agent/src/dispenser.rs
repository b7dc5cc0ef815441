//! # Dispense Controller
//!
//! The state machine that turns a validated token into a metered pour.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Dispense State Machine                              │
//! │                                                                         │
//! │  Idle ──► Validating ──► Dispensing ──► Completed ──┐                  │
//! │   ▲            │              │    └──► Interrupted ─┤ grace            │
//! │   │            │              │    └──► Error ───────┤ window           │
//! │   │            ▼              ▼                      │                  │
//! │   └────────────────────────────────────────────◄────┘                  │
//! │                                                                         │
//! │  Tick priority (every poll interval):                                  │
//! │    1. target reached        → Completed                                │
//! │    2. cancel flag           → Interrupted "Cancelled by user"          │
//! │    3. safety timeout        → Interrupted "Safety timeout"             │
//! │    4. no-flow window passed → Interrupted "No flow detected"           │
//! │                                                                         │
//! │  Exit actions, ALWAYS, in order:                                       │
//! │    pump off → persist record → reset counter → hold terminal status    │
//! │    for the grace window → rearm to Idle                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The busy check and the `Idle → Validating` transition happen under one
//! lock, so at most one pour ever owns the actuator. Cancellation is a
//! cooperative flag observed once per tick - there is no forced kill; the
//! pump always goes off through the normal exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kegflow_core::{DispenseOutcome, DispenseStatus, OutcomeStatus, TokenPayload};
use kegflow_db::repository::consumption::NewConsumption;
use kegflow_db::Database;
use kegflow_hal::FlowMeter;

use crate::config::DispenseConfig;
use crate::error::{AgentError, AgentResult};

/// Observer invoked on every metering tick with
/// `(volume_dispensed_ml, percent_complete)`; percent is capped at 100.
pub type ProgressObserver = Box<dyn Fn(f64, f64) + Send + Sync>;

// =============================================================================
// Status Snapshot
// =============================================================================

/// Lock-protected snapshot of the controller for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct DispenserSnapshot {
    pub status: DispenseStatus,
    pub is_dispensing: bool,
    pub current_sale_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_dispensed_ml: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_rate_ml_s: Option<f64>,
}

// =============================================================================
// Internal State
// =============================================================================

struct ControllerState {
    status: DispenseStatus,
    current_sale_id: Option<String>,
    /// Bumped on every accepted dispense so a stale grace-window timer can
    /// never rearm the controller under a newer pour.
    generation: u64,
}

/// Claim produced by the guarded `Idle → Validating` transition; whoever
/// holds it runs the pour.
struct DispenseTicket {
    payload: TokenPayload,
    generation: u64,
}

// =============================================================================
// Controller
// =============================================================================

/// Drives the flow/actuator interface under safety constraints.
///
/// Cheap to clone; all clones share state, so a detached pour and a
/// status poller see the same machine.
#[derive(Clone)]
pub struct DispenseController {
    meter: Arc<dyn FlowMeter>,
    db: Database,
    config: DispenseConfig,
    state: Arc<Mutex<ControllerState>>,
    cancel: Arc<AtomicBool>,
    progress: Arc<Mutex<Option<ProgressObserver>>>,
}

impl DispenseController {
    /// Creates a controller over the given meter and store.
    pub fn new(meter: Arc<dyn FlowMeter>, db: Database, config: DispenseConfig) -> Self {
        DispenseController {
            meter,
            db,
            config,
            state: Arc::new(Mutex::new(ControllerState {
                status: DispenseStatus::Idle,
                current_sale_id: None,
                generation: 0,
            })),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers the progress observer invoked on every metering tick.
    pub fn set_progress_observer(&self, observer: ProgressObserver) {
        *self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Current state snapshot. Never blocks on the pour itself.
    pub fn status(&self) -> DispenserSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let is_dispensing = state.status == DispenseStatus::Dispensing;

        let mut snapshot = DispenserSnapshot {
            status: state.status,
            is_dispensing,
            current_sale_id: state.current_sale_id.clone(),
            volume_dispensed_ml: None,
            duration_seconds: None,
            flow_rate_ml_s: None,
        };

        if is_dispensing {
            let reading = self.meter.reading();
            snapshot.volume_dispensed_ml = Some(reading.volume_ml);
            snapshot.duration_seconds = Some(reading.duration_seconds);
            snapshot.flow_rate_ml_s = Some(reading.flow_rate_ml_s);
        }

        snapshot
    }

    /// Requests cancellation of the pour in progress.
    ///
    /// Returns false when nothing is dispensing. Takes effect on the next
    /// tick (bounded by the poll interval) - never mid-actuation.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.status == DispenseStatus::Dispensing {
            self.cancel.store(true, Ordering::SeqCst);
            info!(sale_id = ?state.current_sale_id, "Cancellation requested");
            true
        } else {
            false
        }
    }

    /// Runs a pour to completion (blocking call shape).
    pub async fn dispense(&self, payload: TokenPayload) -> AgentResult<DispenseOutcome> {
        let ticket = self.begin(payload)?;
        Ok(self.run(ticket).await)
    }

    /// Starts a pour and returns immediately (async call shape); callers
    /// follow it via `status()`. The busy check still happens here, so an
    /// accepted start owns the actuator.
    pub fn dispense_detached(&self, payload: TokenPayload) -> AgentResult<()> {
        let ticket = self.begin(payload)?;
        let controller = self.clone();
        tokio::spawn(async move {
            controller.run(ticket).await;
        });
        Ok(())
    }

    /// The guarded `Idle → Validating` transition.
    ///
    /// Busy-check and transition are one critical section: two concurrent
    /// authorizations cannot both get a ticket.
    fn begin(&self, payload: TokenPayload) -> AgentResult<DispenseTicket> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.status.is_active() {
            warn!(
                sale_id = %payload.sale_id,
                current = ?state.current_sale_id,
                "Dispense rejected: busy"
            );
            return Err(AgentError::Busy);
        }

        state.status = DispenseStatus::Validating;
        state.current_sale_id = Some(payload.sale_id.clone());
        state.generation += 1;
        let generation = state.generation;
        drop(state);

        self.cancel.store(false, Ordering::SeqCst);

        Ok(DispenseTicket { payload, generation })
    }

    /// Executes a ticketed pour. Infallible by design: every failure mode
    /// collapses into the outcome, and the exit actions always run.
    async fn run(&self, ticket: DispenseTicket) -> DispenseOutcome {
        let payload = ticket.payload;
        let started_at = Utc::now();

        let mut final_status = OutcomeStatus::Completed;
        let mut error_message: Option<String> = None;

        if let Err(e) = self.meter.initialize() {
            final_status = OutcomeStatus::Error;
            error_message = Some(format!("Hardware initialization failed: {e}"));
        } else {
            self.meter.reset_counter();

            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.status = DispenseStatus::Dispensing;
            }

            if !self.meter.pump_on() {
                final_status = OutcomeStatus::Error;
                error_message = Some("Failed to start pump".to_string());
            } else {
                info!(
                    sale_id = %payload.sale_id,
                    volume_ml = payload.volume_ml,
                    tap_id = payload.tap_id,
                    "Dispensing"
                );
                (final_status, error_message) = self.metering_loop(&payload).await;
            }
        }

        // Exit actions: the pump goes off no matter how the loop ended
        self.meter.pump_off();

        let finished_at = Utc::now();
        let final_reading = self.meter.reading();

        if final_status == OutcomeStatus::Completed
            && final_reading.flow_rate_ml_s < self.config.min_flow_rate_ml_s
        {
            warn!(
                sale_id = %payload.sale_id,
                rate = final_reading.flow_rate_ml_s,
                threshold = self.config.min_flow_rate_ml_s,
                "Completed pour averaged below the minimum flow rate - possible line restriction"
            );
        }

        // Persist the attempt. Fail-open: a store failure is logged and
        // flagged on the outcome, but the physical result stands - the
        // beverage is already in the glass.
        let mut record_id = None;
        let mut record_persisted = false;
        match self
            .db
            .consumptions()
            .save(NewConsumption {
                sale_id: payload.sale_id.clone(),
                token_id: Some(payload.nonce.clone()),
                beverage_id: payload.beverage_id.clone(),
                tap_id: payload.tap_id,
                volume_authorized_ml: payload.volume_ml,
                volume_dispensed_ml: final_reading.volume_ml,
                started_at,
                finished_at,
                pulse_count: final_reading.pulse_count as i64,
                flow_rate_avg: final_reading.flow_rate_ml_s,
                status: final_status,
                error_message: error_message.clone(),
            })
            .await
        {
            Ok(record) => {
                debug!(record_id = %record.id, "Consumption record saved");
                record_id = Some(record.id);
                record_persisted = true;
            }
            Err(e) => {
                error!(
                    sale_id = %payload.sale_id,
                    error = %e,
                    "Failed to persist consumption record - this attempt is un-audited locally"
                );
            }
        }

        // Reset so nothing carries over into the next pour
        self.meter.reset_counter();

        // Hold the terminal status for the grace window so a poller
        // observes the outcome, then rearm
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.status = final_status.into();
        }
        self.schedule_rearm(ticket.generation);

        let outcome = DispenseOutcome {
            success: final_status == OutcomeStatus::Completed,
            status: final_status,
            sale_id: payload.sale_id.clone(),
            volume_authorized_ml: payload.volume_ml,
            volume_dispensed_ml: final_reading.volume_ml,
            duration_seconds: final_reading.duration_seconds,
            pulse_count: final_reading.pulse_count as i64,
            error_message,
            record_id,
            record_persisted,
        };

        info!(
            sale_id = %outcome.sale_id,
            status = %outcome.status,
            volume_ml = outcome.volume_dispensed_ml,
            duration_s = outcome.duration_seconds,
            "Dispense finished"
        );

        outcome
    }

    /// The cooperative metering loop. Returns the terminal outcome and an
    /// optional reason.
    async fn metering_loop(&self, payload: &TokenPayload) -> (OutcomeStatus, Option<String>) {
        let target_ml = payload.volume_ml as f64;
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let max_time = Duration::from_secs(self.config.max_dispense_secs);
        let no_flow_window = Duration::from_secs_f64(self.config.no_flow_window_secs);

        let started = Instant::now();
        let mut last_pulse_count = 0u64;
        let mut last_flow_at = started;

        loop {
            tokio::time::sleep(poll).await;

            let reading = self.meter.reading();

            // Progress observer fires on every tick
            {
                let guard = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(observer) = guard.as_ref() {
                    let percent = (reading.volume_ml / target_ml * 100.0).min(100.0);
                    observer(reading.volume_ml, percent);
                }
            }

            // 1. Target reached
            if reading.volume_ml >= target_ml {
                info!(volume_ml = reading.volume_ml, "Target volume reached");
                return (OutcomeStatus::Completed, None);
            }

            // 2. Cancellation
            if self.cancel.load(Ordering::SeqCst) {
                warn!(sale_id = %payload.sale_id, "Dispense cancelled by user");
                return (
                    OutcomeStatus::Interrupted,
                    Some("Cancelled by user".to_string()),
                );
            }

            // 3. Safety timeout
            let elapsed = started.elapsed();
            if elapsed >= max_time {
                warn!(
                    elapsed_s = elapsed.as_secs_f64(),
                    "Safety timeout - stopping pour"
                );
                return (
                    OutcomeStatus::Interrupted,
                    Some(format!("Safety timeout ({}s)", self.config.max_dispense_secs)),
                );
            }

            // 4. Empty-keg detection: no new pulses inside the window
            if reading.pulse_count > last_pulse_count {
                last_pulse_count = reading.pulse_count;
                last_flow_at = Instant::now();
            } else if last_flow_at.elapsed() > no_flow_window {
                warn!(
                    pulse_count = reading.pulse_count,
                    "No flow detected - possible empty keg"
                );
                return (
                    OutcomeStatus::Interrupted,
                    Some("No flow detected - check keg".to_string()),
                );
            }
        }
    }

    /// Schedules the terminal-status → Idle rearm after the grace window.
    fn schedule_rearm(&self, generation: u64) {
        let state = self.state.clone();
        let grace = Duration::from_secs(self.config.status_grace_secs);

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            // A newer pour owns the machine now; leave its state alone
            if state.generation == generation && state.status.is_terminal() {
                state.status = DispenseStatus::Idle;
                state.current_sale_id = None;
                debug!("Controller rearmed to idle");
            }
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kegflow_db::DbConfig;
    use kegflow_hal::SimulatedFlow;

    async fn controller() -> DispenseController {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let meter: Arc<dyn FlowMeter> = Arc::new(SimulatedFlow::new(450.0, 100.0));
        DispenseController::new(meter, db, DispenseConfig::default())
    }

    #[tokio::test]
    async fn test_initial_snapshot_idle() {
        let ctrl = controller().await;
        let snapshot = ctrl.status();

        assert_eq!(snapshot.status, DispenseStatus::Idle);
        assert!(!snapshot.is_dispensing);
        assert!(snapshot.current_sale_id.is_none());
        assert!(snapshot.volume_dispensed_ml.is_none());
    }

    #[tokio::test]
    async fn test_cancel_is_noop_when_idle() {
        let ctrl = controller().await;
        assert!(!ctrl.cancel());
    }

    #[tokio::test]
    async fn test_begin_rejects_while_active() {
        let ctrl = controller().await;
        let payload = TokenPayload::new("sale-1", "bev-1", 300, 1, 120, Utc::now());

        let _ticket = ctrl.begin(payload.clone()).unwrap();
        assert!(matches!(
            ctrl.begin(payload),
            Err(AgentError::Busy)
        ));
    }
}
