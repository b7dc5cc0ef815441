//! Dispense state machine scenarios over the simulated binding.
//!
//! These run on the real tokio clock: the metering loop, the simulated
//! pulse injector, and every safety window advance in wall-clock time.
//! Scenarios use short windows (single-digit seconds) so the suite stays
//! quick while exercising the full pour lifecycle end to end, including
//! the SQLite persistence step.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use kegflow_agent::{AgentError, DispenseConfig, DispenseController};
use kegflow_core::{DispenseStatus, OutcomeStatus, SyncState, TokenPayload};
use kegflow_db::{Database, DbConfig};
use kegflow_hal::{FlowMeter, SimulatedFlow};

// =============================================================================
// Fixtures
// =============================================================================

/// 100 ml/s through a 450 pulses/L sensor, ticking every 100 ms.
fn test_config() -> DispenseConfig {
    DispenseConfig {
        max_dispense_secs: 120,
        min_flow_rate_ml_s: 5.0,
        poll_interval_ms: 100,
        no_flow_window_secs: 3.0,
        status_grace_secs: 1,
        max_volume_ml: 2000,
    }
}

async fn rig(config: DispenseConfig) -> (DispenseController, Arc<SimulatedFlow>, Database) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let sim = Arc::new(SimulatedFlow::new(450.0, 100.0));
    let meter: Arc<dyn FlowMeter> = sim.clone();
    let controller = DispenseController::new(meter, db.clone(), config);
    (controller, sim, db)
}

fn payload(sale_id: &str, volume_ml: i64) -> TokenPayload {
    TokenPayload::new(sale_id, "bev-pilsen", volume_ml, 1, 120, Utc::now())
}

// =============================================================================
// Scenario: completed pour
// =============================================================================

#[tokio::test]
async fn test_target_volume_completes() {
    let (ctrl, _sim, db) = rig(test_config()).await;

    // 300 ml at 100 ml/s should land around the 3 s mark
    let outcome = ctrl.dispense(payload("sale-a", 300)).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(
        (290.0..=360.0).contains(&outcome.volume_dispensed_ml),
        "expected ~300ml ± one tick, got {}",
        outcome.volume_dispensed_ml
    );
    assert!(
        (2.5..=4.5).contains(&outcome.duration_seconds),
        "expected ~3s, got {}",
        outcome.duration_seconds
    );
    assert!(outcome.record_persisted);
    assert!(outcome.error_message.is_none());

    // The attempt is on disk, pending sync
    let record = db
        .consumptions()
        .get_by_sale("sale-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, OutcomeStatus::Completed);
    assert_eq!(record.sync_status, SyncState::Pending);
    assert_eq!(record.volume_authorized_ml, 300);
}

// =============================================================================
// Scenario: empty keg
// =============================================================================

#[tokio::test]
async fn test_no_flow_interrupts() {
    let (ctrl, sim, db) = rig(test_config()).await;

    // Kill the flow once ~50 ml has poured
    let watcher_sim = sim.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if watcher_sim.reading().volume_ml >= 50.0 {
                watcher_sim.set_flow_rate(0.0);
                break;
            }
        }
    });

    let outcome = ctrl.dispense(payload("sale-d", 500)).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.status, OutcomeStatus::Interrupted);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("No flow detected - check keg")
    );
    assert!(
        (45.0..=70.0).contains(&outcome.volume_dispensed_ml),
        "expected ~50ml, got {}",
        outcome.volume_dispensed_ml
    );

    let record = db
        .consumptions()
        .get_by_sale("sale-d")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, OutcomeStatus::Interrupted);

    // Pump was forced off by the exit actions
    assert!(!sim.is_pump_on());
}

// =============================================================================
// Scenario: user cancel
// =============================================================================

#[tokio::test]
async fn test_cancel_interrupts_at_next_tick() {
    let (ctrl, sim, _db) = rig(test_config()).await;

    let watcher_ctrl = ctrl.clone();
    let watcher_sim = sim.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if watcher_sim.reading().volume_ml >= 150.0 {
                assert!(watcher_ctrl.cancel(), "cancel during dispense must succeed");
                break;
            }
        }
    });

    let outcome = ctrl.dispense(payload("sale-e", 500)).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.status, OutcomeStatus::Interrupted);
    assert_eq!(outcome.error_message.as_deref(), Some("Cancelled by user"));
    // Cancel lands on the next tick: one poll interval of slack at 100 ml/s
    assert!(
        (140.0..=230.0).contains(&outcome.volume_dispensed_ml),
        "expected ~150ml ± one tick, got {}",
        outcome.volume_dispensed_ml
    );
    assert!(!sim.is_pump_on());
}

// =============================================================================
// Safety timeout
// =============================================================================

#[tokio::test]
async fn test_safety_timeout_bounds_every_pour() {
    let config = DispenseConfig {
        max_dispense_secs: 2,
        ..test_config()
    };
    let (ctrl, _sim, _db) = rig(config).await;

    // Target far beyond what 2 seconds at 100 ml/s can deliver
    let outcome = ctrl.dispense(payload("sale-timeout", 1500)).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Interrupted);
    assert_eq!(outcome.error_message.as_deref(), Some("Safety timeout (2s)"));
    // finished - started ≤ max_dispense_time + one poll interval (+ slack)
    assert!(
        outcome.duration_seconds <= 2.0 + 0.1 + 0.3,
        "pour ran past the safety bound: {}s",
        outcome.duration_seconds
    );
}

// =============================================================================
// Single-flight
// =============================================================================

#[tokio::test]
async fn test_concurrent_dispense_rejected_busy() {
    let (ctrl, _sim, db) = rig(test_config()).await;

    ctrl.dispense_detached(payload("sale-first", 1000)).unwrap();

    // Let the detached pour reach Dispensing
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = ctrl.status();
    assert_eq!(snapshot.status, DispenseStatus::Dispensing);
    assert!(snapshot.is_dispensing);
    assert_eq!(snapshot.current_sale_id.as_deref(), Some("sale-first"));

    // Second request bounces without touching the pour in progress
    let err = ctrl.dispense(payload("sale-second", 100)).await.unwrap_err();
    assert!(matches!(err, AgentError::Busy));
    assert_eq!(
        ctrl.status().current_sale_id.as_deref(),
        Some("sale-first"),
        "in-progress dispense must be unaffected"
    );

    // Wind down
    assert!(ctrl.cancel());
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !ctrl.status().is_dispensing {
            break;
        }
    }

    // Only the first sale left a record
    assert!(db.consumptions().get_by_sale("sale-first").await.unwrap().is_some());
    assert!(db.consumptions().get_by_sale("sale-second").await.unwrap().is_none());
}

// =============================================================================
// Grace window
// =============================================================================

#[tokio::test]
async fn test_terminal_status_held_then_rearmed() {
    let (ctrl, _sim, _db) = rig(test_config()).await;

    let outcome = ctrl.dispense(payload("sale-grace", 50)).await.unwrap();
    assert!(outcome.success);

    // Inside the grace window a poller still sees the outcome
    let snapshot = ctrl.status();
    assert_eq!(snapshot.status, DispenseStatus::Completed);
    assert!(!snapshot.is_dispensing);
    assert_eq!(snapshot.current_sale_id.as_deref(), Some("sale-grace"));

    // After the window the controller has rearmed
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let snapshot = ctrl.status();
    assert_eq!(snapshot.status, DispenseStatus::Idle);
    assert!(snapshot.current_sale_id.is_none());
}

#[tokio::test]
async fn test_new_pour_accepted_during_grace() {
    let (ctrl, _sim, _db) = rig(test_config()).await;

    ctrl.dispense(payload("sale-one", 50)).await.unwrap();
    assert_eq!(ctrl.status().status, DispenseStatus::Completed);

    // A terminal status is not "in progress": the next sale may start
    // immediately, and the stale grace timer must not clobber it
    let second = ctrl.dispense(payload("sale-two", 50)).await.unwrap();
    assert!(second.success);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctrl.status().status, DispenseStatus::Idle);
}

// =============================================================================
// Progress + monotonicity
// =============================================================================

#[tokio::test]
async fn test_progress_observer_monotonic_and_capped() {
    let (ctrl, _sim, _db) = rig(test_config()).await;

    let samples: Arc<Mutex<Vec<(f64, f64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    ctrl.set_progress_observer(Box::new(move |ml, percent| {
        sink.lock().unwrap().push((ml, percent));
    }));

    let outcome = ctrl.dispense(payload("sale-progress", 200)).await.unwrap();
    assert!(outcome.success);

    let samples = samples.lock().unwrap();
    assert!(!samples.is_empty(), "observer never fired");

    // Volume samples within one pour never decrease
    assert!(
        samples.windows(2).all(|w| w[1].0 >= w[0].0),
        "volume regressed across ticks"
    );
    // Percent is capped at 100 even when the final tick overshoots
    assert!(samples.iter().all(|(_, pct)| *pct <= 100.0));
    assert_eq!(samples.last().unwrap().1, 100.0);
}

// =============================================================================
// Persistence-once
// =============================================================================

#[tokio::test]
async fn test_one_record_per_sale_despite_duplicate_pours() {
    let (ctrl, _sim, db) = rig(test_config()).await;

    let first = ctrl.dispense(payload("sale-dup", 50)).await.unwrap();
    assert!(first.record_persisted);

    // A second authorized pour for the same sale (fresh token, same
    // sale_id) pours physically, but the audit trail stays single-entry
    let second = ctrl.dispense(payload("sale-dup", 50)).await.unwrap();
    assert!(second.success, "physical outcome is still reported");
    assert!(
        !second.record_persisted,
        "duplicate sale must not produce a second record"
    );
    assert!(second.record_id.is_none());

    let stats = db.consumptions().stats().await.unwrap();
    assert_eq!(stats.total, 1);
}

// =============================================================================
// Pump failure
// =============================================================================

#[tokio::test]
async fn test_counter_reset_between_pours() {
    let (ctrl, _sim, _db) = rig(test_config()).await;

    ctrl.dispense(payload("sale-r1", 100)).await.unwrap();
    let second = ctrl.dispense(payload("sale-r2", 100)).await.unwrap();

    // No carry-over: the second pour meters only its own volume
    assert!(
        (90.0..=160.0).contains(&second.volume_dispensed_ml),
        "carry-over suspected: {}",
        second.volume_dispensed_ml
    );
}
