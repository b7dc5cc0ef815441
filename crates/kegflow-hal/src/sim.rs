//! # Simulated Flow Binding
//!
//! Development/test binding with the same semantics as the real hardware:
//! while the pump is "on", a background tokio task injects pulses into the
//! shared [`PulseState`] at whatever the configured flow rate implies.
//!
//! ```text
//! pulses_per_second = flow_rate_ml_s * pulses_per_liter / 1000
//! ```
//!
//! The rate can be changed mid-pour with [`SimulatedFlow::set_flow_rate`] -
//! setting it to 0 models an empty keg (pump spinning, no flow), which is
//! exactly what the controller's no-flow detection is for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use kegflow_core::FlowReading;

use crate::error::HalResult;
use crate::pulse::{PulseCallback, PulseState};
use crate::{FlowMeter, MeterStatus};

/// Idle poll period while the simulated keg is "empty" (rate 0).
const EMPTY_POLL: Duration = Duration::from_millis(50);

/// Timer-driven stand-in for the pump relay + flow sensor pair.
///
/// Must be driven from inside a tokio runtime: `pump_on` spawns the pulse
/// injector task.
pub struct SimulatedFlow {
    state: Arc<PulseState>,
    pulses_per_liter: f64,
    flow_rate: Arc<Mutex<f64>>,
    pump_on: Arc<AtomicBool>,
    initialized: AtomicBool,
    injector: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedFlow {
    /// Creates a simulated meter with the given calibration and flow rate.
    pub fn new(pulses_per_liter: f64, flow_rate_ml_s: f64) -> Self {
        SimulatedFlow {
            state: Arc::new(PulseState::new()),
            pulses_per_liter,
            flow_rate: Arc::new(Mutex::new(flow_rate_ml_s)),
            pump_on: Arc::new(AtomicBool::new(false)),
            initialized: AtomicBool::new(false),
            injector: Mutex::new(None),
        }
    }

    /// Changes the simulated flow rate (ml/s). Takes effect on the next
    /// injected pulse; 0 stops flow without stopping the pump.
    pub fn set_flow_rate(&self, ml_per_second: f64) {
        *self
            .flow_rate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ml_per_second;
        debug!(rate_ml_s = ml_per_second, "Simulated flow rate changed");
    }

    fn spawn_injector(&self) {
        let state = self.state.clone();
        let pump = self.pump_on.clone();
        let rate = self.flow_rate.clone();
        let pulses_per_liter = self.pulses_per_liter;

        let handle = tokio::spawn(async move {
            while pump.load(Ordering::SeqCst) {
                let ml_s = *rate.lock().unwrap_or_else(PoisonError::into_inner);
                let pulses_per_second = ml_s * pulses_per_liter / 1000.0;

                if pulses_per_second <= 0.0 {
                    tokio::time::sleep(EMPTY_POLL).await;
                    continue;
                }

                tokio::time::sleep(Duration::from_secs_f64(1.0 / pulses_per_second)).await;

                if pump.load(Ordering::SeqCst) {
                    state.record_pulse();
                }
            }
        });

        *self
            .injector
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

impl FlowMeter for SimulatedFlow {
    fn initialize(&self) -> HalResult<()> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("Simulated flow meter initialized");
        }
        Ok(())
    }

    fn cleanup(&self) -> HalResult<()> {
        self.pump_off();
        self.initialized.store(false, Ordering::SeqCst);
        debug!("Simulated flow meter cleaned up");
        Ok(())
    }

    fn pump_on(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) && self.initialize().is_err() {
            return false;
        }

        // Already on: keep the existing injector
        if self.pump_on.swap(true, Ordering::SeqCst) {
            return true;
        }

        self.spawn_injector();
        debug!("Simulated pump ON");
        true
    }

    fn pump_off(&self) -> bool {
        self.pump_on.store(false, Ordering::SeqCst);

        // The injector exits on its own once it observes the flag; dropping
        // the handle just detaches the already-finished task.
        self.injector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        debug!("Simulated pump OFF");
        true
    }

    fn is_pump_on(&self) -> bool {
        self.pump_on.load(Ordering::SeqCst)
    }

    fn reset_counter(&self) {
        self.state.reset();
    }

    fn pulse_count(&self) -> u64 {
        self.state.count()
    }

    fn reading(&self) -> FlowReading {
        self.state.reading(self.pulses_per_liter)
    }

    fn set_pulse_callback(&self, callback: PulseCallback) {
        self.state.set_callback(callback);
    }

    fn status(&self) -> MeterStatus {
        let reading = self.reading();
        MeterStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            binding: "simulated",
            pump_on: self.is_pump_on(),
            pulse_count: reading.pulse_count,
            volume_ml: reading.volume_ml,
            flow_rate_ml_s: reading.flow_rate_ml_s,
        }
    }
}

impl std::fmt::Debug for SimulatedFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedFlow")
            .field("pump_on", &self.is_pump_on())
            .field("pulse_count", &self.pulse_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
