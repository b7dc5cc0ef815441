//! # kegflow-hal: Flow/Actuator Interface for KegFlow
//!
//! Abstracts the physical pump relay and pulse-counting flow sensor behind
//! one capability trait, [`FlowMeter`], with two interchangeable bindings:
//!
//! - [`SimulatedFlow`] - a tokio timer injects pulses at a configured ml/s
//!   rate while the pump is "on". Used on development hosts and in every
//!   test in this workspace.
//! - `GpioFlow` (cargo feature `hardware`) - a relay output pin and a
//!   falling-edge interrupt on the sensor pin, via rppal on Raspberry Pi.
//!
//! Both bindings share the same pulse-counter state machine: a counter that
//! increments on each sensor edge and a reset timestamp. A [`FlowReading`]
//! is pure computation over those two values - nothing here is persisted.
//!
//! The binding is selected from configuration at construction time via
//! [`build_flow_meter`]; there is no environment probing.

pub mod error;
pub mod pulse;
pub mod sim;

#[cfg(feature = "hardware")]
pub mod gpio;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kegflow_core::FlowReading;

pub use error::{HalError, HalResult};
pub use pulse::{PulseCallback, PulseState};
pub use sim::SimulatedFlow;

#[cfg(feature = "hardware")]
pub use gpio::GpioFlow;

// =============================================================================
// Capability Trait
// =============================================================================

/// The pump + flow sensor capability the dispense controller drives.
///
/// All methods are callable from any thread. `pump_on`/`pump_off` return
/// `bool` rather than `Result` because the controller treats "failed to
/// energize" as a dispense outcome, not a propagated error - the pump is
/// forced off and the attempt records an `Error` status.
pub trait FlowMeter: Send + Sync {
    /// Prepares the binding (claims pins, arms the interrupt). Idempotent.
    fn initialize(&self) -> HalResult<()>;

    /// Releases hardware resources. The pump is switched off first.
    fn cleanup(&self) -> HalResult<()>;

    /// Energizes the pump. Returns false if the actuator could not be driven.
    fn pump_on(&self) -> bool;

    /// De-energizes the pump. Always safe to call, in any state.
    fn pump_off(&self) -> bool;

    /// Current pump relay state.
    fn is_pump_on(&self) -> bool;

    /// Zeroes the pulse counter and restarts the elapsed clock.
    fn reset_counter(&self);

    /// Raw pulses since the last reset.
    fn pulse_count(&self) -> u64;

    /// Snapshot of the meter: pulses, derived volume, elapsed, rate.
    fn reading(&self) -> FlowReading;

    /// Registers a callback invoked on every sensor pulse with the new count.
    fn set_pulse_callback(&self, callback: PulseCallback);

    /// Status summary for the aggregate status surface.
    fn status(&self) -> MeterStatus;
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Point-in-time summary of the meter, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MeterStatus {
    pub initialized: bool,
    pub binding: &'static str,
    pub pump_on: bool,
    pub pulse_count: u64,
    pub volume_ml: f64,
    pub flow_rate_ml_s: f64,
}

// =============================================================================
// Configuration + Factory
// =============================================================================

/// Which binding to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterBinding {
    /// Timer-driven pulse injector; no hardware required.
    #[default]
    Simulated,

    /// Raspberry Pi GPIO via rppal (requires the `hardware` feature).
    Gpio,
}

/// Hardware configuration, embedded in the agent's config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    /// Binding selection.
    pub binding: MeterBinding,

    /// Pump relay control pin (output, active high).
    pub pump_pin: u8,

    /// Flow sensor input pin (input with pull-up).
    pub flow_sensor_pin: u8,

    /// Sensor calibration: pulses per liter.
    /// YF-S201: ~450 pulses/L, YF-S401: ~5880 pulses/L.
    pub pulses_per_liter: f64,

    /// Simulated flow rate in ml/s (simulated binding only).
    pub sim_flow_rate_ml_s: f64,
}

impl Default for HalConfig {
    fn default() -> Self {
        HalConfig {
            binding: MeterBinding::Simulated,
            pump_pin: 17,
            flow_sensor_pin: 27,
            pulses_per_liter: 450.0,
            sim_flow_rate_ml_s: 100.0,
        }
    }
}

/// Builds the configured binding.
///
/// Selection is explicit: asking for `Gpio` in a build without the
/// `hardware` feature is a configuration error, not a silent fallback.
pub fn build_flow_meter(config: &HalConfig) -> HalResult<Arc<dyn FlowMeter>> {
    match config.binding {
        MeterBinding::Simulated => Ok(Arc::new(SimulatedFlow::new(
            config.pulses_per_liter,
            config.sim_flow_rate_ml_s,
        ))),

        #[cfg(feature = "hardware")]
        MeterBinding::Gpio => Ok(Arc::new(GpioFlow::new(
            config.pump_pin,
            config.flow_sensor_pin,
            config.pulses_per_liter,
        ))),

        #[cfg(not(feature = "hardware"))]
        MeterBinding::Gpio => Err(HalError::Unsupported(
            "gpio binding requires the 'hardware' feature".into(),
        )),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
