//! # Raspberry Pi GPIO Binding
//!
//! Real-hardware binding: the pump runs off a relay on an output pin
//! (active high), and the flow sensor feeds a falling-edge interrupt that
//! increments the shared pulse counter.
//!
//! Compiled only with the `hardware` cargo feature; selected via
//! `MeterBinding::Gpio` in [`HalConfig`](crate::HalConfig).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use tracing::{debug, info, warn};

use kegflow_core::FlowReading;

use crate::error::{HalError, HalResult};
use crate::pulse::{PulseCallback, PulseState};
use crate::{FlowMeter, MeterStatus};

struct Pins {
    pump: OutputPin,
    sensor: InputPin,
}

/// Pump relay + flow sensor on Raspberry Pi GPIO.
pub struct GpioFlow {
    state: Arc<PulseState>,
    pulses_per_liter: f64,
    pump_pin: u8,
    sensor_pin: u8,
    pins: Mutex<Option<Pins>>,
    pump_on: AtomicBool,
}

impl GpioFlow {
    /// Creates an unclaimed binding; pins are claimed by `initialize()`.
    pub fn new(pump_pin: u8, sensor_pin: u8, pulses_per_liter: f64) -> Self {
        GpioFlow {
            state: Arc::new(PulseState::new()),
            pulses_per_liter,
            pump_pin,
            sensor_pin,
            pins: Mutex::new(None),
            pump_on: AtomicBool::new(false),
        }
    }

    fn pins(&self) -> std::sync::MutexGuard<'_, Option<Pins>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FlowMeter for GpioFlow {
    fn initialize(&self) -> HalResult<()> {
        let mut guard = self.pins();
        if guard.is_some() {
            return Ok(());
        }

        let gpio = Gpio::new().map_err(|e| HalError::InitFailed(e.to_string()))?;

        // Pump relay (output, starts de-energized)
        let pump = gpio
            .get(self.pump_pin)
            .map_err(|e| HalError::InitFailed(format!("pump pin {}: {e}", self.pump_pin)))?
            .into_output_low();

        // Flow sensor (input with pull-up, falling-edge interrupt)
        let mut sensor = gpio
            .get(self.sensor_pin)
            .map_err(|e| HalError::InitFailed(format!("sensor pin {}: {e}", self.sensor_pin)))?
            .into_input_pullup();

        let state = self.state.clone();
        sensor
            .set_async_interrupt(Trigger::FallingEdge, move |_level: Level| {
                state.record_pulse();
            })
            .map_err(|e| HalError::InitFailed(format!("sensor interrupt: {e}")))?;

        *guard = Some(Pins { pump, sensor });
        info!(
            pump_pin = self.pump_pin,
            sensor_pin = self.sensor_pin,
            "GPIO flow meter initialized"
        );
        Ok(())
    }

    fn cleanup(&self) -> HalResult<()> {
        self.pump_off();

        if let Some(mut pins) = self.pins().take() {
            if let Err(e) = pins.sensor.clear_async_interrupt() {
                warn!(error = %e, "Failed to clear sensor interrupt");
            }
            // Pins release themselves on drop
        }

        debug!("GPIO flow meter cleaned up");
        Ok(())
    }

    fn pump_on(&self) -> bool {
        {
            let guard = self.pins();
            if guard.is_none() {
                drop(guard);
                if self.initialize().is_err() {
                    return false;
                }
            }
        }

        match self.pins().as_mut() {
            Some(pins) => {
                pins.pump.set_high();
                self.pump_on.store(true, Ordering::SeqCst);
                debug!("Pump ON");
                true
            }
            None => false,
        }
    }

    fn pump_off(&self) -> bool {
        if let Some(pins) = self.pins().as_mut() {
            pins.pump.set_low();
        }
        self.pump_on.store(false, Ordering::SeqCst);
        debug!("Pump OFF");
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
            initialized: self.pins().is_some(),
            binding: "gpio",
            pump_on: self.is_pump_on(),
            pulse_count: reading.pulse_count,
            volume_ml: reading.volume_ml,
            flow_rate_ml_s: reading.flow_rate_ml_s,
        }
    }
}

impl std::fmt::Debug for GpioFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioFlow")
            .field("pump_pin", &self.pump_pin)
            .field("sensor_pin", &self.sensor_pin)
            .field("pump_on", &self.is_pump_on())
            .finish_non_exhaustive()
    }
}
