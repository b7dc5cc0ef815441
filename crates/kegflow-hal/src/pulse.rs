//! # Shared Pulse Counter State
//!
//! Both bindings feed the same state machine: an atomic pulse counter and
//! the timestamp of the last reset. The GPIO interrupt handler and the
//! simulated injector task call [`PulseState::record_pulse`]; everything
//! else is derived on demand.
//!
//! Uses `tokio::time::Instant` for the elapsed clock so tests running under
//! a paused runtime clock measure virtual time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tokio::time::Instant;

use kegflow_core::FlowReading;

/// Callback invoked on every pulse with the new running count.
pub type PulseCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Atomic pulse counter + reset clock shared between a binding's edge
/// source and the readers.
pub struct PulseState {
    count: AtomicU64,
    reset_at: Mutex<Instant>,
    callback: Mutex<Option<PulseCallback>>,
}

impl PulseState {
    pub fn new() -> Self {
        PulseState {
            count: AtomicU64::new(0),
            reset_at: Mutex::new(Instant::now()),
            callback: Mutex::new(None),
        }
    }

    /// Increments the counter and fires the registered callback, if any.
    ///
    /// Called from the GPIO interrupt thread or the injector task; must
    /// stay cheap and never block on anything but the callback slot.
    pub fn record_pulse(&self) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        let guard = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = guard.as_ref() {
            callback(count);
        }
    }

    /// Zeroes the counter and restarts the elapsed clock.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        *self
            .reset_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Pulses since the last reset.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Seconds since the last reset.
    pub fn elapsed_seconds(&self) -> f64 {
        self.reset_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            .as_secs_f64()
    }

    /// Registers (or replaces) the pulse callback.
    pub fn set_callback(&self, callback: PulseCallback) {
        *self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Derives a [`FlowReading`] from the current counter state.
    pub fn reading(&self, pulses_per_liter: f64) -> FlowReading {
        FlowReading::compute(
            self.count(),
            pulses_per_liter,
            self.elapsed_seconds(),
            Utc::now(),
        )
    }
}

impl Default for PulseState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PulseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseState")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_count_and_reset() {
        let state = PulseState::new();

        for _ in 0..5 {
            state.record_pulse();
        }
        assert_eq!(state.count(), 5);

        state.reset();
        assert_eq!(state.count(), 0);
    }

    #[tokio::test]
    async fn test_callback_sees_running_count() {
        let state = PulseState::new();
        let seen = Arc::new(TestCounter::new(0));

        let seen_cb = seen.clone();
        state.set_callback(Box::new(move |count| {
            seen_cb.store(count, Ordering::SeqCst);
        }));

        state.record_pulse();
        state.record_pulse();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reading_math() {
        let state = PulseState::new();
        for _ in 0..45 {
            state.record_pulse();
        }

        // 45 pulses on a 450 pulses/L sensor = 100 ml
        let reading = state.reading(450.0);
        assert!((reading.volume_ml - 100.0).abs() < 1e-9);
    }
}
