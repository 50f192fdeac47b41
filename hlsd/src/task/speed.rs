//! Per-task download speed metering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Decay applied to the published speed for each window without new bytes,
/// so UI readouts drift toward zero instead of freezing at the last value.
const IDLE_DECAY: f64 = 0.7;

/// Window length below which the meter does not recompute.
const WINDOW_SECS: f64 = 1.0;

#[derive(Debug)]
struct MeterState {
    last_bytes: u64,
    last_at: Instant,
    speed: f64,
}

/// Byte-rate meter fed from many concurrent workers.
///
/// Workers call [`record`](SpeedMeter::record) with per-chunk byte counts;
/// readers call [`current`](SpeedMeter::current), which also drives the idle
/// decay while nothing is downloading.
#[derive(Debug)]
pub struct SpeedMeter {
    total: AtomicU64,
    state: Mutex<MeterState>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            state: Mutex::new(MeterState {
                last_bytes: 0,
                last_at: Instant::now(),
                speed: 0.0,
            }),
        }
    }

    /// Account `bytes` just read from the network.
    pub fn record(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        self.refresh();
    }

    /// Total bytes accounted so far.
    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Current bytes-per-second readout.
    pub fn current(&self) -> f64 {
        self.refresh();
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .speed
    }

    /// Zero the readout (used when a task reaches a terminal state).
    pub fn reset(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.speed = 0.0;
        state.last_bytes = self.total.load(Ordering::Relaxed);
        state.last_at = Instant::now();
    }

    fn refresh(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = state.last_at.elapsed().as_secs_f64();
        if elapsed < WINDOW_SECS {
            return;
        }
        let total = self.total.load(Ordering::Relaxed);
        let delta = total.saturating_sub(state.last_bytes);
        state.speed = if delta > 0 {
            delta as f64 / elapsed
        } else {
            state.speed * IDLE_DECAY
        };
        state.last_bytes = total;
        state.last_at = Instant::now();
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}
