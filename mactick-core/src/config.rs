//! Timing core configuration
//!
//! `TimingConfig` is read once at startup. `RuntimePrefs` carries the few
//! preference flags that are consulted at the moment a decision is made and
//! may be flipped while the machine runs.

use crate::error::{TimingError, TimingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Nominal tick period in microseconds (60 ticks = 0.99825 s, i.e. 60.15 Hz)
pub const TICK_PERIOD_US: u64 = 16625;
/// Ticks between one-second events
pub const TICKS_PER_SECOND: u32 = 60;
/// Guest low-memory address of the 1 Hz clock (`Time` global)
pub const GUEST_TIME_ADDR: u32 = 0x20C;

/// Timing core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Nominal tick period (microseconds)
    pub tick_period_us: u64,
    /// Ticks per one-second event
    pub ticks_per_second: u32,
    /// How far behind schedule the tick loop may fall before it gives up
    /// on the missed ticks and resynchronises (microseconds)
    pub resync_threshold_us: u64,
    /// XPRAM watchdog period (seconds)
    pub watchdog_period_secs: u32,
    /// Watchdog sleep quantum; bounds shutdown latency (microseconds)
    pub watchdog_quantum_us: u64,
    /// Run one last XPRAM comparison when the watchdog is stopped
    pub watchdog_flush_on_stop: bool,
    /// Guest address receiving the 1 Hz clock value
    pub guest_time_addr: u32,
    /// Skip every otherwise fatal memory fault
    pub ignore_segv: bool,
    /// Route alerts to the log instead of the GUI
    pub nogui: bool,
    /// Include JIT compiler state in fatal fault dumps
    pub jit_debug: bool,
    /// Enter the interactive monitor after a fatal fault dump
    pub monitor: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_period_us: TICK_PERIOD_US,
            ticks_per_second: TICKS_PER_SECOND,
            resync_threshold_us: TICK_PERIOD_US,
            watchdog_period_secs: 60,
            watchdog_quantum_us: 999_999,
            watchdog_flush_on_stop: true,
            guest_time_addr: GUEST_TIME_ADDR,
            ignore_segv: false,
            nogui: false,
            jit_debug: false,
            monitor: false,
        }
    }
}

impl TimingConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    ///
    /// Zero periods, quanta and tick counts are rejected.
    pub fn load(path: &Path) -> TimingResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| TimingError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self =
            serde_json::from_str(&content).map_err(|source| TimingError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        match config.zero_field() {
            Some(field) => Err(TimingError::ConfigInvalid {
                path: path.to_path_buf(),
                field,
            }),
            None => Ok(config),
        }
    }

    /// First field that must not be zero but is.
    fn zero_field(&self) -> Option<&'static str> {
        if self.tick_period_us == 0 {
            Some("tick_period_us")
        } else if self.ticks_per_second == 0 {
            Some("ticks_per_second")
        } else if self.watchdog_period_secs == 0 {
            Some("watchdog_period_secs")
        } else if self.watchdog_quantum_us == 0 {
            Some("watchdog_quantum_us")
        } else {
            None
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(self.tick_period_us)
    }

    pub fn resync_threshold(&self) -> Duration {
        Duration::from_micros(self.resync_threshold_us)
    }

    pub fn watchdog_quantum(&self) -> Duration {
        Duration::from_micros(self.watchdog_quantum_us)
    }

    /// Quanta that make up one watchdog period, rounded to nearest.
    pub fn watchdog_quanta_per_period(&self) -> u32 {
        let period_us = u64::from(self.watchdog_period_secs) * 1_000_000;
        let quantum_us = self.watchdog_quantum_us.max(1);
        ((period_us + quantum_us / 2) / quantum_us).max(1) as u32
    }

    /// Runtime preference flags seeded from this config.
    pub fn runtime_prefs(&self) -> RuntimePrefs {
        RuntimePrefs::new(self.ignore_segv, self.nogui)
    }
}

// ============================================================================
// Runtime preferences
// ============================================================================

/// Preference flags read at decision time.
///
/// Atomics so the fault classifier can consult them from a fault context
/// without locking.
#[derive(Debug, Default)]
pub struct RuntimePrefs {
    ignore_segv: AtomicBool,
    nogui: AtomicBool,
}

impl RuntimePrefs {
    pub fn new(ignore_segv: bool, nogui: bool) -> Self {
        Self {
            ignore_segv: AtomicBool::new(ignore_segv),
            nogui: AtomicBool::new(nogui),
        }
    }

    pub fn ignore_segv(&self) -> bool {
        self.ignore_segv.load(Ordering::Relaxed)
    }

    pub fn set_ignore_segv(&self, v: bool) {
        self.ignore_segv.store(v, Ordering::Relaxed);
    }

    pub fn nogui(&self) -> bool {
        self.nogui.load(Ordering::Relaxed)
    }

    pub fn set_nogui(&self, v: bool) {
        self.nogui.store(v, Ordering::Relaxed);
    }
}
