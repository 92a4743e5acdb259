//! XPRAM watchdog
//!
//! Polls the guest's parameter RAM once a minute and hands it to a
//! [`PersistSink`] when it differs from what was last saved. The wait is cut
//! into short quanta so a stop request is noticed within one quantum.
//!
//! The CPU thread writes the buffer while the watchdog reads it. A write that
//! straddles a comparison is picked up on the next period.

use crate::clock::{CancelToken, Clock};
use crate::config::TimingConfig;
use crate::error::TimingResult;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Size of the Mac extended parameter RAM
pub const XPRAM_SIZE: usize = 0x100;

// ============================================================================
// Watched Buffer
// ============================================================================

/// Byte block shared between the CPU thread and the watchdog.
#[derive(Debug, Clone)]
pub struct WatchedBuffer {
    data: Arc<RwLock<Vec<u8>>>,
}

impl WatchedBuffer {
    /// Zero-filled buffer of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0; size])),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: Arc::new(RwLock::new(bytes.to_vec())),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.data.read().get(offset).copied().unwrap_or(0)
    }

    /// Out-of-range writes are dropped.
    pub fn write_byte(&self, offset: usize, value: u8) {
        if let Some(byte) = self.data.write().get_mut(offset) {
            *byte = value;
        }
    }

    /// Copy `bytes` in at `offset`, truncated to the buffer end.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.write();
        if offset >= data.len() {
            return;
        }
        let end = (offset + bytes.len()).min(data.len());
        let len = end - offset;
        data[offset..end].copy_from_slice(&bytes[..len]);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Receives the buffer whenever the watchdog sees it change.
pub trait PersistSink: Send + Sync {
    fn persist(&self, data: &[u8]) -> TimingResult<()>;
}

impl<F> PersistSink for F
where
    F: Fn(&[u8]) -> TimingResult<()> + Send + Sync,
{
    fn persist(&self, data: &[u8]) -> TimingResult<()> {
        self(data)
    }
}

/// Counters for a finished watchdog loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogStats {
    pub checks: u64,
    pub persisted: u64,
    pub failed: u64,
}

// ============================================================================
// Watchdog
// ============================================================================

pub struct WatchdogTimer<C: Clock> {
    clock: C,
    buffer: WatchedBuffer,
    /// Contents as of the last detected change
    last_seen: Vec<u8>,
    sink: Arc<dyn PersistSink>,
    quantum: Duration,
    quanta_per_period: u32,
    flush_on_stop: bool,
    stats: WatchdogStats,
}

impl<C: Clock> WatchdogTimer<C> {
    /// Snapshots `buffer` as the baseline: nothing is saved until it changes.
    pub fn new(
        clock: C,
        buffer: WatchedBuffer,
        sink: Arc<dyn PersistSink>,
        config: &TimingConfig,
    ) -> Self {
        let last_seen = buffer.snapshot();
        Self {
            clock,
            buffer,
            last_seen,
            sink,
            quantum: config.watchdog_quantum(),
            quanta_per_period: config.watchdog_quanta_per_period(),
            flush_on_stop: config.watchdog_flush_on_stop,
            stats: WatchdogStats::default(),
        }
    }

    pub fn last_seen(&self) -> &[u8] {
        &self.last_seen
    }

    pub fn stats(&self) -> WatchdogStats {
        self.stats
    }

    /// Compare against the last seen contents and persist on difference.
    ///
    /// The baseline moves to the new contents before the sink runs. A failing
    /// sink is logged and counted; the same change is not offered again.
    /// Returns true if the sink accepted the new contents.
    pub fn check(&mut self) -> bool {
        self.stats.checks += 1;

        {
            let data = self.buffer.data.read();
            if data.as_slice() == self.last_seen.as_slice() {
                return false;
            }
            self.last_seen.clear();
            self.last_seen.extend_from_slice(&data);
        }

        match self.sink.persist(&self.last_seen) {
            Ok(()) => {
                self.stats.persisted += 1;
                debug!("XPRAM changed, saved {} bytes", self.last_seen.len());
                true
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!("Failed to save XPRAM: {}", e);
                false
            }
        }
    }

    /// Sleep one period in quanta. False if cancelled on the way.
    fn wait_period(&self, cancel: &CancelToken) -> bool {
        for _ in 0..self.quanta_per_period {
            if cancel.is_cancelled() {
                return false;
            }
            self.clock.sleep(self.quantum);
        }
        !cancel.is_cancelled()
    }

    /// Poll until `cancel` is set.
    pub fn run(&mut self, cancel: &CancelToken) -> WatchdogStats {
        loop {
            let completed = self.wait_period(cancel);
            if completed || self.flush_on_stop {
                self.check();
            }
            if !completed {
                break;
            }
        }
        debug!(
            "XPRAM watchdog done: {} checks, {} saved, {} failed",
            self.stats.checks, self.stats.persisted, self.stats.failed
        );
        self.stats
    }
}
