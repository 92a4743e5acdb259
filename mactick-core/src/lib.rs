//! # MacTick Core
//!
//! Host-side real-time layer for a 68k Macintosh emulator: the 60.15 Hz tick
//! and 1 Hz clock interrupts, the XPRAM watchdog, the shared interrupt flag
//! register and the memory-protection fault trap.

// ============================================================================
// Shared state
// ============================================================================
pub mod config;
pub mod error;
pub mod interrupt;

// ============================================================================
// Time
// ============================================================================
pub mod clock;
pub mod mac_time;
pub mod tick;

// ============================================================================
// Persistence
// ============================================================================
pub mod persist;
pub mod watchdog;

// ============================================================================
// Faults / Alerts
// ============================================================================
pub mod alert;
pub mod fault;

// ============================================================================
// Machine boundary / Lifecycle
// ============================================================================
pub mod lifecycle;
pub mod machine;

pub use clock::{CancelToken, Clock, ManualClock, SystemClock};
pub use config::{RuntimePrefs, TimingConfig};
pub use error::{TimingError, TimingResult};
pub use fault::{FaultContext, FaultDispatcher, FaultDisposition, FaultTrapHandler, RomRange};
pub use interrupt::{InterruptRegister, SECOND_INTERRUPT, TICK_INTERRUPT};
pub use lifecycle::{EmulatorSession, TimingContext, TimingSubsystem};
pub use machine::{CpuCore, GuestMachine};
pub use watchdog::{PersistSink, WatchedBuffer, XPRAM_SIZE};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
