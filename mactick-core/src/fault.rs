//! Memory-protection fault trap
//!
//! The CPU emulator maps guest ROM read-only and relies on host faults for a
//! few tricks (screen update tracking, dropping ROM writes). The host's fault
//! delivery calls [`FaultDispatcher::deliver`] on the faulting thread.
//!
//! Classification is a pure function of the fault address and the current
//! preferences. It takes no locks, does not allocate and never logs, so it is
//! safe from a fault context. Everything with side effects lives in the fatal
//! path, which runs at most once per process.

use crate::config::RuntimePrefs;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// One delivered fault.
///
/// Lives for a single delivery. The disposition is not stored here: the
/// classifier returns it to the caller, which acts on it before the record
/// goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    /// Host address that was accessed
    pub address: usize,
    /// Host instruction pointer, when the platform reports one
    pub instruction: Option<usize>,
}

impl FaultContext {
    pub fn new(address: usize, instruction: Option<usize>) -> Self {
        Self {
            address,
            instruction,
        }
    }
}

/// What the faulting thread should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Claimed and fixed up by the screen handler; re-run the access
    Handled,
    /// Step over the faulting instruction
    SkipInstruction,
    /// Unrecoverable; dump state and shut down
    Fatal,
}

/// Video layer that write-protects the framebuffer to track dirty regions.
pub trait ScreenFaultHandler: Send + Sync {
    /// True if the fault was in the framebuffer and has been dealt with.
    fn handle_fault(&self, fault: &FaultContext) -> bool;
}

/// Host range holding the guest ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomRange {
    pub base: usize,
    pub size: usize,
}

impl RomRange {
    pub fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn contains(&self, address: usize) -> bool {
        address.wrapping_sub(self.base) < self.size
    }
}

// ============================================================================
// Classifier
// ============================================================================

pub struct FaultTrapHandler {
    rom: RomRange,
    /// Host fault delivery can step over an instruction
    skip_supported: bool,
    prefs: Arc<RuntimePrefs>,
    screen: Option<Arc<dyn ScreenFaultHandler>>,
}

impl FaultTrapHandler {
    pub fn new(rom: RomRange, skip_supported: bool, prefs: Arc<RuntimePrefs>) -> Self {
        Self {
            rom,
            skip_supported,
            prefs,
            screen: None,
        }
    }

    pub fn with_screen_handler(mut self, screen: Arc<dyn ScreenFaultHandler>) -> Self {
        self.screen = Some(screen);
        self
    }

    /// Classify a fault. First match wins:
    /// screen handler, ROM write, `ignore_segv`.
    ///
    /// Both skips need a host that can step over the faulting instruction;
    /// without one every unclaimed fault is fatal.
    pub fn classify(&self, fault: &FaultContext) -> FaultDisposition {
        if let Some(screen) = &self.screen {
            if screen.handle_fault(fault) {
                return FaultDisposition::Handled;
            }
        }

        if self.skip_supported {
            if self.rom.contains(fault.address) {
                return FaultDisposition::SkipInstruction;
            }
            if self.prefs.ignore_segv() {
                return FaultDisposition::SkipInstruction;
            }
        }

        FaultDisposition::Fatal
    }

    pub fn classify_fault(&self, address: usize, instruction: Option<usize>) -> FaultDisposition {
        self.classify(&FaultContext::new(address, instruction))
    }
}

// ============================================================================
// Fatal path
// ============================================================================

/// Host services used after an unrecoverable fault.
pub trait DiagnosticHooks: Send + Sync {
    /// Emulated CPU register dump.
    fn dump_cpu_state(&self) -> String;

    /// JIT compiler state, if there is a JIT.
    fn dump_jit_state(&self) -> Option<String> {
        None
    }

    fn quit_full_screen(&self) {}

    /// Interactive debugger; returns when the user leaves it.
    fn enter_monitor(&self) {}

    /// Begin orderly emulator shutdown.
    fn request_shutdown(&self);
}

/// State captured for an unrecoverable fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalReport {
    pub fault: FaultContext,
    pub cpu_state: String,
    pub jit_state: Option<String>,
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Caught SIGSEGV at address {:#x}", self.fault.address)?;
        if let Some(ip) = self.fault.instruction {
            write!(f, " [IP={:#x}]", ip)?;
        }
        write!(f, "\n{}", self.cpu_state)?;
        if let Some(jit) = &self.jit_state {
            write!(f, "\n{}", jit)?;
        }
        Ok(())
    }
}

/// Entry point for the host's fault delivery.
pub struct FaultDispatcher {
    trap: FaultTrapHandler,
    hooks: Arc<dyn DiagnosticHooks>,
    jit_debug: bool,
    monitor: bool,
    dumped: AtomicBool,
}

impl FaultDispatcher {
    pub fn new(trap: FaultTrapHandler, hooks: Arc<dyn DiagnosticHooks>) -> Self {
        Self {
            trap,
            hooks,
            jit_debug: false,
            monitor: false,
            dumped: AtomicBool::new(false),
        }
    }

    pub fn with_jit_debug(mut self, enabled: bool) -> Self {
        self.jit_debug = enabled;
        self
    }

    pub fn with_monitor(mut self, enabled: bool) -> Self {
        self.monitor = enabled;
        self
    }

    pub fn trap(&self) -> &FaultTrapHandler {
        &self.trap
    }

    /// Classify a fault, running the fatal path when nothing claims it.
    ///
    /// On [`FaultDisposition::Fatal`] the caller must not resume the faulting
    /// code; shutdown has already been requested.
    pub fn deliver(&self, fault: FaultContext) -> FaultDisposition {
        let disposition = self.trap.classify(&fault);
        if disposition == FaultDisposition::Fatal {
            self.dump_diagnostics(&fault);
        }
        disposition
    }

    /// Dump state and request shutdown. Only the first call does anything.
    pub fn dump_diagnostics(&self, fault: &FaultContext) -> Option<FatalReport> {
        if self.dumped.swap(true, Ordering::SeqCst) {
            return None;
        }

        let report = FatalReport {
            fault: *fault,
            cpu_state: self.hooks.dump_cpu_state(),
            jit_state: if self.jit_debug {
                self.hooks.dump_jit_state()
            } else {
                None
            },
        };
        error!("{}", report);

        self.hooks.quit_full_screen();
        if self.monitor {
            self.hooks.enter_monitor();
        }
        self.hooks.request_shutdown();

        Some(report)
    }
}
