//! Stand-in emulated machine
//!
//! No 68k here: the "CPU" is a polling loop that services the interrupt
//! register the way the real core's interrupt check does, and pokes XPRAM
//! now and then so the watchdog has something to save.

use mactick_core::fault::DiagnosticHooks;
use mactick_core::{
    CpuCore, GuestMachine, InterruptRegister, WatchedBuffer, SECOND_INTERRUPT, TICK_INTERRUPT,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Low memory mirrored by the stand-in machine
const LOW_MEM_SIZE: usize = 0x1000;

/// Guest memory and the flags the tick thread touches.
pub struct HeadlessMachine {
    low_mem: Mutex<Vec<u8>>,
    irq_pending: AtomicBool,
    booted: AtomicBool,
}

impl HeadlessMachine {
    pub fn new() -> Self {
        Self {
            low_mem: Mutex::new(vec![0; LOW_MEM_SIZE]),
            irq_pending: AtomicBool::new(false),
            booted: AtomicBool::new(false),
        }
    }

    pub fn read_long(&self, addr: u32) -> u32 {
        let mem = self.low_mem.lock();
        let a = addr as usize;
        match mem.get(a..a + 4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    pub fn set_booted(&self) {
        self.booted.store(true, Ordering::SeqCst);
    }

    fn take_irq(&self) -> bool {
        self.irq_pending.swap(false, Ordering::SeqCst)
    }
}

impl Default for HeadlessMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestMachine for HeadlessMachine {
    fn write_long(&self, addr: u32, value: u32) {
        let mut mem = self.low_mem.lock();
        let a = addr as usize;
        if let Some(dst) = mem.get_mut(a..a + 4) {
            dst.copy_from_slice(&value.to_be_bytes());
        }
    }

    fn trigger_interrupt(&self) {
        self.irq_pending.store(true, Ordering::SeqCst);
    }

    fn tick_interrupts_enabled(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }
}

// ============================================================================
// CPU stand-in
// ============================================================================

/// Interrupts serviced by the stand-in CPU
#[derive(Debug, Default)]
pub struct CpuStats {
    pub ticks: AtomicU64,
    pub seconds: AtomicU64,
    pub xpram_writes: AtomicU64,
}

pub struct HeadlessCpu {
    machine: Arc<HeadlessMachine>,
    interrupts: Arc<InterruptRegister>,
    xpram: WatchedBuffer,
    quit: Arc<AtomicBool>,
    run_for: Duration,
    boot_delay: Duration,
    /// Touch XPRAM every this many guest seconds
    xpram_every: u64,
    stats: Arc<CpuStats>,
}

impl HeadlessCpu {
    pub fn new(
        machine: Arc<HeadlessMachine>,
        interrupts: Arc<InterruptRegister>,
        xpram: WatchedBuffer,
        quit: Arc<AtomicBool>,
        run_for: Duration,
    ) -> Self {
        Self {
            machine,
            interrupts,
            xpram,
            quit,
            run_for,
            boot_delay: Duration::from_millis(500),
            xpram_every: 5,
            stats: Arc::new(CpuStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CpuStats> {
        self.stats.clone()
    }

    /// Service every pending bit, like the 68k interrupt check.
    fn service_interrupts(&self) {
        let pending = self.interrupts.snapshot();

        if pending & TICK_INTERRUPT != 0 {
            self.interrupts.clear(TICK_INTERRUPT);
            self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        }

        if pending & SECOND_INTERRUPT != 0 {
            self.interrupts.clear(SECOND_INTERRUPT);
            let seconds = self.stats.seconds.fetch_add(1, Ordering::Relaxed) + 1;
            if seconds % self.xpram_every == 0 {
                // Bump the boot count byte
                let count = self.xpram.read_byte(0x77).wrapping_add(1);
                self.xpram.write_byte(0x77, count);
                self.stats.xpram_writes.fetch_add(1, Ordering::Relaxed);
                debug!("Guest second {}: XPRAM[0x77] = {}", seconds, count);
            }
        }
    }
}

impl CpuCore for HeadlessCpu {
    fn start(&mut self) {
        let start = Instant::now();
        while !self.quit.load(Ordering::SeqCst) && start.elapsed() < self.run_for {
            if start.elapsed() >= self.boot_delay {
                self.machine.set_booted();
            }
            if self.machine.take_irq() {
                self.service_interrupts();
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn exit(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Fatal fault hooks: dump what little state there is, then stop the CPU.
pub struct HostDiagnostics {
    machine: Arc<HeadlessMachine>,
    quit: Arc<AtomicBool>,
    time_addr: u32,
}

impl HostDiagnostics {
    pub fn new(machine: Arc<HeadlessMachine>, quit: Arc<AtomicBool>, time_addr: u32) -> Self {
        Self {
            machine,
            quit,
            time_addr,
        }
    }
}

impl DiagnosticHooks for HostDiagnostics {
    fn dump_cpu_state(&self) -> String {
        format!(
            "Time=${:08X} booted={}",
            self.machine.read_long(self.time_addr),
            self.machine.tick_interrupts_enabled()
        )
    }

    fn request_shutdown(&self) {
        info!("Shutdown requested after fatal fault");
        self.quit.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_long_big_endian() {
        let machine = HeadlessMachine::new();
        machine.write_long(0x20C, 0xB0DE_CAFE);
        assert_eq!(machine.read_long(0x20C), 0xB0DE_CAFE);
        assert_eq!(machine.low_mem.lock()[0x20C], 0xB0);

        // Past the end: dropped
        machine.write_long(LOW_MEM_SIZE as u32 - 2, 1);
        assert_eq!(machine.read_long(LOW_MEM_SIZE as u32 - 2), 0);
    }

    #[test]
    fn test_service_clears_bits_and_touches_xpram() {
        let machine = Arc::new(HeadlessMachine::new());
        let interrupts = Arc::new(InterruptRegister::new());
        let xpram = WatchedBuffer::new(0x100);
        let mut cpu = HeadlessCpu::new(
            machine,
            interrupts.clone(),
            xpram.clone(),
            Arc::new(AtomicBool::new(false)),
            Duration::ZERO,
        );
        cpu.xpram_every = 1;

        interrupts.set(TICK_INTERRUPT | SECOND_INTERRUPT);
        cpu.service_interrupts();

        assert_eq!(interrupts.snapshot(), 0);
        assert_eq!(cpu.stats.ticks.load(Ordering::Relaxed), 1);
        assert_eq!(xpram.read_byte(0x77), 1);
    }

    #[test]
    fn test_fatal_hook_stops_cpu() {
        let machine = Arc::new(HeadlessMachine::new());
        let quit = Arc::new(AtomicBool::new(false));
        let hooks = HostDiagnostics::new(machine, quit.clone(), 0x20C);
        assert!(hooks.dump_cpu_state().starts_with("Time=$00000000"));
        hooks.request_shutdown();
        assert!(quit.load(Ordering::SeqCst));
    }
}
