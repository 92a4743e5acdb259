//! Boundary to the emulated machine
//!
//! The timing core never decodes instructions or owns guest memory. It talks
//! to the CPU emulator through these traits.

/// Guest-side operations the tick thread needs.
///
/// Called from the tick thread while the CPU runs on another thread, so
/// implementations must be thread safe.
pub trait GuestMachine: Send + Sync {
    /// Store a big-endian long into guest memory.
    fn write_long(&self, addr: u32, value: u32);

    /// Ask the CPU to look at the interrupt register at its next check.
    fn trigger_interrupt(&self);

    /// Whether 60 Hz interrupts may be delivered yet.
    ///
    /// Classic ROMs must not see tick interrupts before the guest OS has
    /// finished booting.
    fn tick_interrupts_enabled(&self) -> bool {
        true
    }
}

/// CPU emulator run control.
pub trait CpuCore {
    /// Run the CPU until it stops or [`CpuCore::exit`] is requested.
    fn start(&mut self);

    /// Leave CPU emulation.
    fn exit(&mut self);
}
