//! Shared interrupt flag register
//!
//! One word of pending-interrupt bits. The tick thread raises bits, the
//! emulated CPU polls the register and clears each bit after servicing it.
//! Every access goes through a single mutex, held only for the bit
//! operation itself.

use parking_lot::Mutex;

/// 60.15 Hz tick pending
pub const TICK_INTERRUPT: u32 = 1 << 0;
/// 1 Hz clock pending
pub const SECOND_INTERRUPT: u32 = 1 << 1;

/// Process-wide pending-interrupt bits.
#[derive(Debug, Default)]
pub struct InterruptRegister {
    flags: Mutex<u32>,
}

impl InterruptRegister {
    /// Register starting with no bits pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `flag_bits` into the register.
    pub fn set(&self, flag_bits: u32) {
        *self.flags.lock() |= flag_bits;
    }

    /// Remove `flag_bits` from the register.
    pub fn clear(&self, flag_bits: u32) {
        *self.flags.lock() &= !flag_bits;
    }

    /// Current value of the register.
    pub fn snapshot(&self) -> u32 {
        *self.flags.lock()
    }

    /// Whether any of `flag_bits` is pending.
    pub fn is_pending(&self, flag_bits: u32) -> bool {
        self.snapshot() & flag_bits != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_flag_bits_distinct() {
        assert_eq!(TICK_INTERRUPT & SECOND_INTERRUPT, 0);
        assert_ne!(TICK_INTERRUPT, 0);
        assert_ne!(SECOND_INTERRUPT, 0);
    }

    #[test]
    fn test_set_and_clear() {
        let reg = InterruptRegister::new();
        assert_eq!(reg.snapshot(), 0);

        reg.set(TICK_INTERRUPT);
        reg.set(SECOND_INTERRUPT);
        assert_eq!(reg.snapshot(), TICK_INTERRUPT | SECOND_INTERRUPT);

        reg.clear(TICK_INTERRUPT);
        assert!(!reg.is_pending(TICK_INTERRUPT));
        assert!(reg.is_pending(SECOND_INTERRUPT));

        // Clearing an unset bit is a no-op
        reg.clear(TICK_INTERRUPT);
        assert_eq!(reg.snapshot(), SECOND_INTERRUPT);
    }

    #[test]
    fn test_concurrent_set_clear_no_lost_updates() {
        // Each thread owns one bit and toggles it many times, ending set for
        // even thread ids and clear for odd ones. Any lost update would leave
        // a bit in the wrong final state.
        let reg = Arc::new(InterruptRegister::new());
        let threads: Vec<_> = (0..16u32)
            .map(|id| {
                let reg = reg.clone();
                thread::spawn(move || {
                    let bit = 1u32 << id;
                    for _ in 0..10_000 {
                        reg.set(bit);
                        reg.clear(bit);
                    }
                    if id % 2 == 0 {
                        reg.set(bit);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        let expected = (0..16u32).filter(|id| id % 2 == 0).fold(0, |acc, id| acc | (1 << id));
        assert_eq!(reg.snapshot(), expected);
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        let reg = Arc::new(InterruptRegister::new());
        let producers: Vec<_> = [TICK_INTERRUPT, SECOND_INTERRUPT]
            .into_iter()
            .map(|bit| {
                let reg = reg.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        reg.set(bit);
                    }
                })
            })
            .collect();

        let consumer = {
            let reg = reg.clone();
            thread::spawn(move || {
                for _ in 0..5_000 {
                    let pending = reg.snapshot();
                    // Never observe bits outside the two that exist
                    assert_eq!(pending & !(TICK_INTERRUPT | SECOND_INTERRUPT), 0);
                    reg.clear(pending);
                }
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();

        reg.set(TICK_INTERRUPT | SECOND_INTERRUPT);
        assert_eq!(reg.snapshot(), TICK_INTERRUPT | SECOND_INTERRUPT);
    }
}
