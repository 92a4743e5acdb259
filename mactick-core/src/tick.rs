//! 60.15 Hz tick scheduler
//!
//! Drives the guest's vertical-retrace style interrupt and its 1 Hz clock.
//!
//! ## Scheduling
//!
//! The wake time advances by a fixed 16625 us every tick no matter when the
//! thread actually woke, so short oversleeps are absorbed by the next, shorter
//! sleep and the long-run rate does not drift. When the loop falls further
//! behind than the resync threshold (host suspended, debugger stop) it drops
//! the missed ticks and restarts the grid from "now" instead of firing them
//! back to back.

use crate::clock::{CancelToken, Clock};
use crate::config::TimingConfig;
use crate::interrupt::{InterruptRegister, SECOND_INTERRUPT, TICK_INTERRUPT};
use crate::mac_time;
use crate::machine::GuestMachine;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Receives the events produced by [`TickScheduler::run`].
pub trait TickHandler: Send {
    /// One nominal tick.
    fn on_tick(&mut self);

    /// Every `ticks_per_second`-th tick, after that tick's [`Self::on_tick`].
    fn on_second(&mut self);
}

// ============================================================================
// Tick State
// ============================================================================

/// Counter toward the next one-second event and the next wake deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickState {
    pub counter: u32,
    pub next_wake: Duration,
}

impl TickState {
    pub fn new(now: Duration) -> Self {
        Self {
            counter: 0,
            next_wake: now,
        }
    }

    /// Count one tick. Returns true when a one-second boundary is reached.
    pub fn count(&mut self, ticks_per_second: u32) -> bool {
        self.counter += 1;
        if self.counter >= ticks_per_second {
            self.counter = 0;
            true
        } else {
            false
        }
    }
}

/// Summary of a finished tick loop
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickStats {
    pub ticks: u64,
    pub seconds: u64,
    pub resyncs: u64,
    pub elapsed: Duration,
}

impl TickStats {
    /// Measured ticks per second.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ticks as f64 / secs
        } else {
            0.0
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drift-corrected periodic tick loop.
pub struct TickScheduler<C: Clock> {
    clock: C,
    period: Duration,
    resync_threshold: Duration,
    ticks_per_second: u32,
}

impl<C: Clock> TickScheduler<C> {
    pub fn new(clock: C, config: &TimingConfig) -> Self {
        Self {
            clock,
            period: config.tick_period(),
            resync_threshold: config.resync_threshold(),
            ticks_per_second: config.ticks_per_second.max(1),
        }
    }

    /// Tick until `cancel` is set. Cancellation is checked before each tick,
    /// so no tick fires after it is observed.
    pub fn run<H: TickHandler + ?Sized>(&self, handler: &mut H, cancel: &CancelToken) -> TickStats {
        let start = self.clock.now();
        let mut state = TickState::new(start);
        let mut stats = TickStats::default();

        while !cancel.is_cancelled() {
            handler.on_tick();
            stats.ticks += 1;

            if state.count(self.ticks_per_second) {
                handler.on_second();
                stats.seconds += 1;
            }

            state.next_wake += self.period;
            let now = self.clock.now();
            if state.next_wake > now {
                self.clock.sleep(state.next_wake - now);
            } else if now - state.next_wake > self.resync_threshold {
                debug!("Tick loop {:?} behind, resynchronising", now - state.next_wake);
                state.next_wake = now;
                stats.resyncs += 1;
            }
        }

        stats.elapsed = self.clock.now() - start;
        debug!("{} ticks in {:?} = {:.3} ticks/sec", stats.ticks, stats.elapsed, stats.rate());
        stats
    }
}

// ============================================================================
// Guest interrupt handler
// ============================================================================

/// Production handler: raises guest interrupts and updates the guest clock.
pub struct InterruptTicker {
    interrupts: Arc<InterruptRegister>,
    machine: Arc<dyn GuestMachine>,
    time_addr: u32,
}

impl InterruptTicker {
    pub fn new(
        interrupts: Arc<InterruptRegister>,
        machine: Arc<dyn GuestMachine>,
        time_addr: u32,
    ) -> Self {
        Self {
            interrupts,
            machine,
            time_addr,
        }
    }
}

impl TickHandler for InterruptTicker {
    fn on_tick(&mut self) {
        if self.machine.tick_interrupts_enabled() {
            self.interrupts.set(TICK_INTERRUPT);
            self.machine.trigger_interrupt();
        }
    }

    fn on_second(&mut self) {
        self.machine.write_long(self.time_addr, mac_time::mac_seconds_now());
        self.interrupts.set(SECOND_INTERRUPT);
        self.machine.trigger_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const PERIOD: Duration = Duration::from_micros(16625);

    /// Records tick timestamps; can jump the clock or cancel at given ticks.
    struct Recorder {
        clock: ManualClock,
        cancel: CancelToken,
        stop_after: usize,
        jump_at: Option<(usize, Duration)>,
        ticks: Vec<Duration>,
        seconds_at_tick: Vec<usize>,
    }

    impl Recorder {
        fn new(clock: &ManualClock, cancel: &CancelToken, stop_after: usize) -> Self {
            Self {
                clock: clock.clone(),
                cancel: cancel.clone(),
                stop_after,
                jump_at: None,
                ticks: Vec::new(),
                seconds_at_tick: Vec::new(),
            }
        }
    }

    impl TickHandler for Recorder {
        fn on_tick(&mut self) {
            self.ticks.push(self.clock.now());
            if let Some((at, by)) = self.jump_at {
                if self.ticks.len() == at {
                    self.clock.advance(by);
                }
            }
            if self.ticks.len() >= self.stop_after {
                self.cancel.cancel();
            }
        }

        fn on_second(&mut self) {
            self.seconds_at_tick.push(self.ticks.len());
        }
    }

    fn scheduler(clock: &ManualClock) -> TickScheduler<ManualClock> {
        TickScheduler::new(clock.clone(), &TimingConfig::default())
    }

    #[test]
    fn test_tick_state_counts_to_boundary() {
        let mut state = TickState::new(Duration::ZERO);
        for _ in 0..59 {
            assert!(!state.count(60));
        }
        assert!(state.count(60));
        assert_eq!(state.counter, 0);
    }

    #[test]
    fn test_600_ticks_give_10_seconds() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let mut rec = Recorder::new(&clock, &cancel, 600);

        let stats = scheduler(&clock).run(&mut rec, &cancel);

        assert_eq!(stats.ticks, 600);
        assert_eq!(stats.seconds, 10);
        assert_eq!(stats.resyncs, 0);
        assert_eq!(rec.seconds_at_tick, (1..=10usize).map(|s| s * 60).collect::<Vec<_>>());
        for pair in rec.seconds_at_tick.windows(2) {
            assert_eq!(pair[1] - pair[0], 60);
        }

        // Zero jitter: tick n fires exactly at n periods
        for (n, t) in rec.ticks.iter().enumerate() {
            assert_eq!(*t, PERIOD * n as u32);
        }
    }

    #[test]
    fn test_rate_is_60_15_hz() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let mut rec = Recorder::new(&clock, &cancel, 6015);

        let stats = scheduler(&clock).run(&mut rec, &cancel);
        // The loop sleeps once more after the last tick
        assert_eq!(stats.elapsed, PERIOD * 6015);
        assert!((stats.rate() - 60.150).abs() < 0.001);
    }

    #[test]
    fn test_suspend_resyncs_without_burst() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let mut rec = Recorder::new(&clock, &cancel, 200);
        rec.jump_at = Some((100, Duration::from_secs(5)));

        let stats = scheduler(&clock).run(&mut rec, &cancel);
        assert_eq!(stats.resyncs, 1);

        let resumed = PERIOD * 99 + Duration::from_secs(5);
        let compensating = rec
            .ticks
            .iter()
            .filter(|t| **t >= resumed && **t < resumed + PERIOD)
            .count();
        assert!(compensating <= 1);

        // Regular cadence restarts from the resume point
        assert_eq!(rec.ticks[100], resumed);
        assert_eq!(rec.ticks[101], resumed + PERIOD);
        assert_eq!(rec.ticks[150], resumed + PERIOD * 50);
    }

    #[test]
    fn test_small_lateness_catches_up_on_grid() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let mut rec = Recorder::new(&clock, &cancel, 20);
        // Tick 11 runs 20 ms long: 3.375 ms behind, under the threshold
        rec.jump_at = Some((11, Duration::from_millis(20)));

        let stats = scheduler(&clock).run(&mut rec, &cancel);
        assert_eq!(stats.resyncs, 0);
        assert_eq!(rec.ticks[11], PERIOD * 10 + Duration::from_millis(20));
        assert_eq!(rec.ticks[12], PERIOD * 12);
    }

    #[test]
    fn test_resync_threshold_is_configurable() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let mut rec = Recorder::new(&clock, &cancel, 20);
        rec.jump_at = Some((11, Duration::from_millis(20)));

        let config = TimingConfig {
            resync_threshold_us: 0,
            ..Default::default()
        };
        let stats = TickScheduler::new(clock.clone(), &config).run(&mut rec, &cancel);
        assert_eq!(stats.resyncs, 1);
        let late = PERIOD * 10 + Duration::from_millis(20);
        assert_eq!(rec.ticks[11], late);
        assert_eq!(rec.ticks[12], late + PERIOD);
    }

    #[test]
    fn test_cancelled_before_start_never_ticks() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut rec = Recorder::new(&clock, &cancel, usize::MAX);

        let stats = scheduler(&clock).run(&mut rec, &cancel);
        assert_eq!(stats.ticks, 0);
        assert!(rec.ticks.is_empty());
    }

    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeMachine {
        booted: AtomicBool,
        triggers: AtomicU32,
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl GuestMachine for FakeMachine {
        fn write_long(&self, addr: u32, value: u32) {
            self.writes.lock().push((addr, value));
        }

        fn trigger_interrupt(&self) {
            self.triggers.fetch_add(1, Ordering::SeqCst);
        }

        fn tick_interrupts_enabled(&self) -> bool {
            self.booted.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_interrupt_ticker_gates_tick_before_boot() {
        let reg = Arc::new(InterruptRegister::new());
        let machine = Arc::new(FakeMachine::default());
        let mut ticker = InterruptTicker::new(reg.clone(), machine.clone(), 0x20C);

        ticker.on_tick();
        assert_eq!(reg.snapshot(), 0);
        assert_eq!(machine.triggers.load(Ordering::SeqCst), 0);

        // The 1 Hz clock runs even before boot
        ticker.on_second();
        assert_eq!(reg.snapshot(), SECOND_INTERRUPT);
        let writes = machine.writes.lock().clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0x20C);
        assert!(writes[0].1 > 0);

        machine.booted.store(true, Ordering::SeqCst);
        ticker.on_tick();
        assert_eq!(reg.snapshot(), SECOND_INTERRUPT | TICK_INTERRUPT);
        assert_eq!(machine.triggers.load(Ordering::SeqCst), 2);
    }
}
