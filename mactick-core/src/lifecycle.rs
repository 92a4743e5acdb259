//! Startup and shutdown ordering
//!
//! Startup: tick thread, then XPRAM snapshot and watchdog thread, then the
//! CPU. Shutdown runs the other way round and joins both threads before the
//! shared state can go away. Shutdown is idempotent and safe after a partial
//! startup.

use crate::alert::Alerts;
use crate::clock::{CancelToken, Clock, SystemClock};
use crate::config::TimingConfig;
use crate::error::{TimingError, TimingResult};
use crate::interrupt::InterruptRegister;
use crate::machine::{CpuCore, GuestMachine};
use crate::tick::{InterruptTicker, TickScheduler, TickStats};
use crate::watchdog::{PersistSink, WatchdogStats, WatchdogTimer, WatchedBuffer};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Extra wait on top of a loop's own cancellation latency before giving up
/// on a join.
const JOIN_SLACK: Duration = Duration::from_millis(250);

// ============================================================================
// Background thread
// ============================================================================

#[derive(Default)]
struct ExitSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ExitSignal {
    fn set(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// True if the thread finished within `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }
}

/// Raises the exit signal even if the thread body panics.
struct SignalOnDrop(Arc<ExitSignal>);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// Named worker thread with a cancellation token and a bounded join.
pub struct BackgroundThread<T> {
    name: &'static str,
    cancel: CancelToken,
    exit: Arc<ExitSignal>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> BackgroundThread<T> {
    pub fn spawn<F>(name: &'static str, body: F) -> TimingResult<Self>
    where
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let cancel = CancelToken::new();
        let exit = Arc::new(ExitSignal::default());

        let token = cancel.clone();
        let signal = exit.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = SignalOnDrop(signal);
                body(&token)
            })
            .map_err(|source| TimingError::ThreadSpawn { name, source })?;

        debug!("{} thread started", name);
        Ok(Self {
            name,
            cancel,
            exit,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Cancel and join, waiting at most `timeout` for the loop to notice.
    ///
    /// Returns the thread's result, or `None` if it was already stopped,
    /// panicked, or had to be detached after the timeout.
    pub fn stop(&mut self, timeout: Duration) -> Option<T> {
        let handle = self.handle.take()?;
        self.cancel.cancel();

        if !self.exit.wait(timeout) {
            warn!("{} thread did not exit within {:?}, detaching", self.name, timeout);
            return None;
        }

        match handle.join() {
            Ok(out) => {
                debug!("{} thread stopped", self.name);
                Some(out)
            }
            Err(_) => {
                error!("{} thread panicked", self.name);
                None
            }
        }
    }
}

impl<T> Drop for BackgroundThread<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
        }
    }
}

// ============================================================================
// Timing subsystem
// ============================================================================

/// State shared between the timing threads and the emulated machine.
#[derive(Clone)]
pub struct TimingContext {
    pub interrupts: Arc<InterruptRegister>,
    pub xpram: WatchedBuffer,
    pub machine: Arc<dyn GuestMachine>,
    pub persist: Arc<dyn PersistSink>,
}

/// Owns the tick and XPRAM watchdog threads.
pub struct TimingSubsystem {
    ctx: TimingContext,
    config: TimingConfig,
    clock: Arc<dyn Clock>,
    tick: Option<BackgroundThread<TickStats>>,
    watchdog: Option<BackgroundThread<WatchdogStats>>,
    tick_stats: Option<TickStats>,
    watchdog_stats: Option<WatchdogStats>,
}

impl TimingSubsystem {
    pub fn new(ctx: TimingContext, config: TimingConfig) -> Self {
        Self::with_clock(ctx, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(ctx: TimingContext, config: TimingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ctx,
            config,
            clock,
            tick: None,
            watchdog: None,
            tick_stats: None,
            watchdog_stats: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.tick.is_some() || self.watchdog.is_some()
    }

    /// Start the tick thread, then snapshot XPRAM and start the watchdog.
    ///
    /// If the watchdog cannot be started the tick thread is stopped again
    /// before the error is returned.
    pub fn initialize(&mut self) -> TimingResult<()> {
        if self.is_running() {
            return Err(TimingError::AlreadyRunning);
        }

        let scheduler = TickScheduler::new(self.clock.clone(), &self.config);
        let mut ticker = InterruptTicker::new(
            self.ctx.interrupts.clone(),
            self.ctx.machine.clone(),
            self.config.guest_time_addr,
        );
        let tick = BackgroundThread::spawn("tick", move |cancel| {
            scheduler.run(&mut ticker, cancel)
        })?;
        self.tick = Some(tick);
        info!("60Hz thread started");

        let mut watchdog = WatchdogTimer::new(
            self.clock.clone(),
            self.ctx.xpram.clone(),
            self.ctx.persist.clone(),
            &self.config,
        );
        match BackgroundThread::spawn("xpram", move |cancel| watchdog.run(cancel)) {
            Ok(thread) => self.watchdog = Some(thread),
            Err(e) => {
                self.shutdown();
                return Err(e);
            }
        }
        info!("XPRAM watchdog started");

        Ok(())
    }

    /// [`Self::initialize`] for callers that only need success or failure.
    pub fn initialize_timing_subsystem(&mut self) -> bool {
        match self.initialize() {
            Ok(()) => true,
            Err(e) => {
                error!("Timing subsystem failed to start: {}", e);
                false
            }
        }
    }

    /// Stop the tick thread, then the watchdog. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(mut tick) = self.tick.take() {
            let timeout = self.config.tick_period() + JOIN_SLACK;
            if let Some(stats) = tick.stop(timeout) {
                info!(
                    "60Hz thread stopped after {} ticks ({:.2} Hz)",
                    stats.ticks,
                    stats.rate()
                );
                self.tick_stats = Some(stats);
            }
        }

        if let Some(mut watchdog) = self.watchdog.take() {
            let timeout = self.config.watchdog_quantum() + JOIN_SLACK;
            if let Some(stats) = watchdog.stop(timeout) {
                info!("XPRAM watchdog stopped, {} saves", stats.persisted);
                self.watchdog_stats = Some(stats);
            }
        }
    }

    pub fn shutdown_timing_subsystem(&mut self) {
        self.shutdown();
    }

    /// Results of the last stopped tick loop.
    pub fn tick_stats(&self) -> Option<TickStats> {
        self.tick_stats
    }

    /// Results of the last stopped watchdog loop.
    pub fn watchdog_stats(&self) -> Option<WatchdogStats> {
        self.watchdog_stats
    }
}

impl Drop for TimingSubsystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Emulator session
// ============================================================================

/// Full run: timing threads around one CPU run.
pub struct EmulatorSession {
    timing: TimingSubsystem,
    alerts: Alerts,
}

impl EmulatorSession {
    pub fn new(timing: TimingSubsystem, alerts: Alerts) -> Self {
        Self { timing, alerts }
    }

    pub fn timing(&self) -> &TimingSubsystem {
        &self.timing
    }

    /// Start timing, run the CPU until it returns, then tear down.
    pub fn run(&mut self, cpu: &mut dyn CpuCore) -> TimingResult<()> {
        if let Err(e) = self.timing.initialize() {
            self.alerts.error(&format!("Cannot start timing threads: {}", e));
            return Err(e);
        }

        info!("Starting emulation...");
        cpu.start();
        self.quit(cpu);
        Ok(())
    }

    /// Leave CPU emulation, then stop the timing threads.
    pub fn quit(&mut self, cpu: &mut dyn CpuCore) {
        debug!("Quitting emulator");
        cpu.exit();
        self.timing.shutdown();
    }
}
