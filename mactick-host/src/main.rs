//! # MacTick Host
//!
//! Headless driver for the timing core. Runs the tick and XPRAM watchdog
//! threads against a stand-in machine for a fixed time, then prints what
//! happened as JSON.
//!
//! ## Usage
//! ```bash
//! mactick --seconds 10 --xpram ./XPRAM
//!
//! # With debug logging
//! RUST_LOG=debug mactick --config mactick.json
//! ```

mod headless;

use anyhow::{bail, Context, Result};
use headless::{HeadlessCpu, HeadlessMachine, HostDiagnostics};
use mactick_core::alert::Alerts;
use mactick_core::persist::XpramFile;
use mactick_core::{
    EmulatorSession, FaultContext, FaultDispatcher, FaultDisposition, FaultTrapHandler,
    InterruptRegister, RomRange, TimingConfig, TimingContext, TimingSubsystem, WatchedBuffer,
    XPRAM_SIZE,
};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Size of the stand-in ROM image
const ROM_SIZE: usize = 0x80000;

/// Faulting instructions can be skipped where the decoder exists.
const SKIP_SUPPORTED: bool = cfg!(any(target_arch = "x86", target_arch = "x86_64"));

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct AppOptions {
    config: Option<PathBuf>,
    xpram: PathBuf,
    seconds: u64,
    nogui: bool,
    ignore_segv: bool,
    /// Deliver an unclaimed fault halfway through the run
    wild_fault: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            config: None,
            xpram: PathBuf::from("XPRAM"),
            seconds: 5,
            nogui: false,
            ignore_segv: false,
            wild_fault: false,
        }
    }
}

impl AppOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut opts = Self::default();
        let mut iter = args.iter().skip(1);

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => {
                    let path = iter.next().context("--config needs a file")?;
                    opts.config = Some(PathBuf::from(path));
                }
                "--xpram" => {
                    let path = iter.next().context("--xpram needs a file")?;
                    opts.xpram = PathBuf::from(path);
                }
                "--seconds" => {
                    let n = iter.next().context("--seconds needs a number")?;
                    opts.seconds = n
                        .parse()
                        .with_context(|| format!("Invalid --seconds value: {}", n))?;
                }
                "--nogui" => opts.nogui = true,
                "--ignoresegv" => opts.ignore_segv = true,
                "--wild-fault" => opts.wild_fault = true,
                other => bail!("Unknown argument: {}", other),
            }
        }

        Ok(opts)
    }

    /// Command line flags win over the config file.
    fn timing_config(&self) -> Result<TimingConfig> {
        let mut config = match &self.config {
            Some(path) => TimingConfig::load(path)?,
            None => TimingConfig::default(),
        };
        config.nogui |= self.nogui;
        config.ignore_segv |= self.ignore_segv;
        Ok(config)
    }
}

fn print_usage() {
    eprintln!(
        "Usage: mactick [--config FILE] [--xpram FILE] [--seconds N] [--nogui] [--ignoresegv] [--wild-fault]"
    );
}

// ============================================================================
// Run
// ============================================================================

fn describe(disposition: FaultDisposition) -> &'static str {
    match disposition {
        FaultDisposition::Handled => "handled",
        FaultDisposition::SkipInstruction => "skip",
        FaultDisposition::Fatal => "fatal",
    }
}

fn run(opts: &AppOptions) -> Result<serde_json::Value> {
    let config = opts.timing_config()?;
    let prefs = Arc::new(config.runtime_prefs());

    let xpram = WatchedBuffer::new(XPRAM_SIZE);
    let xpram_file = XpramFile::new(opts.xpram.clone());
    if !xpram_file
        .load_into(&xpram)
        .with_context(|| format!("Failed to read {:?}", xpram_file.path()))?
    {
        info!("Starting with blank XPRAM");
    }

    let machine = Arc::new(HeadlessMachine::new());
    let interrupts = Arc::new(InterruptRegister::new());
    let quit = Arc::new(AtomicBool::new(false));

    // Fault trap over a stand-in ROM image
    let rom = vec![0u8; ROM_SIZE];
    let rom_base = rom.as_ptr() as usize;
    let trap = FaultTrapHandler::new(
        RomRange::new(rom_base, ROM_SIZE),
        SKIP_SUPPORTED,
        prefs.clone(),
    );
    let hooks = Arc::new(HostDiagnostics::new(
        machine.clone(),
        quit.clone(),
        config.guest_time_addr,
    ));
    let dispatcher = Arc::new(
        FaultDispatcher::new(trap, hooks)
            .with_jit_debug(config.jit_debug)
            .with_monitor(config.monitor),
    );

    let rom_write = dispatcher.trap().classify_fault(rom_base + 0x2A, Some(0x4000_1000));
    info!("ROM write fault: {}", describe(rom_write));

    let ctx = TimingContext {
        interrupts: interrupts.clone(),
        xpram: xpram.clone(),
        machine: machine.clone(),
        persist: Arc::new(xpram_file),
    };
    let timing = TimingSubsystem::new(ctx, config.clone());
    let mut session = EmulatorSession::new(timing, Alerts::headless(prefs));

    let run_for = Duration::from_secs(opts.seconds);
    let mut cpu = HeadlessCpu::new(machine.clone(), interrupts, xpram, quit, run_for);
    let cpu_stats = cpu.stats();

    let wild_fault_thread = if opts.wild_fault {
        let dispatcher = dispatcher.clone();
        Some(std::thread::spawn(move || {
            std::thread::sleep(run_for / 2);
            dispatcher.deliver(FaultContext::new(0x10, None))
        }))
    } else {
        None
    };

    let started = Instant::now();
    session.run(&mut cpu)?;
    let wall = started.elapsed();

    let wild = match wild_fault_thread {
        Some(handle) => match handle.join() {
            Ok(d) => Some(describe(d)),
            Err(_) => {
                warn!("Wild fault thread panicked");
                None
            }
        },
        None => None,
    };

    let timing = session.timing();
    let tick = timing.tick_stats().unwrap_or_default();
    let watchdog = timing.watchdog_stats().unwrap_or_default();

    Ok(json!({
        "wall_secs": wall.as_secs_f64(),
        "tick": {
            "ticks": tick.ticks,
            "seconds": tick.seconds,
            "resyncs": tick.resyncs,
            "rate_hz": tick.rate(),
        },
        "cpu": {
            "ticks_serviced": cpu_stats.ticks.load(Ordering::Relaxed),
            "seconds_serviced": cpu_stats.seconds.load(Ordering::Relaxed),
            "xpram_writes": cpu_stats.xpram_writes.load(Ordering::Relaxed),
        },
        "watchdog": {
            "checks": watchdog.checks,
            "persisted": watchdog.persisted,
            "failed": watchdog.failed,
        },
        "guest_time": machine.read_long(config.guest_time_addr),
        "faults": {
            "rom_write": describe(rom_write),
            "wild_write": wild,
        },
    }))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mactick=info".parse()?)
                .add_directive("mactick_core=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    let opts = match AppOptions::from_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };

    info!("MacTick v{} starting...", mactick_core::VERSION);

    let summary = run(&opts)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
