//! `espos` – supervisor for the espOS kernel core.
//!
//! Boots the kernel on the simulated platform and keeps it under watch:
//!
//! 1. Loads `~/.espos/config.toml` (or `--config PATH`) plus `ESPOS_*`
//!    environment overrides.
//! 2. Initialises the kernel and registers the idle task.  Init failures are
//!    fatal.
//! 3. Runs the [`HealthMonitor`] and prints a status line every monitor
//!    interval (`--json` for one JSON snapshot per line).
//! 4. On **Ctrl-C** stops the monitor, prints the final task and memory
//!    reports, and shuts the kernel down.

mod config;
mod telemetry;

use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use espos_hal::Platform;
use espos_kernel::{HealthMonitor, Kernel};
use espos_types::{SystemSnapshot, TaskSpec};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    let _telemetry = telemetry::init_tracing("espos");

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(e) => {
            eprintln!("{}: {}", "Argument error".red(), e);
            print_usage();
            std::process::exit(2);
        }
    };

    if !args.json {
        print_banner();
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let path = args.config.clone().unwrap_or_else(config::config_path);
    let cfg = match config::load_from(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            std::process::exit(1);
        }
    };
    info!(path = %path.display(), "configuration loaded");

    // ── Kernel ────────────────────────────────────────────────────────────
    let platform = Platform::simulated(cfg.kernel.heap_size);
    let kernel = match Kernel::init(cfg.kernel.clone(), platform) {
        Ok(kernel) => Arc::new(kernel),
        Err(e) => {
            error!(error = %e, "kernel init failed");
            eprintln!("{}: {}", "Kernel init failed".red().bold(), e);
            std::process::exit(1);
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let idle = {
        let shutdown = shutdown.clone();
        move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };
    if let Err(e) = kernel.create_task(TaskSpec::new("idle", cfg.idle_stack_size, 0), Box::new(idle)) {
        error!(error = %e, "failed to register idle task");
        eprintln!("{}: {}", "Idle task failed".red().bold(), e);
        std::process::exit(1);
    }

    if !args.json {
        println!(
            "  Kernel {} up. {} task slot(s), {} block slot(s), {} byte heap.",
            kernel.version().bold(),
            cfg.kernel.max_tasks,
            cfg.kernel.max_memory_blocks,
            cfg.kernel.heap_size
        );
        println!("  Press {} to stop.\n", "Ctrl-C".bold().cyan());
    }

    // ── Supervise ─────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Runtime error".red(), e);
            std::process::exit(1);
        }
    };
    runtime.block_on(supervise(
        kernel.clone(),
        cfg.kernel.monitor_interval(),
        shutdown.clone(),
        args.json,
    ));

    // ── Shutdown ──────────────────────────────────────────────────────────
    shutdown.store(true, Ordering::SeqCst);
    if !args.json {
        println!();
        println!("{}", "  Shutting down …".yellow().bold());
        print_final_reports(&kernel);
    }
    match kernel.shutdown() {
        Ok(()) => {
            if !args.json {
                println!("{}", "  ✓ Kernel shut down.".green());
            }
        }
        Err(e) => error!(error = %e, "kernel shutdown failed"),
    }
}

async fn supervise(kernel: Arc<Kernel>, interval: Duration, shutdown: Arc<AtomicBool>, json: bool) {
    let monitor = HealthMonitor::spawn(kernel.clone(), interval);
    let mut status = tokio::time::interval(interval);
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = status.tick() => {
                match kernel.snapshot() {
                    Ok(snapshot) => report(&snapshot, json),
                    Err(e) => warn!(error = %e, "status snapshot failed"),
                }
            }
            _ = poll.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    info!(samples = monitor.samples(), "stopping health monitor");
    monitor.stop().await;
}

fn report(snapshot: &SystemSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "snapshot serialisation failed"),
        }
    } else {
        println!("{}", status_line(snapshot));
    }
    if !snapshot.healthy {
        warn!(
            free_memory = snapshot.free_memory,
            "system unhealthy, restart recommended"
        );
    }
}

fn status_line(s: &SystemSnapshot) -> String {
    let health = if s.healthy {
        "HEALTHY".green().bold()
    } else {
        "LOW MEMORY".red().bold()
    };
    format!(
        "  [{}] up {}  tasks {}  free {} B (min {} B)  tracked {} B (peak {} B, {}/{} blocks)",
        health,
        format_uptime(s.uptime_secs),
        s.total_tasks,
        s.free_memory,
        s.min_free_memory,
        s.allocator.total_allocated,
        s.allocator.peak_allocated,
        s.allocator.blocks_in_use,
        s.allocator.block_capacity,
    )
}

/// `1d 02:03:04` style uptime; the day part only when non-zero.
fn format_uptime(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (h, m, s) = (rem / 3600, rem % 3600 / 60, rem % 60);
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

fn print_final_reports(kernel: &Kernel) {
    for report in [kernel.task_report(), kernel.memory_report(), kernel.memory_map()] {
        match report {
            Ok(text) => println!("{text}"),
            Err(e) => warn!(error = %e, "report unavailable"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    json: bool,
}

impl Args {
    /// `Ok(None)` means `--help` was requested.
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Option<Self>, String> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    let path = args
                        .next()
                        .ok_or_else(|| format!("{arg} requires a path"))?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--json" => parsed.json = true,
                "--help" | "-h" => return Ok(None),
                other => return Err(format!("unknown argument '{other}'")),
            }
        }
        Ok(Some(parsed))
    }
}

fn print_usage() {
    println!("Usage: espos [--config PATH] [--json]");
    println!();
    println!("  --config PATH   Config file (default ~/.espos/config.toml)");
    println!("  --json          Print one JSON status snapshot per interval");
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                   ____  _____"#.bold().cyan());
    println!("{}", r#"   ___  _________ / __ \/ ___/"#.bold().cyan());
    println!("{}", r#"  / _ \/ ___/ __ \/ / / /\__ \ "#.bold().cyan());
    println!("{}", r#" /  __(__  ) /_/ / /_/ /___/ / "#.bold().cyan());
    println!("{}", r#" \___/____/ .___/\____//____/  "#.bold().cyan());
    println!("{}", r#"          /_/                  "#.bold().cyan());
    println!();
}
