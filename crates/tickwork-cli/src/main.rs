//! CLI entry point for tickwork.
//!
//! This binary plays the part of the bounded-compute host: it builds one
//! kernel, installs the demonstration workload and invokes the scheduler once
//! per simulated tick.

mod cli;
mod config;
mod helpers;
mod workload;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tickwork_kernel::{Kernel, ManualClock, PassReport};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::HostConfig;
use crate::helpers::init_tracing;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            ticks,
            interval_ms,
            config,
            json,
        } => cmd_run(config, ticks, interval_ms, json).await,
        Commands::Config { config } => cmd_config(config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<PathBuf>,
    ticks: Option<u64>,
    interval_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    // 1. Load config and apply flag overrides.
    let config = HostConfig::load(config_path.as_deref())?.with_overrides(ticks, interval_ms);

    // 2. Initialize tracing subscriber.
    init_tracing(&config.log_level);
    info!(
        ticks = config.ticks,
        interval_ms = config.tick_interval_ms,
        max_tasks = config.kernel.max_tasks,
        "starting tickwork host"
    );

    // 3. Boot the kernel and install the workload.
    let clock = ManualClock::new(0);
    let mut kernel =
        Kernel::with_config(config.kernel.clone(), clock.clone()).context("failed to boot kernel")?;
    let workload = workload::install(&mut kernel)?;

    // 4. One scheduler pass per host invocation.
    let interval = Duration::from_millis(config.tick_interval_ms);
    for _ in 0..config.ticks {
        let tick = clock.advance();
        let report = kernel
            .run_one_pass()
            .with_context(|| format!("scheduler pass failed at tick {tick}"))?;
        log_report(&report);

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    // 5. Summarize.
    let items = kernel.signal_value(workload.items)?;
    let holder = kernel.lock_holder(workload.workbench)?;
    info!(
        tick = kernel.current_tick(),
        tasks = kernel.task_count(),
        items,
        workbench_holder = ?holder,
        heartbeats = workload.heartbeats.get(),
        producer_alive = kernel.contains_task(workload.producer),
        consumer_alive = kernel.contains_task(workload.consumer),
        workers_alive = workload.workers.iter().filter(|id| kernel.contains_task(**id)).count(),
        reporter_alive = kernel.contains_task(workload.reporter),
        "host finished"
    );

    if json {
        let table = serde_json::to_string_pretty(&kernel.tasks())
            .context("failed to serialize task table")?;
        println!("{table}");
    }

    Ok(())
}

fn log_report(report: &PassReport) {
    for fault in &report.faults {
        warn!(
            task_id = %fault.task_id,
            description = %fault.description,
            message = %fault.message,
            "task restarted"
        );
    }
    info!(
        tick = report.tick,
        slices = report.slices,
        destroyed = ?report.destroyed,
        watches_fired = report.watches_fired,
        timers_fired = report.timers_fired,
        timers_dropped = report.timers_dropped,
        elapsed_us = report.elapsed.as_micros() as u64,
        "pass complete"
    );
}

// ---------------------------------------------------------------------------
// Subcommand: config
// ---------------------------------------------------------------------------

fn cmd_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = HostConfig::load(config_path.as_deref())?;
    print!("{}", config.to_toml()?);
    Ok(())
}
