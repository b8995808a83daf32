//! CLI argument definitions for tickwork.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tickwork -- a cooperative micro-kernel for tick-driven hosts.
#[derive(Parser)]
#[command(
    name = "tickwork",
    version,
    about = "tickwork -- cooperative tick-driven micro-kernel",
    long_about = "Simulates a host that invokes the kernel once per tick and runs a \
                  demonstration workload of signals, locks, timers and watches."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the demonstration workload for a number of host ticks.
    Run {
        /// Number of host invocations to simulate.
        #[arg(long, short)]
        ticks: Option<u64>,

        /// Pause between invocations, in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Path to a TOML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Print the final task table as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Path to a TOML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}
