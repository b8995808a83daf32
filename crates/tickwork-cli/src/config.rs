//! Host configuration.
//!
//! Read from an optional TOML file; command-line flags override file values.
//!
//! ```toml
//! ticks = 20
//! tick_interval_ms = 100
//! log_level = "debug"
//!
//! [kernel]
//! max_tasks = 1024
//! profile_slices = true
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tickwork_kernel::KernelConfig;

/// Settings for the simulated host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Number of host invocations to simulate.
    pub ticks: u64,
    /// Pause between invocations.
    pub tick_interval_ms: u64,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub kernel: KernelConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ticks: 16,
            tick_interval_ms: 0,
            log_level: "info".to_string(),
            kernel: KernelConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load from `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, ticks: Option<u64>, interval_ms: Option<u64>) -> Self {
        if let Some(ticks) = ticks {
            self.ticks = ticks;
        }
        if let Some(interval_ms) = interval_ms {
            self.tick_interval_ms = interval_ms;
        }
        self
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}
