//! Kernel configuration.
//!
//! [`KernelConfig`] sizes the task-id pool and toggles slice profiling.
//! Defaults come from the [`Default`] implementation and individual fields can
//! be overridden with the builder-style `with_*` methods or deserialized from
//! a `[kernel]` table in the host's TOML file.

use serde::{Deserialize, Serialize};

/// Default size of the task-id pool.
pub const DEFAULT_MAX_TASKS: u32 = 36_767;

/// Tunables for a [`Kernel`](crate::Kernel) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of task ids available.  Running out is fatal.
    ///
    /// Default: **36 767**.
    pub max_tasks: u32,

    /// Description given to the resident timer task.
    ///
    /// Default: **"timer"**.
    pub timer_task_description: String,

    /// Whether to measure and keep the duration of each task slice.
    ///
    /// Default: **true**.
    pub profile_slices: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            timer_task_description: "timer".to_string(),
            profile_slices: true,
        }
    }
}

impl KernelConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the task-id pool.
    pub fn with_max_tasks(mut self, max_tasks: u32) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Set the description of the resident timer task.
    pub fn with_timer_task_description(mut self, description: impl Into<String>) -> Self {
        self.timer_task_description = description.into();
        self
    }

    /// Enable or disable slice profiling.
    pub fn with_profile_slices(mut self, enabled: bool) -> Self {
        self.profile_slices = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.max_tasks, 36_767);
        assert_eq!(cfg.timer_task_description, "timer");
        assert!(cfg.profile_slices);
    }

    #[test]
    fn builder_chaining() {
        let cfg = KernelConfig::new()
            .with_max_tasks(8)
            .with_timer_task_description("clock")
            .with_profile_slices(false);
        assert_eq!(cfg.max_tasks, 8);
        assert_eq!(cfg.timer_task_description, "clock");
        assert!(!cfg.profile_slices);
    }

    #[test]
    fn deserialize_fills_missing_fields() {
        let cfg: KernelConfig =
            serde_json::from_str(r#"{"max_tasks": 16}"#).expect("partial config should parse");
        assert_eq!(cfg.max_tasks, 16);
        assert_eq!(cfg.timer_task_description, "timer");
        assert!(cfg.profile_slices);
    }
}
