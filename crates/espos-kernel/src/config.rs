//! [`KernelConfig`] – the build-time limits of the kernel core.
//!
//! Every field has a default matching the stock ESP32 board profile, so a
//! config file only needs to list what it changes.

use std::time::Duration;

use espos_types::KernelError;
use serde::{Deserialize, Serialize};

/// Capacities, thresholds and timeouts consumed by the kernel core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Number of task slots in the registry.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Number of metadata slots in the tracked allocator.
    #[serde(default = "default_max_memory_blocks")]
    pub max_memory_blocks: usize,

    /// Allocation sizes are rounded up to a multiple of this (power of two).
    #[serde(default = "default_memory_alignment")]
    pub memory_alignment: usize,

    /// Free heap (bytes) below which the system reports itself unhealthy.
    #[serde(default = "default_low_memory_threshold")]
    pub low_memory_threshold: usize,

    /// Bounded wait for every kernel lock, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Longest accepted task name, in bytes.
    #[serde(default = "default_max_task_name_len")]
    pub max_task_name_len: usize,

    /// Allocation tags are truncated to this many bytes.
    #[serde(default = "default_max_tag_len")]
    pub max_tag_len: usize,

    /// Stack size used when a caller does not pick one.
    #[serde(default = "default_stack_size")]
    pub default_stack_size: u32,

    /// Interval between health samples, in milliseconds.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Size of the simulated heap on hosted builds.
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,
}

fn default_max_tasks() -> usize {
    16
}
fn default_max_memory_blocks() -> usize {
    64
}
fn default_memory_alignment() -> usize {
    4
}
fn default_low_memory_threshold() -> usize {
    10 * 1024
}
fn default_lock_timeout_ms() -> u64 {
    1000
}
fn default_max_task_name_len() -> usize {
    31
}
fn default_max_tag_len() -> usize {
    15
}
fn default_stack_size() -> u32 {
    2048
}
fn default_monitor_interval_ms() -> u64 {
    5000
}
fn default_heap_size() -> usize {
    200 * 1024
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            max_memory_blocks: default_max_memory_blocks(),
            memory_alignment: default_memory_alignment(),
            low_memory_threshold: default_low_memory_threshold(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_task_name_len: default_max_task_name_len(),
            max_tag_len: default_max_tag_len(),
            default_stack_size: default_stack_size(),
            monitor_interval_ms: default_monitor_interval_ms(),
            heap_size: default_heap_size(),
        }
    }
}

impl KernelConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Check the settings owned by the kernel facade itself.  Component
    /// capacities are checked by the components, which report their own
    /// init errors.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.lock_timeout_ms == 0 {
            return Err(KernelError::InvalidConfig(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(KernelError::InvalidConfig(
                "monitor_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
