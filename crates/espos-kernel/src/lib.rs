//! `espos-kernel` – resource-tracking kernel core.
//!
//! Sits between application code and the platform's scheduler and heap and
//! keeps the authoritative, thread-safe bookkeeping for both.
//!
//! - [`task_registry`] – [`TaskRegistry`]: bounded name → task table.
//! - [`tracked_allocator`] – [`TrackedAllocator`]: bounded table of tagged
//!   allocations with running totals.
//! - [`kernel_monitor`] – [`Kernel`]: facade over both, with the outer
//!   system lock and the health flag.
//! - [`health_monitor`] – [`HealthMonitor`]: periodic health sampling on
//!   tokio.
//! - [`lock`] – [`TimedLock`]: ranked mutex with a bounded wait.
//! - [`config`] – [`KernelConfig`]: capacities, thresholds, timeouts.

mod arena;
pub mod config;
pub mod health_monitor;
pub mod kernel_monitor;
pub mod lock;
pub mod task_registry;
pub mod tracked_allocator;

pub use config::KernelConfig;
pub use health_monitor::{HealthMonitor, MonitorHandle};
pub use kernel_monitor::Kernel;
pub use lock::{LockRank, TimedGuard, TimedLock};
pub use task_registry::TaskRegistry;
pub use tracked_allocator::TrackedAllocator;
