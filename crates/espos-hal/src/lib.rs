//! `espos-hal` – platform layer beneath the kernel core.
//!
//! The kernel core never schedules tasks or carves up memory itself.  It
//! talks to three traits that stand in for the underlying RTOS:
//!
//! - [`launcher`] – [`TaskLauncher`]: starts, stops, suspends and inspects
//!   tasks.
//! - [`heap`] – [`HeapBackend`]: the general-purpose allocator plus its
//!   free-space and fragmentation queries.
//! - [`clock`] – [`Clock`]: monotonic milliseconds since boot.
//!
//! [`sim_scheduler`] and [`sim_heap`] provide in-process implementations so
//! the full stack runs on a development host and in CI.  [`Platform`] bundles
//! one of each and is handed to the kernel at construction time.

pub mod clock;
pub mod error;
pub mod heap;
pub mod launcher;
pub mod sim_heap;
pub mod sim_scheduler;

use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::HalError;
pub use heap::HeapBackend;
pub use launcher::{TaskEntry, TaskLauncher};
pub use sim_heap::SimHeap;
pub use sim_scheduler::SimScheduler;

/// The set of platform services a kernel instance is built on.
///
/// Constructed once at boot and moved into the kernel, which shares the
/// individual services with its components.
#[derive(Clone)]
pub struct Platform {
    pub launcher: Arc<dyn TaskLauncher>,
    pub heap: Arc<dyn HeapBackend>,
    pub clock: Arc<dyn Clock>,
}

impl Platform {
    pub fn new(
        launcher: Arc<dyn TaskLauncher>,
        heap: Arc<dyn HeapBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            launcher,
            heap,
            clock,
        }
    }

    /// A fully simulated platform: [`SimScheduler`], a [`SimHeap`] of
    /// `heap_size` bytes, and the host's monotonic clock.
    pub fn simulated(heap_size: usize) -> Self {
        Self {
            launcher: Arc::new(SimScheduler::new()),
            heap: Arc::new(SimHeap::new(heap_size)),
            clock: Arc::new(SystemClock::new()),
        }
    }
}
