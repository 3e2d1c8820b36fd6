//! [`Kernel`] – the facade that owns the task registry and the allocator.
//!
//! Cross-cutting calls take the system lock first and then forward to the
//! component, which takes its own table lock.  The system lock ranks below
//! every component lock, so the order is always system → component.
//!
//! The facade also derives a coarse health flag from the platform's free
//! heap.  [`Kernel::update_system_stats`] re-samples on every call with no
//! hysteresis; deciding what to do about an unhealthy system (typically a
//! restart) is left to whoever observes [`Kernel::is_healthy`].
//!
//! # Example
//!
//! ```rust
//! use espos_hal::Platform;
//! use espos_kernel::{Kernel, KernelConfig};
//! use espos_types::TaskSpec;
//!
//! let kernel = Kernel::init(KernelConfig::default(), Platform::simulated(64 * 1024)).unwrap();
//! kernel.create_task(TaskSpec::new("sensor", 2048, 2), Box::new(|| {})).unwrap();
//! let block = kernel.allocate_tagged(256, "sensor_buf").unwrap();
//!
//! assert_eq!(kernel.get_total_tasks(), 1);
//! assert!(kernel.update_system_stats().unwrap());
//! kernel.free_memory(block).unwrap();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use espos_hal::{Clock, HeapBackend, Platform, TaskEntry};
use espos_types::{
    AllocatorStats, BlockHandle, KernelError, SystemSnapshot, TaskRecord, TaskSpec,
};
use tracing::{info, instrument, warn};

use crate::config::KernelConfig;
use crate::lock::{LockRank, TimedLock};
use crate::task_registry::TaskRegistry;
use crate::tracked_allocator::{DEFAULT_TAG, TrackedAllocator};

// ────────────────────────────────────────────────────────────────────────────
// System state
// ────────────────────────────────────────────────────────────────────────────

/// Guarded by the system lock.  Sampled figures are mirrored into atomics on
/// [`Kernel`] so the getters never block.
struct SystemState {
    boot_ms: u64,
    booted_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Kernel
// ────────────────────────────────────────────────────────────────────────────

/// The kernel core: one [`TaskRegistry`], one [`TrackedAllocator`] and a
/// health signal, behind a single ranked system lock.
pub struct Kernel {
    config: KernelConfig,
    system: TimedLock<SystemState>,
    allocator: TrackedAllocator,
    registry: TaskRegistry,
    heap: Arc<dyn HeapBackend>,
    clock: Arc<dyn Clock>,
    healthy: AtomicBool,
    uptime_secs: AtomicU64,
    free_memory: AtomicUsize,
    min_free_memory: AtomicUsize,
    shut_down: AtomicBool,
}

impl Kernel {
    /// Build the allocator, then the registry, then the system lock, and
    /// mark the system healthy.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidConfig`] – `config` failed validation.
    /// - [`KernelError::AllocatorInitFailed`]
    /// - [`KernelError::RegistryInitFailed`]
    #[instrument(name = "kernel_init", skip_all)]
    pub fn init(config: KernelConfig, platform: Platform) -> Result<Self, KernelError> {
        config.validate()?;

        let allocator =
            TrackedAllocator::new(&config, platform.heap.clone(), platform.clock.clone())?;
        let registry = TaskRegistry::new(&config, platform.launcher.clone())?;

        let boot_ms = platform.clock.now_ms();
        let booted_at = Utc::now();
        let free = platform.heap.free_heap();
        let min_free = platform.heap.min_free_heap();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            max_tasks = config.max_tasks,
            max_memory_blocks = config.max_memory_blocks,
            free_heap = free,
            "kernel core initialised"
        );

        Ok(Self {
            system: TimedLock::new(
                "system",
                LockRank::System,
                config.lock_timeout(),
                SystemState { boot_ms, booted_at },
            ),
            config,
            allocator,
            registry,
            heap: platform.heap,
            clock: platform.clock,
            healthy: AtomicBool::new(true),
            uptime_secs: AtomicU64::new(0),
            free_memory: AtomicUsize::new(free),
            min_free_memory: AtomicUsize::new(min_free),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run `op` while holding the system lock.
    fn proxied<R>(&self, op: impl FnOnce() -> Result<R, KernelError>) -> Result<R, KernelError> {
        let _system = self.system.lock()?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(KernelError::ShutDown);
        }
        op()
    }

    // ── Tasks ───────────────────────────────────────────────────────────────

    #[instrument(skip(self, spec, entry), fields(task = %spec.name))]
    pub fn create_task(&self, spec: TaskSpec, entry: TaskEntry) -> Result<(), KernelError> {
        self.proxied(|| self.registry.create(spec, entry))
    }

    #[instrument(skip(self))]
    pub fn delete_task(&self, name: &str) -> Result<(), KernelError> {
        self.proxied(|| self.registry.delete(name))
    }

    #[instrument(skip(self))]
    pub fn suspend_task(&self, name: &str) -> Result<(), KernelError> {
        self.proxied(|| self.registry.suspend(name))
    }

    #[instrument(skip(self))]
    pub fn resume_task(&self, name: &str) -> Result<(), KernelError> {
        self.proxied(|| self.registry.resume(name))
    }

    pub fn get_task_info(&self, name: &str) -> Result<TaskRecord, KernelError> {
        self.proxied(|| self.registry.get_task_info(name))
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, KernelError> {
        self.proxied(|| self.registry.list_tasks())
    }

    /// Formatted task table with a totals footer.
    pub fn task_report(&self) -> Result<String, KernelError> {
        self.proxied(|| {
            let mut report = self.registry.task_report()?;
            report.push_str(&self.registry.stats_report()?);
            Ok(report)
        })
    }

    /// Bytes of stack in use across all tasks, at their high-water marks.
    pub fn total_stack_usage(&self) -> Result<u64, KernelError> {
        self.proxied(|| self.registry.total_stack_usage())
    }

    // ── Memory ──────────────────────────────────────────────────────────────

    /// Allocate `size` bytes tagged [`DEFAULT_TAG`].
    pub fn allocate_memory(&self, size: usize) -> Result<BlockHandle, KernelError> {
        self.allocate_tagged(size, DEFAULT_TAG)
    }

    #[instrument(skip(self))]
    pub fn allocate_tagged(&self, size: usize, tag: &str) -> Result<BlockHandle, KernelError> {
        self.proxied(|| self.allocator.allocate(size, tag))
    }

    #[instrument(skip(self), fields(block = %handle))]
    pub fn free_memory(&self, handle: BlockHandle) -> Result<(), KernelError> {
        self.proxied(|| self.allocator.free(handle))
    }

    /// See [`TrackedAllocator::reallocate`].
    #[instrument(skip(self))]
    pub fn reallocate_memory(
        &self,
        handle: Option<BlockHandle>,
        new_size: usize,
    ) -> Result<Option<BlockHandle>, KernelError> {
        self.proxied(|| self.allocator.reallocate(handle, new_size))
    }

    pub fn write_memory(
        &self,
        handle: BlockHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), KernelError> {
        self.proxied(|| self.allocator.write(handle, offset, data))
    }

    pub fn read_memory(&self, handle: BlockHandle) -> Result<Vec<u8>, KernelError> {
        self.proxied(|| self.allocator.read(handle))
    }

    pub fn memory_stats(&self) -> Result<AllocatorStats, KernelError> {
        self.proxied(|| self.allocator.stats())
    }

    pub fn memory_map(&self) -> Result<String, KernelError> {
        self.proxied(|| self.allocator.memory_map())
    }

    pub fn memory_report(&self) -> Result<String, KernelError> {
        self.proxied(|| self.allocator.statistics_report())
    }

    pub fn fragmentation(&self) -> u8 {
        self.allocator.fragmentation()
    }

    pub fn check_integrity(&self) -> Result<(), KernelError> {
        self.proxied(|| self.allocator.check_integrity())
    }

    // ── System ──────────────────────────────────────────────────────────────

    /// Live platform free heap.  Zero once shut down.
    pub fn get_free_memory(&self) -> u32 {
        if self.is_shut_down() {
            return 0;
        }
        saturate_u32(self.heap.free_heap())
    }

    /// Live platform low-water free heap.  Zero once shut down.
    pub fn get_min_free_memory(&self) -> u32 {
        if self.is_shut_down() {
            return 0;
        }
        saturate_u32(self.heap.min_free_heap())
    }

    /// Seconds since boot as of the last [`update_system_stats`](Self::update_system_stats).
    pub fn get_uptime(&self) -> u32 {
        u32::try_from(self.uptime_secs.load(Ordering::Relaxed)).unwrap_or(u32::MAX)
    }

    pub fn get_total_tasks(&self) -> u32 {
        saturate_u32(self.registry.active_count())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn booted_at(&self) -> Result<DateTime<Utc>, KernelError> {
        Ok(self.system.lock()?.booted_at)
    }

    /// Re-sample uptime and platform memory and re-evaluate health.
    ///
    /// Returns the new health flag.  The system is healthy while the
    /// platform's free heap is at least `low_memory_threshold`.
    #[instrument(level = "debug", skip(self))]
    pub fn update_system_stats(&self) -> Result<bool, KernelError> {
        let system = self.system.lock()?;
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }

        let uptime = self.clock.now_ms().saturating_sub(system.boot_ms) / 1000;
        let free = self.heap.free_heap();
        let min_free = self.heap.min_free_heap();
        self.uptime_secs.store(uptime, Ordering::Relaxed);
        self.free_memory.store(free, Ordering::Relaxed);
        self.min_free_memory.store(min_free, Ordering::Relaxed);

        let healthy = free >= self.config.low_memory_threshold;
        let was_healthy = self.healthy.swap(healthy, Ordering::AcqRel);
        match (was_healthy, healthy) {
            (true, false) => warn!(
                free_heap = free,
                threshold = self.config.low_memory_threshold,
                "low memory condition detected"
            ),
            (false, true) => info!(free_heap = free, "memory recovered, system healthy"),
            _ => {}
        }
        Ok(healthy)
    }

    /// Serialisable view of the last sample plus current allocator totals.
    pub fn snapshot(&self) -> Result<SystemSnapshot, KernelError> {
        let (booted_at, allocator) = {
            let system = self.system.lock()?;
            (system.booted_at, self.allocator.stats()?)
        };
        Ok(SystemSnapshot {
            version: self.version().to_string(),
            booted_at,
            uptime_secs: self.uptime_secs.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
            free_memory: self.free_memory.load(Ordering::Relaxed),
            min_free_memory: self.min_free_memory.load(Ordering::Relaxed),
            total_tasks: self.registry.active_count(),
            allocator,
        })
    }

    /// Stop every task and forget every tracked block.
    ///
    /// Idempotent.  All later calls through the facade fail with
    /// [`KernelError::ShutDown`].
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<(), KernelError> {
        let _system = self.system.lock()?;
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.healthy.store(false, Ordering::Release);
        self.registry.shutdown()?;
        self.allocator.shutdown()?;
        info!("kernel core shut down");
        Ok(())
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "kernel shutdown on drop failed");
        }
    }
}

fn saturate_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
