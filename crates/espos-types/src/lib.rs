use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical run state of a registered task, as last observed on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Ready,
    Running,
    /// Waiting on an event. Only ever observed, never set by the registry.
    Blocked,
    Suspended,
    Unknown,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Ready => "Ready",
            TaskState::Running => "Running",
            TaskState::Blocked => "Blocked",
            TaskState::Suspended => "Suspended",
            TaskState::Unknown => "Unknown",
        };
        f.pad(label)
    }
}

/// Opaque identifier the platform launcher hands out for a launched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Launch parameters for a new task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task name, e.g. `"wifi_manager"`.
    pub name: String,
    /// Requested stack size in bytes.
    pub stack_size: u32,
    /// Scheduler priority; higher runs first.
    pub priority: u8,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, stack_size: u32, priority: u8) -> Self {
        Self {
            name: name.into(),
            stack_size,
            priority,
        }
    }
}

/// Bookkeeping for one active task slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub handle: TaskHandle,
    pub stack_size: u32,
    pub priority: u8,
    pub state: TaskState,
    /// Minimum remaining stack space (bytes) seen so far.
    pub stack_high_water_mark: u32,
    pub active: bool,
}

/// Opaque reference to a tracked memory block.
///
/// A handle names a metadata slot plus the generation that slot had when the
/// block was allocated.  Once the block is freed the slot's generation moves
/// on, so a stale handle can never match a later allocation that happens to
/// reuse the same slot or the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHandle {
    pub slot: u32,
    pub generation: u32,
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}.{}", self.slot, self.generation)
    }
}

/// Bookkeeping for one outstanding allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlockRecord {
    /// Address returned by the platform heap.  Never dereferenced by the
    /// tracking layer.
    pub address: usize,
    /// Size in bytes after alignment.
    pub size: usize,
    pub allocated: bool,
    /// Milliseconds since boot at allocation time.
    pub timestamp_ms: u64,
    /// Short diagnostic label.
    pub tag: String,
}

/// Aggregate allocator statistics at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub total_allocated: usize,
    pub peak_allocated: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    /// Free heap reported by the platform.
    pub available_heap: usize,
    /// Largest contiguous free region reported by the platform.
    pub largest_free_block: usize,
    pub blocks_in_use: usize,
    pub block_capacity: usize,
}

/// Serialisable point-in-time view of the whole kernel core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub version: String,
    pub booted_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub healthy: bool,
    /// Platform free heap at the last health sample.
    pub free_memory: usize,
    /// Platform low-water free heap at the last health sample.
    pub min_free_memory: usize,
    pub total_tasks: usize,
    pub allocator: AllocatorStats,
}

/// Which bounded table an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Table {
    Tasks,
    MemoryBlocks,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Tasks => write!(f, "task"),
            Table::MemoryBlocks => write!(f, "memory block"),
        }
    }
}

/// Every failure the kernel core can report.
///
/// `AllocatorInitFailed`, `RegistryInitFailed` and `InvalidConfig` are fatal
/// to startup; all other variants are recoverable and leave the tables
/// untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    #[error("Task '{0}' already exists")]
    DuplicateName(String),

    #[error("No free {table} slots available (capacity {capacity})")]
    CapacityExceeded { table: Table, capacity: usize },

    #[error("Task '{0}' not found")]
    NotFound(String),

    #[error("Timed out waiting for the {0} lock")]
    LockTimeout(String),

    #[error("Failed to launch task '{name}': {reason}")]
    UnderlyingCreateFailed { name: String, reason: String },

    #[error("Allocation size must be non-zero")]
    InvalidSize,

    #[error("Untracked memory handle {0}")]
    UntrackedPointer(BlockHandle),

    #[error("Out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Memory allocator initialisation failed: {0}")]
    AllocatorInitFailed(String),

    #[error("Task registry initialisation failed: {0}")]
    RegistryInitFailed(String),

    #[error("Invalid task name '{0}'")]
    InvalidName(String),

    #[error("Access to {handle} at offset {offset} (+{len}) exceeds block size {size}")]
    OutOfBounds {
        handle: BlockHandle,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Integrity check failed: {0}")]
    IntegrityViolation(String),

    #[error("Invalid kernel configuration: {0}")]
    InvalidConfig(String),

    #[error("Kernel has been shut down")]
    ShutDown,
}

impl KernelError {
    /// `true` for the variants that must halt startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::AllocatorInitFailed(_)
                | KernelError::RegistryInitFailed(_)
                | KernelError::InvalidConfig(_)
        )
    }
}
