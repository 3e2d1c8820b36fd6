//! [`TaskRegistry`] – authoritative name → task bookkeeping.
//!
//! The registry wraps a platform [`TaskLauncher`] and keeps one
//! [`TaskRecord`] per running task in a fixed table of `max_tasks` slots.
//! Names are unique among active tasks, and a record is only committed after
//! the platform has actually launched the task, so a failed launch never
//! leaves a half-registered entry behind.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use espos_hal::SimScheduler;
//! use espos_kernel::{KernelConfig, TaskRegistry};
//! use espos_types::{TaskSpec, TaskState};
//!
//! let registry = TaskRegistry::new(
//!     &KernelConfig::default(),
//!     Arc::new(SimScheduler::bookkeeping_only()),
//! )
//! .unwrap();
//!
//! registry.create(TaskSpec::new("blink", 2048, 1), Box::new(|| {})).unwrap();
//! registry.suspend("blink").unwrap();
//! assert_eq!(registry.get_task_info("blink").unwrap().state, TaskState::Suspended);
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use espos_hal::{TaskEntry, TaskLauncher};
use espos_types::{KernelError, Table, TaskRecord, TaskSpec, TaskState};
use tracing::{debug, info, instrument, warn};

use crate::arena::SlotArena;
use crate::config::KernelConfig;
use crate::lock::{LockRank, TimedLock};

struct TaskTable {
    slots: SlotArena<TaskRecord>,
    by_name: HashMap<String, usize>,
}

impl TaskTable {
    fn find(&self, name: &str) -> Result<usize, KernelError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut TaskRecord, KernelError> {
        let index = self.find(name)?;
        self.slots
            .get_mut(index)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }
}

/// Bounded, thread-safe table of running tasks keyed by name.
pub struct TaskRegistry {
    table: TimedLock<TaskTable>,
    launcher: Arc<dyn TaskLauncher>,
    capacity: usize,
    max_name_len: usize,
    active: AtomicUsize,
}

impl TaskRegistry {
    /// Build an empty registry over `launcher`.
    ///
    /// # Errors
    ///
    /// [`KernelError::RegistryInitFailed`] when the configured capacity or
    /// name bound is zero.
    pub fn new(config: &KernelConfig, launcher: Arc<dyn TaskLauncher>) -> Result<Self, KernelError> {
        if config.max_tasks == 0 {
            return Err(KernelError::RegistryInitFailed(
                "max_tasks must be greater than zero".to_string(),
            ));
        }
        if config.max_task_name_len == 0 {
            return Err(KernelError::RegistryInitFailed(
                "max_task_name_len must be greater than zero".to_string(),
            ));
        }

        info!(capacity = config.max_tasks, "task registry initialised");
        Ok(Self {
            table: TimedLock::new(
                "task registry",
                LockRank::Component,
                config.lock_timeout(),
                TaskTable {
                    slots: SlotArena::with_capacity(config.max_tasks),
                    by_name: HashMap::with_capacity(config.max_tasks),
                },
            ),
            launcher,
            capacity: config.max_tasks,
            max_name_len: config.max_task_name_len,
            active: AtomicUsize::new(0),
        })
    }

    /// Launch a task and register it under `spec.name`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidName`] – empty or over-long name.
    /// - [`KernelError::DuplicateName`] – an active task already uses the name.
    /// - [`KernelError::CapacityExceeded`] – every slot is taken.
    /// - [`KernelError::UnderlyingCreateFailed`] – the platform refused the
    ///   launch; the table is left unchanged.
    /// - [`KernelError::LockTimeout`]
    #[instrument(name = "registry_create", skip(self, spec, entry), fields(task = %spec.name))]
    pub fn create(&self, spec: TaskSpec, entry: TaskEntry) -> Result<(), KernelError> {
        if spec.name.is_empty() || spec.name.len() > self.max_name_len {
            warn!(task = %spec.name, max_len = self.max_name_len, "rejected task name");
            return Err(KernelError::InvalidName(spec.name));
        }

        let mut table = self.table.lock()?;
        if table.by_name.contains_key(&spec.name) {
            warn!(task = %spec.name, "task already exists");
            return Err(KernelError::DuplicateName(spec.name));
        }
        if table.slots.is_full() {
            warn!(task = %spec.name, capacity = table.slots.capacity(), "no free task slots available");
            return Err(KernelError::CapacityExceeded {
                table: Table::Tasks,
                capacity: table.slots.capacity(),
            });
        }

        let handle = self.launcher.spawn(&spec, entry).map_err(|e| {
            warn!(task = %spec.name, error = %e, "failed to create task");
            KernelError::UnderlyingCreateFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let record = TaskRecord {
            name: spec.name.clone(),
            handle,
            stack_size: spec.stack_size,
            priority: spec.priority,
            state: TaskState::Ready,
            stack_high_water_mark: self.launcher.stack_high_water_mark(handle),
            active: true,
        };
        let index = match table.slots.insert(record) {
            Ok((index, _)) => index,
            Err(record) => {
                // Not reachable while the lock is held. Undo the launch.
                self.launcher.terminate(record.handle);
                return Err(KernelError::CapacityExceeded {
                    table: Table::Tasks,
                    capacity: table.slots.capacity(),
                });
            }
        };
        table.by_name.insert(spec.name.clone(), index);
        self.active.store(table.slots.len(), Ordering::SeqCst);

        info!(
            task = %spec.name,
            %handle,
            priority = spec.priority,
            stack_size = spec.stack_size,
            "task created"
        );
        Ok(())
    }

    /// Terminate the task named `name` and free its slot.
    #[instrument(name = "registry_delete", skip(self))]
    pub fn delete(&self, name: &str) -> Result<(), KernelError> {
        let mut table = self.table.lock()?;
        let index = table.find(name)?;
        table.by_name.remove(name);
        let record = table
            .slots
            .remove(index, None)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
        self.launcher.terminate(record.handle);
        self.active.store(table.slots.len(), Ordering::SeqCst);

        info!(task = %name, "task deleted");
        Ok(())
    }

    /// Suspend the task named `name`.
    pub fn suspend(&self, name: &str) -> Result<(), KernelError> {
        let mut table = self.table.lock()?;
        let record = table.record_mut(name)?;
        self.launcher.suspend(record.handle);
        record.state = TaskState::Suspended;
        debug!(task = %name, "task suspended");
        Ok(())
    }

    /// Resume the task named `name`.  The recorded state is whatever the
    /// platform reports afterwards, so a task that was never suspended keeps
    /// its current state.
    pub fn resume(&self, name: &str) -> Result<(), KernelError> {
        let mut table = self.table.lock()?;
        let record = table.record_mut(name)?;
        self.launcher.resume(record.handle);
        record.state = self.launcher.state(record.handle);
        debug!(task = %name, state = %record.state, "task resumed");
        Ok(())
    }

    /// Snapshot of every active task, with state and stack high-water-mark
    /// refreshed from the platform.
    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, KernelError> {
        let mut table = self.table.lock()?;
        Ok(table
            .slots
            .iter_mut()
            .map(|(_, record)| {
                self.refresh(record);
                record.clone()
            })
            .collect())
    }

    /// Copy of the record for `name`, as last recorded.
    pub fn get_task_info(&self, name: &str) -> Result<TaskRecord, KernelError> {
        let table = self.table.lock()?;
        let index = table.find(name)?;
        table
            .slots
            .get(index, None)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    /// Number of active tasks.  Lock-free.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> Result<usize, KernelError> {
        let table = self.table.lock()?;
        Ok(table.slots.capacity() - table.slots.len())
    }

    /// Sum of peak stack use (`stack_size - high_water_mark`) over every
    /// active task.
    pub fn total_stack_usage(&self) -> Result<u64, KernelError> {
        let mut table = self.table.lock()?;
        Ok(table
            .slots
            .iter_mut()
            .map(|(_, record)| {
                self.refresh(record);
                u64::from(record.stack_size.saturating_sub(record.stack_high_water_mark))
            })
            .sum())
    }

    /// Formatted task table, one row per active task.
    pub fn task_report(&self) -> Result<String, KernelError> {
        let tasks = self.list_tasks()?;
        let mut out = String::new();
        let _ = writeln!(out, "Active Tasks:");
        let _ = writeln!(out, "Name              Priority  State     Stack");
        let _ = writeln!(out, "----------------------------------------");
        for task in &tasks {
            let _ = writeln!(
                out,
                "{:<16} {:>8}  {:<9} {:>6}",
                task.name, task.priority, task.state, task.stack_high_water_mark
            );
        }
        Ok(out)
    }

    /// Task count and free slot summary.
    pub fn stats_report(&self) -> Result<String, KernelError> {
        let table = self.table.lock()?;
        let total = table.slots.len();
        Ok(format!(
            "Total Tasks: {total}\nFree Task Slots: {}\n",
            table.slots.capacity() - total
        ))
    }

    /// Terminate every registered task and clear the table.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        let mut table = self.table.lock()?;
        let records = table.slots.drain();
        table.by_name.clear();
        for record in &records {
            self.launcher.terminate(record.handle);
        }
        self.active.store(0, Ordering::SeqCst);
        info!(terminated = records.len(), "task registry shut down");
        Ok(())
    }

    fn refresh(&self, record: &mut TaskRecord) {
        record.state = self.launcher.state(record.handle);
        record.stack_high_water_mark = self.launcher.stack_high_water_mark(record.handle);
    }
}
