//! In-process task launcher for running the kernel core without an RTOS.
//!
//! [`SimScheduler`] runs each task body on a named host thread and keeps the
//! RTOS-visible state (run state, stack usage) in its own table.  Host
//! threads cannot be paused or killed from outside, so suspend, resume and
//! terminate only change the recorded state; the body itself runs to
//! completion on its thread.
//!
//! Tests steer the simulation with [`SimScheduler::fail_next_spawns`],
//! [`SimScheduler::set_state`] and [`SimScheduler::set_stack_usage`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use espos_types::{TaskHandle, TaskSpec, TaskState};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::HalError;
use crate::launcher::{TaskEntry, TaskLauncher};

/// Smallest host stack handed to a simulated task.  Device stack sizes are
/// far below what a hosted thread needs.
const MIN_HOST_STACK: usize = 64 * 1024;

struct SimTask {
    name: String,
    stack_size: u32,
    stack_used: u32,
    state: TaskState,
    _thread: Option<JoinHandle<()>>,
}

/// Simulated RTOS task API.
#[derive(Default)]
pub struct SimScheduler {
    tasks: Mutex<HashMap<TaskHandle, SimTask>>,
    next_id: AtomicU64,
    pending_failures: AtomicUsize,
    run_bodies: bool,
}

impl SimScheduler {
    /// A launcher that runs each task body on its own host thread.
    pub fn new() -> Self {
        Self {
            run_bodies: true,
            ..Self::default()
        }
    }

    /// A launcher that records tasks but never runs their bodies.
    pub fn bookkeeping_only() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to [`spawn`][TaskLauncher::spawn] fail.
    pub fn fail_next_spawns(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Override the state the platform reports for `handle`.
    pub fn set_state(&self, handle: TaskHandle, state: TaskState) -> Result<(), HalError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&handle).ok_or(HalError::UnknownTask(handle))?;
        task.state = state;
        Ok(())
    }

    /// Record that the task at `handle` has used `bytes` of its stack at peak.
    pub fn set_stack_usage(&self, handle: TaskHandle, bytes: u32) -> Result<(), HalError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&handle).ok_or(HalError::UnknownTask(handle))?;
        task.stack_used = task.stack_used.max(bytes.min(task.stack_size));
        Ok(())
    }

    /// Number of tasks that have been spawned and not yet terminated.
    pub fn live_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Names of live tasks, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().values().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TaskLauncher for SimScheduler {
    fn spawn(&self, spec: &TaskSpec, entry: TaskEntry) -> Result<TaskHandle, HalError> {
        if self.take_failure() {
            return Err(HalError::LaunchFailed(format!(
                "injected failure for '{}'",
                spec.name
            )));
        }

        let thread = if self.run_bodies {
            let stack = usize::try_from(spec.stack_size)
                .unwrap_or(MIN_HOST_STACK)
                .max(MIN_HOST_STACK);
            let join = thread::Builder::new()
                .name(spec.name.clone())
                .stack_size(stack)
                .spawn(entry)
                .map_err(|e| HalError::LaunchFailed(e.to_string()))?;
            Some(join)
        } else {
            None
        };

        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.tasks.lock().insert(
            handle,
            SimTask {
                name: spec.name.clone(),
                stack_size: spec.stack_size,
                stack_used: 0,
                state: TaskState::Ready,
                _thread: thread,
            },
        );
        debug!(%handle, task = %spec.name, "sim task spawned");
        Ok(handle)
    }

    fn terminate(&self, handle: TaskHandle) {
        if let Some(task) = self.tasks.lock().remove(&handle) {
            debug!(%handle, task = %task.name, "sim task terminated");
        }
    }

    fn suspend(&self, handle: TaskHandle) {
        if let Some(task) = self.tasks.lock().get_mut(&handle) {
            task.state = TaskState::Suspended;
        }
    }

    fn resume(&self, handle: TaskHandle) {
        if let Some(task) = self.tasks.lock().get_mut(&handle)
            && task.state == TaskState::Suspended
        {
            task.state = TaskState::Ready;
        }
    }

    fn state(&self, handle: TaskHandle) -> TaskState {
        self.tasks
            .lock()
            .get(&handle)
            .map(|t| t.state)
            .unwrap_or(TaskState::Unknown)
    }

    fn stack_high_water_mark(&self, handle: TaskHandle) -> u32 {
        self.tasks
            .lock()
            .get(&handle)
            .map(|t| t.stack_size - t.stack_used)
            .unwrap_or(0)
    }
}
