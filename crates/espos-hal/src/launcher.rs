//! Generic [`TaskLauncher`] trait for the underlying RTOS task API.
//!
//! The task registry only ever talks to this trait, so the same bookkeeping
//! runs over FreeRTOS on a device and over [`SimScheduler`] on a host.
//!
//! [`SimScheduler`]: crate::sim_scheduler::SimScheduler

use espos_types::{TaskHandle, TaskSpec, TaskState};

use crate::error::HalError;

/// Body of a task.  Launch parameters are captured by the closure.
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Platform-level task control.
pub trait TaskLauncher: Send + Sync {
    /// Start a task described by `spec` running `entry`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::LaunchFailed`] when the platform refuses the task
    /// (out of task control blocks, stack allocation failure, …).
    fn spawn(&self, spec: &TaskSpec, entry: TaskEntry) -> Result<TaskHandle, HalError>;

    /// Stop the task and release its platform resources.
    fn terminate(&self, handle: TaskHandle);

    fn suspend(&self, handle: TaskHandle);

    fn resume(&self, handle: TaskHandle);

    /// Current run state as the platform sees it.
    fn state(&self, handle: TaskHandle) -> TaskState;

    /// Minimum free stack space (bytes) the task has had so far.
    fn stack_high_water_mark(&self, handle: TaskHandle) -> u32;
}
