use espos_types::TaskHandle;
use thiserror::Error;

/// Failures reported by a platform implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("Task launch failed: {0}")]
    LaunchFailed(String),

    #[error("Unknown task {0}")]
    UnknownTask(TaskHandle),

    #[error("No live heap block at 0x{0:08X}")]
    UnknownAddress(usize),

    #[error("Heap access at 0x{address:08X} (+{len}) overruns a {capacity}-byte block")]
    OutOfRange {
        address: usize,
        len: usize,
        capacity: usize,
    },
}
