//! Generic [`HeapBackend`] trait for the platform's general-purpose allocator.

use crate::error::HalError;

/// The allocator the tracking layer instruments.
///
/// Blocks are identified by the address the backend returned.  The
/// data-access methods exist so callers can fill and inspect blocks without
/// the tracking layer ever holding a raw pointer.
pub trait HeapBackend: Send + Sync {
    /// Allocate `size` bytes.  Returns the block address, or `None` when the
    /// heap cannot satisfy the request.
    fn alloc(&self, size: usize) -> Option<usize>;

    /// Release the block at `address`.  Unknown addresses are ignored.
    fn release(&self, address: usize);

    /// Copy `len` bytes from the block at `src` to the block at `dst`.
    fn copy(&self, src: usize, dst: usize, len: usize) -> Result<(), HalError>;

    /// Write `data` into the block at `address`, starting at `offset`.
    fn write(&self, address: usize, offset: usize, data: &[u8]) -> Result<(), HalError>;

    /// Read the first `len` bytes of the block at `address`.
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, HalError>;

    /// Bytes currently free across the whole heap.
    fn free_heap(&self) -> usize;

    /// Lowest value [`free_heap`][Self::free_heap] has reached since boot.
    fn min_free_heap(&self) -> usize;

    /// Size of the largest single allocation that could currently succeed.
    fn largest_free_block(&self) -> usize;
}
