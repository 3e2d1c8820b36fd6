//! [`TrackedAllocator`] – per-block accounting over the platform heap.
//!
//! Every allocation made through the tracker gets a [`MemoryBlockRecord`]
//! in a fixed table of `max_memory_blocks` slots and is identified to the
//! caller by a [`BlockHandle`].  Aggregate counters are kept in step with
//! the table:
//!
//! - `total_allocated` always equals the sum of sizes of allocated slots;
//! - `peak_allocated` never decreases and is never below `total_allocated`.
//!
//! Only allocations made through the tracker are counted.  The platform's
//! own free-heap figures (exposed via [`TrackedAllocator::available_heap`])
//! cover all heap activity and are expected to differ.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use espos_hal::{ManualClock, SimHeap};
//! use espos_kernel::{KernelConfig, TrackedAllocator};
//!
//! let alloc = TrackedAllocator::new(
//!     &KernelConfig::default(),
//!     Arc::new(SimHeap::new(4096)),
//!     Arc::new(ManualClock::new()),
//! )
//! .unwrap();
//!
//! let block = alloc.allocate(10, "rx_buf").unwrap();
//! assert_eq!(alloc.stats().unwrap().total_allocated, 12); // 4-byte aligned
//! alloc.free(block).unwrap();
//! assert_eq!(alloc.stats().unwrap().total_allocated, 0);
//! ```

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use espos_hal::{Clock, HeapBackend};
use espos_types::{AllocatorStats, BlockHandle, KernelError, MemoryBlockRecord, Table};
use tracing::{debug, info, instrument, warn};

use crate::arena::SlotArena;
use crate::config::KernelConfig;
use crate::lock::{LockRank, TimedLock};

/// Tag recorded when the caller does not supply one.
pub const DEFAULT_TAG: &str = "unknown";

/// Round `size` up to the next multiple of `alignment` (a power of two).
pub fn align_up(size: usize, alignment: usize) -> Option<usize> {
    Some(size.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Cut `tag` to at most `max_len` bytes without splitting a character.
fn truncate_tag(tag: &str, max_len: usize) -> String {
    if tag.len() <= max_len {
        return tag.to_string();
    }
    let mut end = max_len;
    while !tag.is_char_boundary(end) {
        end -= 1;
    }
    tag[..end].to_string()
}

struct BlockTable {
    slots: SlotArena<MemoryBlockRecord>,
    total_allocated: usize,
    peak_allocated: usize,
    allocation_count: u64,
    free_count: u64,
}

impl BlockTable {
    fn lookup(&self, handle: BlockHandle) -> Result<&MemoryBlockRecord, KernelError> {
        self.slots
            .get(handle.slot as usize, Some(handle.generation))
            .filter(|r| r.allocated)
            .ok_or(KernelError::UntrackedPointer(handle))
    }

    /// Allocate `size` (already aligned) bytes and record the block.
    fn allocate(
        &mut self,
        heap: &dyn HeapBackend,
        size: usize,
        tag: String,
        now_ms: u64,
    ) -> Result<BlockHandle, KernelError> {
        if self.slots.is_full() {
            warn!(size, %tag, "no free block slots available");
            return Err(KernelError::CapacityExceeded {
                table: Table::MemoryBlocks,
                capacity: self.slots.capacity(),
            });
        }
        let Some(address) = heap.alloc(size) else {
            warn!(size, %tag, "failed to allocate");
            return Err(KernelError::OutOfMemory { requested: size });
        };

        let record = MemoryBlockRecord {
            address,
            size,
            allocated: true,
            timestamp_ms: now_ms,
            tag,
        };
        let (slot, generation) = match self.slots.insert(record) {
            Ok(placed) => placed,
            Err(record) => {
                heap.release(record.address);
                return Err(KernelError::CapacityExceeded {
                    table: Table::MemoryBlocks,
                    capacity: self.slots.capacity(),
                });
            }
        };

        self.total_allocated += size;
        self.allocation_count += 1;
        self.peak_allocated = self.peak_allocated.max(self.total_allocated);

        let handle = BlockHandle {
            slot: slot as u32,
            generation,
        };
        debug!(%handle, address = format_args!("0x{address:08X}"), size, "allocated");
        Ok(handle)
    }

    /// Release the block behind `handle` and clear its slot.
    fn release(
        &mut self,
        heap: &dyn HeapBackend,
        handle: BlockHandle,
    ) -> Result<MemoryBlockRecord, KernelError> {
        let address = match self.lookup(handle) {
            Ok(record) => record.address,
            Err(e) => {
                warn!(%handle, "attempted to free untracked block");
                return Err(e);
            }
        };
        heap.release(address);
        let record = self
            .slots
            .remove(handle.slot as usize, Some(handle.generation))
            .ok_or(KernelError::UntrackedPointer(handle))?;

        self.total_allocated -= record.size;
        self.free_count += 1;
        debug!(%handle, address = format_args!("0x{address:08X}"), size = record.size, tag = %record.tag, "freed");
        Ok(record)
    }

    /// Undo an allocation the caller never received.  Unlike
    /// [`release`](Self::release) the allocation and free counters are
    /// restored; `peak_allocated` keeps whatever the block raised it to.
    fn rollback(&mut self, heap: &dyn HeapBackend, handle: BlockHandle) -> Result<(), KernelError> {
        self.release(heap, handle)?;
        self.allocation_count -= 1;
        self.free_count -= 1;
        Ok(())
    }

    fn stats(&self, heap: &dyn HeapBackend) -> AllocatorStats {
        AllocatorStats {
            total_allocated: self.total_allocated,
            peak_allocated: self.peak_allocated,
            allocation_count: self.allocation_count,
            free_count: self.free_count,
            available_heap: heap.free_heap(),
            largest_free_block: heap.largest_free_block(),
            blocks_in_use: self.slots.len(),
            block_capacity: self.slots.capacity(),
        }
    }
}

/// Bounded, thread-safe allocation tracker over a [`HeapBackend`].
pub struct TrackedAllocator {
    table: TimedLock<BlockTable>,
    heap: Arc<dyn HeapBackend>,
    clock: Arc<dyn Clock>,
    alignment: usize,
    max_tag_len: usize,
}

impl TrackedAllocator {
    /// Build an empty tracker.
    ///
    /// # Errors
    ///
    /// [`KernelError::AllocatorInitFailed`] when the block capacity is zero,
    /// the alignment is not a power of two, or the tag length is zero.
    pub fn new(
        config: &KernelConfig,
        heap: Arc<dyn HeapBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KernelError> {
        if config.max_memory_blocks == 0 {
            return Err(KernelError::AllocatorInitFailed(
                "max_memory_blocks must be greater than zero".to_string(),
            ));
        }
        if !config.memory_alignment.is_power_of_two() {
            return Err(KernelError::AllocatorInitFailed(format!(
                "memory_alignment {} is not a power of two",
                config.memory_alignment
            )));
        }
        if config.max_tag_len == 0 {
            return Err(KernelError::AllocatorInitFailed(
                "max_tag_len must be greater than zero".to_string(),
            ));
        }

        info!(
            capacity = config.max_memory_blocks,
            alignment = config.memory_alignment,
            "memory allocator initialised"
        );
        Ok(Self {
            table: TimedLock::new(
                "memory allocator",
                LockRank::Component,
                config.lock_timeout(),
                BlockTable {
                    slots: SlotArena::with_capacity(config.max_memory_blocks),
                    total_allocated: 0,
                    peak_allocated: 0,
                    allocation_count: 0,
                    free_count: 0,
                },
            ),
            heap,
            clock,
            alignment: config.memory_alignment,
            max_tag_len: config.max_tag_len,
        })
    }

    /// Allocate `size` bytes (rounded up to the alignment) labelled `tag`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidSize`] – `size` is zero.
    /// - [`KernelError::CapacityExceeded`] – no metadata slot is free.
    /// - [`KernelError::OutOfMemory`] – the platform heap has no room.
    /// - [`KernelError::LockTimeout`]
    #[instrument(name = "allocator_allocate", level = "debug", skip(self))]
    pub fn allocate(&self, size: usize, tag: &str) -> Result<BlockHandle, KernelError> {
        let aligned = self.aligned(size)?;
        let tag = truncate_tag(tag, self.max_tag_len);
        let mut table = self.table.lock()?;
        table.allocate(&*self.heap, aligned, tag, self.clock.now_ms())
    }

    /// Release a tracked block.
    ///
    /// An unknown or stale handle is reported as
    /// [`KernelError::UntrackedPointer`]; nothing is released and no slot
    /// changes.
    #[instrument(name = "allocator_free", level = "debug", skip(self), fields(block = %handle))]
    pub fn free(&self, handle: BlockHandle) -> Result<(), KernelError> {
        let mut table = self.table.lock()?;
        table.release(&*self.heap, handle).map(|_| ())
    }

    /// Resize a block by moving it.
    ///
    /// - `new_size == 0` frees `handle` (if any) and returns `None`.
    /// - `handle == None` allocates a fresh block tagged [`DEFAULT_TAG`].
    /// - Otherwise a new block with the old tag is allocated, the first
    ///   `min(old, new)` bytes are copied, and the old block is freed.
    ///
    /// The lookup, allocation, copy and release happen under one hold of the
    /// table lock, so a concurrent `free` of the same handle cannot slip in
    /// between them.  If any step fails, the old block stays allocated and
    /// tracked.
    #[instrument(name = "allocator_reallocate", level = "debug", skip(self))]
    pub fn reallocate(
        &self,
        handle: Option<BlockHandle>,
        new_size: usize,
    ) -> Result<Option<BlockHandle>, KernelError> {
        if new_size == 0 {
            if let Some(handle) = handle {
                self.free(handle)?;
            }
            return Ok(None);
        }
        let Some(old) = handle else {
            return self.allocate(new_size, DEFAULT_TAG).map(Some);
        };

        let aligned = self.aligned(new_size)?;
        let mut table = self.table.lock()?;
        let (old_address, old_size, tag) = {
            let record = table.lookup(old)?;
            (record.address, record.size, record.tag.clone())
        };

        let new = table.allocate(&*self.heap, aligned, tag, self.clock.now_ms())?;
        let new_address = table.lookup(new)?.address;
        if let Err(e) = self.heap.copy(old_address, new_address, old_size.min(aligned)) {
            warn!(%old, %new, error = %e, "reallocate copy failed");
            table.rollback(&*self.heap, new)?;
            return Err(KernelError::IntegrityViolation(e.to_string()));
        }
        table.release(&*self.heap, old)?;
        Ok(Some(new))
    }

    /// Write `data` into a tracked block at `offset`.
    pub fn write(&self, handle: BlockHandle, offset: usize, data: &[u8]) -> Result<(), KernelError> {
        let table = self.table.lock()?;
        let record = table.lookup(handle)?;
        if offset.checked_add(data.len()).is_none_or(|end| end > record.size) {
            return Err(KernelError::OutOfBounds {
                handle,
                offset,
                len: data.len(),
                size: record.size,
            });
        }
        self.heap
            .write(record.address, offset, data)
            .map_err(|e| KernelError::IntegrityViolation(e.to_string()))
    }

    /// Contents of a tracked block (its full aligned size).
    pub fn read(&self, handle: BlockHandle) -> Result<Vec<u8>, KernelError> {
        let table = self.table.lock()?;
        let record = table.lookup(handle)?;
        self.heap
            .read(record.address, record.size)
            .map_err(|e| KernelError::IntegrityViolation(e.to_string()))
    }

    /// Copy of the record behind `handle`.
    pub fn block_info(&self, handle: BlockHandle) -> Result<MemoryBlockRecord, KernelError> {
        let table = self.table.lock()?;
        table.lookup(handle).cloned()
    }

    /// Snapshot of every allocated block, in slot order.
    pub fn blocks(&self) -> Result<Vec<(BlockHandle, MemoryBlockRecord)>, KernelError> {
        let table = self.table.lock()?;
        Ok(table
            .slots
            .iter()
            .filter_map(|(slot, record)| {
                let generation = table.slots.generation(slot)?;
                Some((
                    BlockHandle {
                        slot: slot as u32,
                        generation,
                    },
                    record.clone(),
                ))
            })
            .collect())
    }

    pub fn stats(&self) -> Result<AllocatorStats, KernelError> {
        let table = self.table.lock()?;
        Ok(table.stats(&*self.heap))
    }

    /// Free heap reported by the platform.
    pub fn available_heap(&self) -> usize {
        self.heap.free_heap()
    }

    /// Largest free region reported by the platform.
    pub fn largest_free_block(&self) -> usize {
        self.heap.largest_free_block()
    }

    /// Share of free heap that is not part of the largest free region, in
    /// percent.  Zero when the heap is full or entirely contiguous.
    pub fn fragmentation(&self) -> u8 {
        let free = self.heap.free_heap();
        if free == 0 {
            return 0;
        }
        let largest = self.heap.largest_free_block().min(free);
        (100 - largest * 100 / free) as u8
    }

    /// Formatted table of every allocated block.
    pub fn memory_map(&self) -> Result<String, KernelError> {
        let table = self.table.lock()?;
        let now = self.clock.now_ms();
        let mut out = String::new();
        let _ = writeln!(out, "Memory Map:");
        let _ = writeln!(out, "Address    Size     Tag              Age(ms)");
        let _ = writeln!(out, "-----------------------------------------------");
        for (_, block) in table.slots.iter() {
            let _ = writeln!(
                out,
                "0x{:08X} {:>8} {:<16} {:>8}",
                block.address,
                block.size,
                block.tag,
                now.saturating_sub(block.timestamp_ms)
            );
        }
        Ok(out)
    }

    /// Formatted aggregate statistics.
    pub fn statistics_report(&self) -> Result<String, KernelError> {
        let stats = self.stats()?;
        let mut out = String::new();
        let _ = writeln!(out, "Memory Statistics:");
        let _ = writeln!(out, "Total Allocated: {} bytes", stats.total_allocated);
        let _ = writeln!(out, "Peak Allocated: {} bytes", stats.peak_allocated);
        let _ = writeln!(out, "Allocations: {}", stats.allocation_count);
        let _ = writeln!(out, "Frees: {}", stats.free_count);
        let _ = writeln!(out, "Blocks In Use: {}/{}", stats.blocks_in_use, stats.block_capacity);
        let _ = writeln!(out, "Available Heap: {} bytes", stats.available_heap);
        let _ = writeln!(out, "Largest Free Block: {} bytes", stats.largest_free_block);
        let _ = writeln!(out, "Fragmentation: {}%", self.fragmentation());
        Ok(out)
    }

    /// Verify the table's invariants.
    ///
    /// # Errors
    ///
    /// [`KernelError::IntegrityViolation`] describing the first mismatch.
    pub fn check_integrity(&self) -> Result<(), KernelError> {
        let table = self.table.lock()?;
        let mut sum = 0usize;
        let mut addresses = HashSet::new();
        for (slot, block) in table.slots.iter() {
            if !block.allocated {
                return Err(KernelError::IntegrityViolation(format!(
                    "slot {slot} holds a block not marked allocated"
                )));
            }
            if !addresses.insert(block.address) {
                return Err(KernelError::IntegrityViolation(format!(
                    "address 0x{:08X} tracked twice",
                    block.address
                )));
            }
            sum += block.size;
        }
        if sum != table.total_allocated {
            return Err(KernelError::IntegrityViolation(format!(
                "total_allocated {} != sum of block sizes {sum}",
                table.total_allocated
            )));
        }
        if table.peak_allocated < table.total_allocated {
            return Err(KernelError::IntegrityViolation(format!(
                "peak_allocated {} below total_allocated {}",
                table.peak_allocated, table.total_allocated
            )));
        }
        Ok(())
    }

    /// Forget every tracked block without releasing its memory.
    ///
    /// Used on the way down, when the process is about to terminate anyway.
    /// Counters other than `total_allocated` keep their values.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        let mut table = self.table.lock()?;
        let abandoned = table.slots.drain();
        table.total_allocated = 0;
        info!(abandoned = abandoned.len(), "memory allocator shut down");
        Ok(())
    }

    fn aligned(&self, size: usize) -> Result<usize, KernelError> {
        if size == 0 {
            warn!("rejected zero-sized allocation");
            return Err(KernelError::InvalidSize);
        }
        align_up(size, self.alignment).ok_or(KernelError::OutOfMemory { requested: size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use espos_hal::{HalError, ManualClock, SimHeap};
    use std::time::Duration;

    struct Fixture {
        alloc: TrackedAllocator,
        heap: Arc<SimHeap>,
        clock: Arc<ManualClock>,
    }

    fn fixture(blocks: usize, heap_size: usize) -> Fixture {
        let heap = Arc::new(SimHeap::new(heap_size));
        let clock = Arc::new(ManualClock::new());
        let config = KernelConfig {
            max_memory_blocks: blocks,
            ..KernelConfig::default()
        };
        let alloc = TrackedAllocator::new(&config, heap.clone(), clock.clone()).unwrap();
        Fixture { alloc, heap, clock }
    }

    fn sum_of_blocks(alloc: &TrackedAllocator) -> usize {
        alloc.blocks().unwrap().iter().map(|(_, b)| b.size).sum()
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(1, 4), Some(4));
        assert_eq!(align_up(4, 4), Some(4));
        assert_eq!(align_up(5, 8), Some(8));
        assert_eq!(align_up(usize::MAX, 4), None);
    }

    #[test]
    fn truncate_tag_respects_char_boundaries() {
        assert_eq!(truncate_tag("short", 15), "short");
        assert_eq!(truncate_tag("a_very_long_tag_name", 15), "a_very_long_tag");
        // 'é' is two bytes; cutting at 2 would split it.
        assert_eq!(truncate_tag("aé", 2), "a");
    }

    #[test]
    fn allocate_then_free_100_bytes() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(100, "x").unwrap();
        let info = f.alloc.block_info(block).unwrap();
        assert_eq!(info.size, 100);
        assert_eq!(info.tag, "x");
        assert_eq!(f.alloc.stats().unwrap().total_allocated, 100);

        f.alloc.free(block).unwrap();
        let stats = f.alloc.stats().unwrap();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.peak_allocated, 100);
    }

    #[test]
    fn size_is_aligned_before_accounting_and_platform_call() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(10, "rx").unwrap();
        assert_eq!(f.alloc.block_info(block).unwrap().size, 12);
        assert_eq!(f.heap.free_heap(), 4096 - 12);
    }

    #[test]
    fn zero_size_is_invalid_and_changes_nothing() {
        let f = fixture(8, 4096);
        f.alloc.allocate(8, "keep").unwrap();
        let before = f.alloc.stats().unwrap();
        assert_eq!(f.alloc.allocate(0, "x"), Err(KernelError::InvalidSize));
        assert_eq!(f.alloc.stats().unwrap(), before);
    }

    #[test]
    fn metadata_capacity_is_enforced_independently_of_heap() {
        let f = fixture(2, 1 << 20);
        f.alloc.allocate(4, "a").unwrap();
        f.alloc.allocate(4, "b").unwrap();
        let result = f.alloc.allocate(4, "c");
        assert!(matches!(
            result,
            Err(KernelError::CapacityExceeded {
                table: Table::MemoryBlocks,
                capacity: 2
            })
        ));
        assert_eq!(f.heap.live_blocks(), 2, "no platform allocation on a full table");
    }

    #[test]
    fn exhausted_heap_reports_out_of_memory() {
        let f = fixture(8, 64);
        let result = f.alloc.allocate(128, "big");
        assert_eq!(result, Err(KernelError::OutOfMemory { requested: 128 }));
        assert_eq!(f.alloc.stats().unwrap().allocation_count, 0);
    }

    #[test]
    fn long_tag_is_truncated() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(4, "network_receive_buffer").unwrap();
        assert_eq!(f.alloc.block_info(block).unwrap().tag, "network_receive");
    }

    #[test]
    fn untracked_free_is_a_reported_noop() {
        let f = fixture(8, 4096);
        let kept = f.alloc.allocate(16, "kept").unwrap();
        let before = f.alloc.blocks().unwrap();

        let bogus = BlockHandle {
            slot: 5,
            generation: 0,
        };
        assert_eq!(f.alloc.free(bogus), Err(KernelError::UntrackedPointer(bogus)));
        let out_of_range = BlockHandle {
            slot: 999,
            generation: 0,
        };
        assert_eq!(
            f.alloc.free(out_of_range),
            Err(KernelError::UntrackedPointer(out_of_range))
        );

        assert_eq!(f.alloc.blocks().unwrap(), before);
        assert_eq!(f.heap.live_blocks(), 1);
        assert!(f.alloc.block_info(kept).is_ok());
    }

    #[test]
    fn double_free_is_untracked() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(16, "once").unwrap();
        f.alloc.free(block).unwrap();
        assert_eq!(f.alloc.free(block), Err(KernelError::UntrackedPointer(block)));
        assert_eq!(f.alloc.stats().unwrap().free_count, 1);
    }

    #[test]
    fn stale_handle_does_not_match_reused_slot_or_address() {
        let f = fixture(8, 4096);
        let first = f.alloc.allocate(16, "first").unwrap();
        let first_addr = f.alloc.block_info(first).unwrap().address;
        f.alloc.free(first).unwrap();

        let second = f.alloc.allocate(16, "second").unwrap();
        assert_eq!(second.slot, first.slot);
        assert_eq!(f.alloc.block_info(second).unwrap().address, first_addr);

        assert_eq!(f.alloc.free(first), Err(KernelError::UntrackedPointer(first)));
        assert_eq!(f.alloc.block_info(second).unwrap().tag, "second");
    }

    #[test]
    fn reallocate_zero_behaves_like_free() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(32, "buf").unwrap();
        assert_eq!(f.alloc.reallocate(Some(block), 0), Ok(None));
        let stats = f.alloc.stats().unwrap();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.free_count, 1);
        assert_eq!(f.heap.live_blocks(), 0);
    }

    #[test]
    fn reallocate_none_behaves_like_allocate() {
        let f = fixture(8, 4096);
        let block = f.alloc.reallocate(None, 20).unwrap().unwrap();
        let info = f.alloc.block_info(block).unwrap();
        assert_eq!(info.size, 20);
        assert_eq!(info.tag, DEFAULT_TAG);
    }

    #[test]
    fn reallocate_moves_contents_and_keeps_tag() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(8, "frame").unwrap();
        f.alloc.write(block, 0, b"ABCDEFGH").unwrap();

        let grown = f.alloc.reallocate(Some(block), 16).unwrap().unwrap();
        assert_eq!(f.alloc.block_info(grown).unwrap().tag, "frame");
        assert_eq!(&f.alloc.read(grown).unwrap()[..8], b"ABCDEFGH");
        assert!(matches!(f.alloc.block_info(block), Err(KernelError::UntrackedPointer(_))));

        let shrunk = f.alloc.reallocate(Some(grown), 4).unwrap().unwrap();
        assert_eq!(f.alloc.read(shrunk).unwrap(), b"ABCD".to_vec());

        let stats = f.alloc.stats().unwrap();
        assert_eq!(stats.total_allocated, 4);
        assert_eq!(stats.allocation_count, 3);
        assert_eq!(stats.free_count, 2);
        assert_eq!(stats.peak_allocated, 24);
    }

    #[test]
    fn failed_reallocate_keeps_old_block() {
        let f = fixture(8, 64);
        let block = f.alloc.allocate(32, "keep").unwrap();
        f.alloc.write(block, 0, b"data").unwrap();

        let result = f.alloc.reallocate(Some(block), 64);
        assert_eq!(result, Err(KernelError::OutOfMemory { requested: 64 }));
        assert_eq!(&f.alloc.read(block).unwrap()[..4], b"data");
        assert_eq!(f.alloc.stats().unwrap().total_allocated, 32);
    }

    #[test]
    fn reallocate_with_full_table_keeps_old_block() {
        let f = fixture(2, 4096);
        let block = f.alloc.allocate(8, "keep").unwrap();
        f.alloc.write(block, 0, b"contents").unwrap();
        f.alloc.allocate(8, "filler").unwrap();
        let before = f.alloc.stats().unwrap();

        let result = f.alloc.reallocate(Some(block), 16);
        assert!(matches!(
            result,
            Err(KernelError::CapacityExceeded {
                table: Table::MemoryBlocks,
                capacity: 2
            })
        ));
        assert_eq!(f.alloc.read(block).unwrap(), b"contents".to_vec());
        assert_eq!(f.alloc.block_info(block).unwrap().tag, "keep");
        assert_eq!(f.alloc.stats().unwrap(), before);
        assert_eq!(f.heap.live_blocks(), 2);
    }

    /// Heap whose copies always fail; everything else goes to a [`SimHeap`].
    struct NoCopyHeap(SimHeap);

    impl HeapBackend for NoCopyHeap {
        fn alloc(&self, size: usize) -> Option<usize> {
            self.0.alloc(size)
        }
        fn release(&self, address: usize) {
            self.0.release(address)
        }
        fn copy(&self, src: usize, _dst: usize, _len: usize) -> Result<(), HalError> {
            Err(HalError::UnknownAddress(src))
        }
        fn write(&self, address: usize, offset: usize, data: &[u8]) -> Result<(), HalError> {
            self.0.write(address, offset, data)
        }
        fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, HalError> {
            self.0.read(address, len)
        }
        fn free_heap(&self) -> usize {
            self.0.free_heap()
        }
        fn min_free_heap(&self) -> usize {
            self.0.min_free_heap()
        }
        fn largest_free_block(&self) -> usize {
            self.0.largest_free_block()
        }
    }

    #[test]
    fn failed_copy_rolls_back_without_touching_counters() {
        let heap = Arc::new(NoCopyHeap(SimHeap::new(4096)));
        let alloc = TrackedAllocator::new(
            &KernelConfig::default(),
            heap.clone(),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        let block = alloc.allocate(8, "keep").unwrap();
        let before = alloc.stats().unwrap();

        let result = alloc.reallocate(Some(block), 32);
        assert!(matches!(result, Err(KernelError::IntegrityViolation(_))));

        let after = alloc.stats().unwrap();
        assert_eq!(after.allocation_count, before.allocation_count);
        assert_eq!(after.free_count, before.free_count);
        assert_eq!(after.total_allocated, 8);
        assert_eq!(after.blocks_in_use, 1);
        assert!(alloc.block_info(block).is_ok());
        assert_eq!(heap.0.live_blocks(), 1);
        alloc.check_integrity().unwrap();
    }

    #[test]
    fn reallocate_of_untracked_handle_fails() {
        let f = fixture(8, 4096);
        let bogus = BlockHandle {
            slot: 0,
            generation: 3,
        };
        assert_eq!(
            f.alloc.reallocate(Some(bogus), 16),
            Err(KernelError::UntrackedPointer(bogus))
        );
        assert_eq!(f.heap.live_blocks(), 0);
    }

    #[test]
    fn write_past_end_is_out_of_bounds() {
        let f = fixture(8, 4096);
        let block = f.alloc.allocate(4, "tiny").unwrap();
        assert!(matches!(
            f.alloc.write(block, 2, b"xyz"),
            Err(KernelError::OutOfBounds { size: 4, .. })
        ));
    }

    #[test]
    fn totals_match_blocks_over_mixed_sequence() {
        let f = fixture(16, 1 << 16);
        let mut live = Vec::new();
        let mut last_peak = 0;
        for i in 1..=40usize {
            match i % 5 {
                0 | 3 if !live.is_empty() => {
                    let h = live.remove(i % live.len());
                    f.alloc.free(h).unwrap();
                }
                4 if !live.is_empty() => {
                    let h = live.remove(0);
                    if let Some(n) = f.alloc.reallocate(Some(h), i * 3).unwrap() {
                        live.push(n);
                    }
                }
                _ => {
                    if let Ok(h) = f.alloc.allocate(i * 7, "mix") {
                        live.push(h);
                    }
                }
            }
            let stats = f.alloc.stats().unwrap();
            assert_eq!(stats.total_allocated, sum_of_blocks(&f.alloc));
            assert!(stats.peak_allocated >= stats.total_allocated);
            assert!(stats.peak_allocated >= last_peak);
            last_peak = stats.peak_allocated;
            f.alloc.check_integrity().unwrap();
        }
    }

    #[test]
    fn concurrent_alloc_free_keeps_totals_consistent() {
        let f = fixture(32, 1 << 20);
        let alloc = Arc::new(f.alloc);
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    for i in 0..50usize {
                        if let Ok(h) = alloc.allocate(1 + (t * 13 + i) % 97, "worker") {
                            if i % 3 != 0 {
                                alloc.free(h).unwrap();
                            }
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        alloc.check_integrity().unwrap();
        assert_eq!(alloc.stats().unwrap().total_allocated, sum_of_blocks(&alloc));
    }

    #[test]
    fn memory_map_lists_blocks_with_age() {
        let f = fixture(8, 4096);
        f.alloc.allocate(64, "wifi_rx").unwrap();
        f.clock.advance(Duration::from_millis(250));
        let map = f.alloc.memory_map().unwrap();
        assert!(map.contains("wifi_rx"));
        assert!(map.contains("0x3FFB0000"));
        assert!(map.contains("250"));
    }

    #[test]
    fn statistics_report_includes_counters() {
        let f = fixture(8, 4096);
        let h = f.alloc.allocate(40, "a").unwrap();
        f.alloc.free(h).unwrap();
        let report = f.alloc.statistics_report().unwrap();
        assert!(report.contains("Peak Allocated: 40 bytes"));
        assert!(report.contains("Allocations: 1"));
        assert!(report.contains("Frees: 1"));
    }

    #[test]
    fn fragmentation_reflects_platform_holes() {
        let f = fixture(8, 300);
        let a = f.alloc.allocate(100, "a").unwrap();
        let _b = f.alloc.allocate(100, "b").unwrap();
        assert_eq!(f.alloc.fragmentation(), 0);
        f.alloc.free(a).unwrap();
        // 200 free: one 100-byte hole and a 100-byte tail.
        assert_eq!(f.alloc.available_heap(), 200);
        assert_eq!(f.alloc.largest_free_block(), 100);
        assert_eq!(f.alloc.fragmentation(), 50);
    }

    #[test]
    fn shutdown_forgets_blocks_without_releasing() {
        let f = fixture(8, 4096);
        f.alloc.allocate(16, "a").unwrap();
        f.alloc.allocate(16, "b").unwrap();
        f.alloc.shutdown().unwrap();
        let stats = f.alloc.stats().unwrap();
        assert_eq!(stats.blocks_in_use, 0);
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.peak_allocated, 32);
        assert_eq!(f.heap.live_blocks(), 2, "memory is left to the platform");
        f.alloc.check_integrity().unwrap();
    }

    #[test]
    fn bad_alignment_fails_init() {
        let config = KernelConfig {
            memory_alignment: 3,
            ..KernelConfig::default()
        };
        let result = TrackedAllocator::new(
            &config,
            Arc::new(SimHeap::new(64)),
            Arc::new(ManualClock::new()),
        );
        assert!(matches!(result, Err(KernelError::AllocatorInitFailed(_))));
    }
}
