//! In-process simulated heap for running the kernel core without hardware.
//!
//! [`SimHeap`] models a fixed-size heap region starting at [`HEAP_BASE`].
//! New blocks are carved from a bump pointer; released blocks become holes
//! that later requests reuse first-fit, so addresses do get recycled the way
//! a real allocator recycles them.  Each live block carries a real byte
//! buffer so copies and reads behave like memory.
//!
//! External pressure (memory the tracking layer cannot see, such as driver
//! buffers or other tasks' stacks) is simulated with
//! [`SimHeap::reserve_external`] and [`SimHeap::release_external`].
//!
//! # Example
//!
//! ```rust
//! use espos_hal::{HeapBackend, SimHeap};
//!
//! let heap = SimHeap::new(1024);
//! let addr = heap.alloc(100).expect("fits");
//! assert_eq!(heap.free_heap(), 924);
//! heap.release(addr);
//! assert_eq!(heap.free_heap(), 1024);
//! assert_eq!(heap.min_free_heap(), 924);
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::HalError;
use crate::heap::HeapBackend;

/// Address of the first byte of the simulated heap region.
pub const HEAP_BASE: usize = 0x3FFB_0000;

struct LiveBlock {
    capacity: usize,
    data: Vec<u8>,
}

struct HeapState {
    /// Offset of the first never-used byte.
    brk: usize,
    /// Released regions below `brk`, as `(offset, len)`, sorted by offset
    /// and never adjacent to each other.
    holes: Vec<(usize, usize)>,
    live: HashMap<usize, LiveBlock>,
    used: usize,
    external: usize,
    min_free: usize,
}

impl HeapState {
    /// Return `[offset, offset + len)` to the free space, coalescing with
    /// neighbouring holes and pulling `brk` back over a trailing hole.
    fn insert_hole(&mut self, offset: usize, len: usize) {
        let i = self.holes.partition_point(|&(o, _)| o < offset);
        self.holes.insert(i, (offset, len));

        if i + 1 < self.holes.len() {
            let (o, l) = self.holes[i];
            let (next_o, next_l) = self.holes[i + 1];
            if o + l == next_o {
                self.holes[i] = (o, l + next_l);
                self.holes.remove(i + 1);
            }
        }
        let mut i = i;
        if i > 0 {
            let (prev_o, prev_l) = self.holes[i - 1];
            let (o, l) = self.holes[i];
            if prev_o + prev_l == o {
                self.holes[i - 1] = (prev_o, prev_l + l);
                self.holes.remove(i);
                i -= 1;
            }
        }
        if let Some(&(o, l)) = self.holes.get(i)
            && o + l == self.brk
        {
            self.brk = o;
            self.holes.remove(i);
        }
    }
}

/// Simulated fixed-size heap.
pub struct SimHeap {
    capacity: usize,
    state: Mutex<HeapState>,
}

impl SimHeap {
    /// Create a heap of `capacity` bytes with nothing allocated.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(HeapState {
                brk: 0,
                holes: Vec::new(),
                live: HashMap::new(),
                used: 0,
                external: 0,
                min_free: capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark `bytes` as consumed by something outside the tracking layer.
    /// Clamped to the currently free space.
    pub fn reserve_external(&self, bytes: usize) {
        let mut state = self.state.lock();
        let free = self.free_locked(&state);
        state.external += bytes.min(free);
        self.note_free(&mut state);
    }

    /// Give back external usage previously reserved.
    pub fn release_external(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.external = state.external.saturating_sub(bytes);
    }

    /// Number of blocks currently handed out.
    pub fn live_blocks(&self) -> usize {
        self.state.lock().live.len()
    }

    fn free_locked(&self, state: &HeapState) -> usize {
        self.capacity
            .saturating_sub(state.used)
            .saturating_sub(state.external)
    }

    fn note_free(&self, state: &mut HeapState) {
        let free = self.free_locked(state);
        if free < state.min_free {
            state.min_free = free;
        }
    }
}

impl HeapBackend for SimHeap {
    fn alloc(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let mut state = self.state.lock();
        if size > self.free_locked(&state) {
            return None;
        }

        let offset = match state.holes.iter().position(|&(_, cap)| cap >= size) {
            Some(i) => {
                let (offset, cap) = state.holes[i];
                if cap == size {
                    state.holes.remove(i);
                } else {
                    state.holes[i] = (offset + size, cap - size);
                }
                offset
            }
            None => {
                let end = state.brk.checked_add(size)?;
                if end > self.capacity {
                    return None;
                }
                let offset = state.brk;
                state.brk = end;
                offset
            }
        };
        let capacity = size;

        let address = HEAP_BASE + offset;
        state.live.insert(
            address,
            LiveBlock {
                capacity,
                data: vec![0u8; capacity],
            },
        );
        state.used += capacity;
        self.note_free(&mut state);
        trace!(address, size, capacity, "sim heap alloc");
        Some(address)
    }

    fn release(&self, address: usize) {
        let mut state = self.state.lock();
        if let Some(block) = state.live.remove(&address) {
            state.used -= block.capacity;
            state.insert_hole(address - HEAP_BASE, block.capacity);
            trace!(address, capacity = block.capacity, "sim heap release");
        }
    }

    fn copy(&self, src: usize, dst: usize, len: usize) -> Result<(), HalError> {
        let mut state = self.state.lock();
        let bytes = {
            let from = state.live.get(&src).ok_or(HalError::UnknownAddress(src))?;
            if len > from.capacity {
                return Err(HalError::OutOfRange {
                    address: src,
                    len,
                    capacity: from.capacity,
                });
            }
            from.data[..len].to_vec()
        };
        let to = state
            .live
            .get_mut(&dst)
            .ok_or(HalError::UnknownAddress(dst))?;
        if len > to.capacity {
            return Err(HalError::OutOfRange {
                address: dst,
                len,
                capacity: to.capacity,
            });
        }
        to.data[..len].copy_from_slice(&bytes);
        Ok(())
    }

    fn write(&self, address: usize, offset: usize, data: &[u8]) -> Result<(), HalError> {
        let mut state = self.state.lock();
        let block = state
            .live
            .get_mut(&address)
            .ok_or(HalError::UnknownAddress(address))?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= block.capacity)
            .ok_or(HalError::OutOfRange {
                address,
                len: data.len(),
                capacity: block.capacity,
            })?;
        block.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, HalError> {
        let state = self.state.lock();
        let block = state
            .live
            .get(&address)
            .ok_or(HalError::UnknownAddress(address))?;
        if len > block.capacity {
            return Err(HalError::OutOfRange {
                address,
                len,
                capacity: block.capacity,
            });
        }
        Ok(block.data[..len].to_vec())
    }

    fn free_heap(&self) -> usize {
        let state = self.state.lock();
        self.free_locked(&state)
    }

    fn min_free_heap(&self) -> usize {
        self.state.lock().min_free
    }

    fn largest_free_block(&self) -> usize {
        let state = self.state.lock();
        let tail = self.capacity.saturating_sub(state.brk);
        let largest_hole = state.holes.iter().map(|&(_, cap)| cap).max().unwrap_or(0);
        tail.max(largest_hole).min(self.free_locked(&state))
    }
}
