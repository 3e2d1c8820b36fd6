//! Fixed-capacity slot arena with an index free list.
//!
//! Both kernel tables are arenas of this kind: capacity is set once, a free
//! slot is found in O(1), and each slot carries a generation counter that
//! advances every time the slot is emptied.

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    /// Indices of empty slots.  Popped from the back, so the lowest index is
    /// handed out first on a fresh arena.
    free: Vec<usize>,
}

impl<T> SlotArena<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    value: None,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Place `value` in a free slot and return `(index, generation)`.
    /// Hands `value` back when the arena is full.
    pub(crate) fn insert(&mut self, value: T) -> Result<(usize, u32), T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        Ok((index, slot.generation))
    }

    /// Empty slot `index` if it is occupied and, when given, its generation
    /// matches.
    pub(crate) fn remove(&mut self, index: usize, generation: Option<u32>) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        if generation.is_some_and(|g| g != slot.generation) {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(value)
    }

    pub(crate) fn get(&self, index: usize, generation: Option<u32>) -> Option<&T> {
        let slot = self.slots.get(index)?;
        if generation.is_some_and(|g| g != slot.generation) {
            return None;
        }
        slot.value.as_ref()
    }

    /// Current generation of an occupied slot.
    pub(crate) fn generation(&self, index: usize) -> Option<u32> {
        let slot = self.slots.get(index)?;
        slot.value.as_ref().map(|_| slot.generation)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.value.as_mut()
    }

    /// Occupied slots in index order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_ref().map(|v| (i, v)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_mut().map(|v| (i, v)))
    }

    /// Empty every slot, returning the values that were held.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        for slot in &mut self.slots {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                drained.push(value);
            }
        }
        self.free = (0..self.slots.len()).rev().collect();
        drained
    }
}
