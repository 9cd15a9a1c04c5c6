//! Indexable binary min-heap.
//!
//! Keys are 64-bit values compared through their signed difference, so a tick counter or a
//! virtual clock that wraps around still orders correctly as long as live keys are less than
//! `2^63` apart.
//!
//! The root is at slot 0 and the children of slot `i` are `2i + 1` and `2i + 2`. A heap built
//! with [`Heap::with_positions`] also tracks the slot of every object it holds, which is what
//! allows [`Heap::extract`] to remove an arbitrary object instead of only the root.

use std::hash::Hash;

use rustc_hash::FxHashMap;

/// A heap key: either a scheduler tick or a WF2Q+ virtual time.
pub type Key = u64;

/// Grow the backing storage in blocks of this many entries.
const HEAP_INCREMENT: usize = 16;

/// Returns `true` if `a` orders strictly before `b`.
#[inline]
pub const fn key_lt(a: Key, b: Key) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Returns `true` if `a` orders before or at `b`.
#[inline]
pub const fn key_leq(a: Key, b: Key) -> bool {
    (a.wrapping_sub(b) as i64) <= 0
}

/// Returns `true` if `a` orders strictly after `b`.
#[inline]
pub const fn key_gt(a: Key, b: Key) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

/// Returns the later of two keys.
#[inline]
pub const fn max_key(a: Key, b: Key) -> Key {
    if key_gt(b, a) {
        b
    } else {
        a
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("failed to grow heap to {0} entries")]
    Grow(usize),
}

/// A single heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry<T> {
    pub key: Key,
    pub object: T,
}

/// Binary min-heap over `(key, object)` pairs.
#[derive(Debug, Clone)]
pub struct Heap<T> {
    entries: Vec<HeapEntry<T>>,
    /// Slot of every object, maintained on every structural mutation. Only present on heaps
    /// that support extraction from the middle.
    positions: Option<FxHashMap<T, usize>>,
}

impl<T: Copy + Eq + Hash> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Eq + Hash> Heap<T> {
    /// Creates a heap that only supports extracting its root.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            positions: None,
        }
    }

    /// Creates a heap that tracks the slot of each object, allowing [`Heap::extract`] with a
    /// specific object.
    pub fn with_positions() -> Self {
        Self {
            entries: Vec::new(),
            positions: Some(FxHashMap::default()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the minimum entry without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&HeapEntry<T>> {
        self.entries.first()
    }

    /// Iterates over the entries in slot order (not key order).
    pub fn iter(&self) -> impl Iterator<Item = &HeapEntry<T>> + '_ {
        self.entries.iter()
    }

    /// Returns the tracked slot of `object`. Always `None` on heaps without position tracking.
    pub fn position(&self, object: &T) -> Option<usize> {
        self.positions.as_ref().and_then(|p| p.get(object).copied())
    }

    /// Returns `true` if `object` is in the heap.
    pub fn contains(&self, object: &T) -> bool {
        match &self.positions {
            Some(positions) => positions.contains_key(object),
            None => self.entries.iter().any(|e| e.object == *object),
        }
    }

    /// Inserts `object` with the given key.
    ///
    /// On error the heap is left untouched.
    pub fn insert(&mut self, key: Key, object: T) -> Result<(), HeapError> {
        if self.entries.len() == self.entries.capacity() {
            self.entries
                .try_reserve(HEAP_INCREMENT)
                .map_err(|_| HeapError::Grow(self.entries.len() + 1))?;
        }

        if let Some(positions) = self.positions.as_mut() {
            positions
                .try_reserve(1)
                .map_err(|_| HeapError::Grow(self.entries.len() + 1))?;
        }

        let slot = self.entries.len();
        self.entries.push(HeapEntry { key, object });
        self.set_position(slot);
        self.sift_up(slot);

        Ok(())
    }

    /// Removes and returns the root.
    ///
    /// # Panics
    ///
    /// Panics if the heap is empty.
    pub fn pop(&mut self) -> HeapEntry<T> {
        self.extract(None)
    }

    /// Removes the root, or `object` if given.
    ///
    /// # Panics
    ///
    /// Panics if the heap is empty, if `object` is given on a heap without position tracking,
    /// or if `object` is not in the heap. All of these are logic errors in the caller.
    pub fn extract(&mut self, object: Option<&T>) -> HeapEntry<T> {
        assert!(!self.entries.is_empty(), "extract from empty heap");

        let slot = match object {
            None => 0,
            Some(object) => {
                let Some(positions) = self.positions.as_ref() else {
                    panic!("extract from the middle is not supported on this heap");
                };

                match positions.get(object) {
                    Some(&slot) if slot < self.entries.len() => slot,
                    Some(&slot) => {
                        panic!("heap slot {slot} out of bounds 0..{}", self.entries.len())
                    }
                    None => panic!("extract of an object that is not in the heap"),
                }
            }
        };

        self.remove_at(slot)
    }

    /// Removes every entry for which `keep` returns `false`, then rebuilds the heap.
    ///
    /// Returns the number of removed entries.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&HeapEntry<T>) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        let removed = before - self.entries.len();

        if removed > 0 {
            self.heapify();
        }

        removed
    }

    /// Restores the heap property over the whole array, e.g. after bulk removal.
    pub fn heapify(&mut self) {
        let len = self.entries.len();
        for slot in (0..len / 2).rev() {
            self.sift_down(slot);
        }

        if let Some(positions) = self.positions.as_mut() {
            positions.clear();
            for (slot, entry) in self.entries.iter().enumerate() {
                positions.insert(entry.object, slot);
            }
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(positions) = self.positions.as_mut() {
            positions.clear();
        }
    }

    /// Checks the heap property and, on tracking heaps, that every stored position matches
    /// the slot its object occupies.
    pub fn is_well_formed(&self) -> bool {
        let ordered = (1..self.entries.len())
            .all(|i| !key_lt(self.entries[i].key, self.entries[(i - 1) / 2].key));

        let tracked = match &self.positions {
            None => true,
            Some(positions) => {
                positions.len() == self.entries.len() &&
                    self.entries
                        .iter()
                        .enumerate()
                        .all(|(slot, e)| positions.get(&e.object) == Some(&slot))
            }
        };

        ordered && tracked
    }

    fn remove_at(&mut self, slot: usize) -> HeapEntry<T> {
        let last = self.entries.len() - 1;
        self.entries.swap(slot, last);
        let removed = self.entries.pop().expect("heap is not empty");

        if let Some(positions) = self.positions.as_mut() {
            positions.remove(&removed.object);
        }

        if slot < self.entries.len() {
            self.set_position(slot);
            let slot = self.sift_down(slot);
            self.sift_up(slot);
        }

        removed
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !key_lt(self.entries[slot].key, self.entries[parent].key) {
                break;
            }

            self.entries.swap(slot, parent);
            self.set_position(slot);
            self.set_position(parent);
            slot = parent;
        }

        slot
    }

    fn sift_down(&mut self, mut slot: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            if left >= len {
                break;
            }

            let right = left + 1;
            let child = if right < len && key_lt(self.entries[right].key, self.entries[left].key)
            {
                right
            } else {
                left
            };

            if !key_lt(self.entries[child].key, self.entries[slot].key) {
                break;
            }

            self.entries.swap(slot, child);
            self.set_position(slot);
            self.set_position(child);
            slot = child;
        }

        slot
    }

    #[inline]
    fn set_position(&mut self, slot: usize) {
        if let Some(positions) = self.positions.as_mut() {
            positions.insert(self.entries[slot].object, slot);
        }
    }
}
