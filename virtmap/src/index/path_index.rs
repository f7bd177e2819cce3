//! A dense array of disk locations keyed by path or chunk id.

use crate::store::DiskLocation;

/// A dense `id -> DiskLocation` index. Slots outside the current size read as
/// [`DiskLocation::NULL`], and writes beyond the end grow the index.
///
/// The leaf index is sized `last_leaf_path + 1` and keyed by path; the chunk index is
/// sized by the chunk-count function of the leaf range and keyed by chunk id.
#[derive(Debug, Clone, Default)]
pub struct PathIndex {
    slots: Vec<DiskLocation>,
}

impl PathIndex {
    pub fn new() -> Self {
        PathIndex { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The location stored at `id`, or `default` when the slot is out of range or
    /// unset.
    pub fn get(&self, id: i64, default: DiskLocation) -> DiskLocation {
        if id < 0 {
            return default;
        }
        match self.slots.get(id as usize) {
            Some(loc) if !loc.is_null() => *loc,
            _ => default,
        }
    }

    /// Store a location at `id`, growing the index if needed.
    pub fn put(&mut self, id: i64, location: DiskLocation) {
        assert!(id >= 0, "negative index id: {}", id);
        let id = id as usize;
        if id >= self.slots.len() {
            self.slots.resize(id + 1, DiskLocation::NULL);
        }
        self.slots[id] = location;
    }

    /// Clear the slot at `id`, if in range.
    pub fn clear(&mut self, id: i64) {
        if id >= 0 {
            if let Some(slot) = self.slots.get_mut(id as usize) {
                *slot = DiskLocation::NULL;
            }
        }
    }

    /// Resize to exactly `len` slots, filling new slots with the null location.
    pub fn resize(&mut self, len: usize) {
        self.slots.resize(len, DiskLocation::NULL);
    }

    /// Drop all slots at or beyond `len`.
    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }
}
