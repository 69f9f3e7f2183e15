//! # Generational resource pool
//!
//! Slot-based arena storing resources of one type:
//!
//! * **Stable handles** – index + generation, O(1) liveness check without the
//!   resource knowing who refers to it.
//! * **Free-list reuse** – vacated slots are recycled FIFO; their generation is
//!   bumped when vacated, never when reused.
//! * **Per-slot reference counts** – `release` only decrements; slots are freed
//!   by `release_unused` (ref count zero) or `remove` (unconditional).
//!
//! The pool is not synchronized. It is mutated through `&mut self`, which is what
//! keeps it on the thread that owns the graphics context.

// -----------------------------------------------------------------------------
// Imports
// -----------------------------------------------------------------------------

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use super::handle::{Handle, INVALID_GENERATION};

// -----------------------------------------------------------------------------
// Slot
// -----------------------------------------------------------------------------

struct ResourceEntry<T> {
    resource: Option<Arc<T>>,
    generation: u32,
    ref_count: u32,
}

impl<T> ResourceEntry<T> {
    #[inline]
    fn in_use(&self) -> bool {
        self.resource.is_some()
    }

    /// Empties the slot and moves it to the next generation.
    fn vacate(&mut self) -> Option<Arc<T>> {
        let resource = self.resource.take();
        self.ref_count = 0;
        self.generation = next_generation(self.generation);
        resource
    }
}

#[inline]
fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        INVALID_GENERATION => 1,
        g => g,
    }
}

// -----------------------------------------------------------------------------
// Pool
// -----------------------------------------------------------------------------

pub struct ResourcePool<T> {
    entries: Vec<ResourceEntry<T>>,
    free_list: VecDeque<u32>,
    live: usize,
}

impl<T> Default for ResourcePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourcePool<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: VecDeque::new(),
            live: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: VecDeque::new(),
            live: 0,
        }
    }

    /// Takes ownership of `resource` and returns a handle with ref count 1.
    pub fn add(&mut self, resource: T) -> Handle<T> {
        self.add_shared(Arc::new(resource))
    }

    pub fn add_shared(&mut self, resource: Arc<T>) -> Handle<T> {
        self.live += 1;

        if let Some(index) = self.free_list.pop_front() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(!entry.in_use(), "free-listed slot {index} is occupied");
            entry.resource = Some(resource);
            entry.ref_count = 1;
            return Handle::new(index, entry.generation);
        }

        let index = self.entries.len() as u32;
        self.entries.push(ResourceEntry {
            resource: Some(resource),
            generation: 1,
            ref_count: 1,
        });
        Handle::new(index, 1)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        self.entry(handle).and_then(|e| e.resource.clone())
    }

    /// Structurally valid, in bounds, occupied, and the generation matches.
    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        self.entry(handle).is_some()
    }

    /// Returns the new ref count, or 0 for a stale handle.
    pub fn add_ref(&mut self, handle: Handle<T>) -> u32 {
        match self.entry_mut(handle) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_add(1);
                entry.ref_count
            }
            None => 0,
        }
    }

    /// Decrements the ref count (clamped at zero). Never frees the slot.
    pub fn release(&mut self, handle: Handle<T>) -> u32 {
        match self.entry_mut(handle) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count
            }
            None => 0,
        }
    }

    pub fn ref_count(&self, handle: Handle<T>) -> Option<u32> {
        self.entry(handle).map(|e| e.ref_count)
    }

    /// Frees the slot regardless of its ref count. Every outstanding handle to it
    /// goes stale.
    pub fn remove(&mut self, handle: Handle<T>) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        self.free_slot(handle.index());
        true
    }

    /// Frees every occupied slot whose ref count is zero.
    pub fn release_unused(&mut self) -> usize {
        let unused: Vec<u32> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.in_use() && e.ref_count == 0)
            .map(|(i, _)| i as u32)
            .collect();

        for &index in &unused {
            self.free_slot(index);
        }
        unused.len()
    }

    /// Vacates every occupied slot. Slots are kept so their generations survive
    /// and handles issued before the clear stay stale after later adds.
    pub fn clear(&mut self) {
        for index in 0..self.entries.len() {
            if self.entries[index].in_use() {
                self.free_slot(index as u32);
            }
        }
        debug_assert_eq!(self.live, 0);
    }

    /// Visits occupied slots in index order.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(Handle<T>, &T),
    {
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(resource) = &entry.resource {
                visitor(Handle::new(index as u32, entry.generation), resource);
            }
        }
    }

    /// Number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total slots, occupied or free.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn generation_of(&self, index: u32) -> Option<u32> {
        self.entries.get(index as usize).map(|e| e.generation)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn entry(&self, handle: Handle<T>) -> Option<&ResourceEntry<T>> {
        if !handle.is_valid() {
            return None;
        }
        self.entries
            .get(handle.index() as usize)
            .filter(|e| e.in_use() && e.generation == handle.generation())
    }

    fn entry_mut(&mut self, handle: Handle<T>) -> Option<&mut ResourceEntry<T>> {
        if !handle.is_valid() {
            return None;
        }
        self.entries
            .get_mut(handle.index() as usize)
            .filter(|e| e.in_use() && e.generation == handle.generation())
    }

    fn free_slot(&mut self, index: u32) {
        // The resource is dropped here unless someone still holds the Arc from `get`.
        let _ = self.entries[index as usize].vacate();
        self.free_list.push_back(index);
        self.live -= 1;
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("live", &self.live)
            .field("slots", &self.entries.len())
            .field("free", &self.free_list.len())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Blob(&'static str);

    #[test]
    fn add_then_get_returns_the_resource() {
        let mut pool = ResourcePool::new();
        let h = pool.add(Blob("a"));
        assert!(h.is_valid());
        assert!(pool.is_valid(h));
        assert_eq!(*pool.get(h).unwrap(), Blob("a"));
        assert_eq!(pool.ref_count(h), Some(1));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn removed_handles_go_stale_even_after_reuse() {
        let mut pool = ResourcePool::new();
        let old = pool.add(Blob("old"));
        assert!(pool.remove(old));
        assert!(!pool.is_valid(old));
        assert!(pool.get(old).is_none());
        assert!(!pool.remove(old));

        let new = pool.add(Blob("new"));
        assert_eq!(new.index(), old.index());
        assert!(!pool.is_valid(old));
        assert!(pool.is_valid(new));
        assert_eq!(pool.add_ref(old), 0);
        assert_eq!(pool.release(old), 0);
    }

    #[test]
    fn generation_grows_by_one_per_cycle() {
        let mut pool = ResourcePool::new();
        let first = pool.add(Blob("x"));
        let initial = first.generation();

        let mut h = first;
        for _ in 0..5 {
            pool.remove(h);
            h = pool.add(Blob("x"));
            assert_eq!(h.index(), first.index());
        }
        assert_eq!(h.generation(), initial + 5);
        assert_eq!(pool.generation_of(first.index()), Some(initial + 5));
    }

    #[test]
    fn three_resources_remove_second_then_add_fourth() {
        let mut pool = ResourcePool::new();
        let a = pool.add(Blob("a"));
        let b = pool.add(Blob("b"));
        let c = pool.add(Blob("c"));

        assert!(pool.remove(b));
        let d = pool.add(Blob("d"));

        assert_eq!(d.index(), b.index());
        assert_eq!(d.generation(), b.generation() + 1);
        assert!(!pool.is_valid(b));
        assert!(pool.is_valid(a));
        assert!(pool.is_valid(c));
        assert_eq!(*pool.get(d).unwrap(), Blob("d"));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn free_list_is_fifo() {
        let mut pool = ResourcePool::new();
        let handles: Vec<_> = (0..4).map(|_| pool.add(Blob("x"))).collect();
        pool.remove(handles[2]);
        pool.remove(handles[0]);

        assert_eq!(pool.add(Blob("y")).index(), 2);
        assert_eq!(pool.add(Blob("z")).index(), 0);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn release_unused_frees_exactly_zero_ref_slots() {
        let mut pool = ResourcePool::new();
        let kept = pool.add(Blob("kept"));
        let dropped = pool.add(Blob("dropped"));
        let shared = pool.add(Blob("shared"));

        pool.add_ref(shared);
        assert_eq!(pool.release(dropped), 0);
        assert_eq!(pool.release(shared), 1);

        assert_eq!(pool.release_unused(), 1);
        assert!(pool.is_valid(kept));
        assert!(pool.is_valid(shared));
        assert!(!pool.is_valid(dropped));

        // Nothing left at zero.
        assert_eq!(pool.release_unused(), 0);
    }

    #[test]
    fn release_clamps_at_zero() {
        let mut pool = ResourcePool::new();
        let h = pool.add(Blob("a"));
        assert_eq!(pool.release(h), 0);
        assert_eq!(pool.release(h), 0);
        assert!(pool.is_valid(h));
        assert_eq!(pool.add_ref(h), 1);
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut pool = ResourcePool::new();
        let a = pool.add(Blob("a"));
        let b = pool.add(Blob("b"));
        pool.remove(a);
        pool.clear();

        assert!(!pool.is_valid(a));
        assert!(!pool.is_valid(b));
        assert!(pool.is_empty());
        assert_eq!(pool.slot_count(), 2);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn clear_then_add_never_revives_old_handles() {
        let mut pool = ResourcePool::new();
        let old = pool.add(Blob("old"));
        let other = pool.add(Blob("other"));
        pool.clear();

        let new = pool.add(Blob("new"));
        let next = pool.add(Blob("next"));
        assert_eq!(new.index(), old.index());
        assert_eq!(next.index(), other.index());
        assert!(!pool.is_valid(old));
        assert!(!pool.is_valid(other));
        assert!(pool.get(old).is_none());
        assert_eq!(pool.add_ref(old), 0);
        assert_eq!(*pool.get(new).unwrap(), Blob("new"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn for_each_visits_occupied_slots_in_order() {
        let mut pool = ResourcePool::new();
        let a = pool.add(Blob("a"));
        let b = pool.add(Blob("b"));
        let c = pool.add(Blob("c"));
        pool.remove(b);

        let mut seen = Vec::new();
        pool.for_each(|h, r| seen.push((h, r.0)));
        assert_eq!(seen, vec![(a, "a"), (c, "c")]);
    }

    #[test]
    fn get_keeps_resource_alive_after_remove() {
        let mut pool = ResourcePool::new();
        let h = pool.add(Blob("held"));
        let held = pool.get(h).unwrap();
        pool.remove(h);
        assert_eq!(*held, Blob("held"));
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn invalid_handle_is_never_live() {
        let mut pool = ResourcePool::new();
        pool.add(Blob("a"));
        assert!(!pool.is_valid(Handle::invalid()));
        assert!(!pool.is_valid(Handle::new(42, 1)));
        assert!(!pool.is_valid(Handle::new(0, 2)));
    }

    #[test]
    fn generation_skips_the_invalid_sentinel_on_wrap() {
        assert_eq!(next_generation(u32::MAX), 1);
        assert_eq!(next_generation(1), 2);
    }
}
