//! Generation-checked handles into a [`ResourcePool`](super::resource_pool::ResourcePool).
//!
//! A handle is a weak reference plus a lookup key: `index` names a pool slot and
//! `generation` must match the slot's current generation for the handle to be
//! live. Handles for different resource kinds are different types, so a texture
//! handle cannot be passed where a model handle is expected.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Slot index carried by an invalid handle.
pub const INVALID_INDEX: u32 = u32::MAX;
/// Generation carried by an invalid handle. Live slots never use it.
pub const INVALID_GENERATION: u32 = 0;

pub struct Handle<T> {
    index: u32,
    generation: u32,
    // fn() -> T keeps the handle Send + Sync + Copy whatever T is.
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn invalid() -> Self {
        Self::new(INVALID_INDEX, INVALID_GENERATION)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Structural check only. Says nothing about whether the slot is still occupied.
    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.index != INVALID_INDEX) & (self.generation != INVALID_GENERATION)
    }

    #[inline]
    pub fn invalidate(&mut self) {
        *self = Self::invalid();
    }
}

impl<T> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({}:{})", self.index, self.generation)
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

impl<T> From<Handle<T>> for bool {
    #[inline]
    fn from(handle: Handle<T>) -> bool {
        handle.is_valid()
    }
}
