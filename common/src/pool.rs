//! Bounded free-list pooling for reusable objects.
//!
//! The JSON value arena and the FIX engine recycle their container storage
//! through [`Pool`] so that steady-state parsing performs no allocation.

/// Restores an object to its pristine state before it re-enters the pool.
pub trait Reset {
    fn reset(&mut self);
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// A free list of reusable objects.
///
/// `borrow` pops a recycled object or constructs a fresh one; `give_back`
/// resets the object and pushes it. When a capacity bound is set, returns
/// beyond the bound are simply dropped.
#[derive(Debug)]
pub struct Pool<T: Reset + Default> {
    free: Vec<T>,
    capacity: Option<usize>,
}

impl<T: Reset + Default> Pool<T> {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            capacity: None,
        }
    }

    /// A pool that never holds more than `capacity` idle objects.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Pops a recycled object, or constructs one when the free list is empty.
    pub fn borrow(&mut self) -> T {
        self.free.pop().unwrap_or_default()
    }

    /// Resets `value` and returns it to the free list.
    pub fn give_back(&mut self, mut value: T) {
        if let Some(cap) = self.capacity {
            if self.free.len() >= cap {
                return;
            }
        }
        value.reset();
        self.free.push(value);
    }

    /// Number of idle objects currently held.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl<T: Reset + Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}
