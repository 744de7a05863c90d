//! Fixed-capacity lock-free object pool.
//!
//! A [`SlotPool`] owns a pre-constructed arena of objects plus an MPMC queue
//! of free slot indices. `acquire`/`release` are non-blocking `pop`/`push`
//! on the queue; the arena is never resized, so no allocation happens after
//! construction.
//!
//! Conservation invariant, for the lifetime of the pool:
//!
//! ```text
//! pooled_count() + in-use slots == capacity()
//! ```
//!
//! Any thread may acquire or release concurrently. The pool hands out slot
//! *indices* rather than guards; callers pair every successful `acquire`
//! with exactly one `release` of the same index. Pooled objects carry their
//! own interior synchronization for the in-use phase.

use crossbeam_queue::ArrayQueue;

/// Fixed arena of `T` with a lock-free free list.
pub struct SlotPool<T> {
    slots: Box<[T]>,
    free: ArrayQueue<u32>,
}

impl<T> SlotPool<T> {
    /// Create a pool of `capacity` slots, constructing each with `init`.
    ///
    /// All slots start free.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or exceeds `u32::MAX`.
    pub fn new(capacity: usize, mut init: impl FnMut(u32) -> T) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");
        assert!(capacity <= u32::MAX as usize, "pool capacity exceeds u32 index space");

        let slots: Box<[T]> = (0..capacity as u32).map(&mut init).collect();
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            // Cannot fail: the queue was sized for every index.
            let _ = free.push(index);
        }
        Self { slots, free }
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of currently free slots.
    #[inline]
    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }

    /// Take a free slot index, or `None` if the pool is exhausted.
    ///
    /// Never blocks; callers retry or back off on `None`.
    #[inline]
    pub fn acquire(&self) -> Option<u32> {
        self.free.pop()
    }

    /// Return a slot to the pool.
    ///
    /// Must be called exactly once per successful `acquire` of `index`.
    #[inline]
    pub fn release(&self, index: u32) {
        debug_assert!((index as usize) < self.slots.len(), "index out of range");
        // Cannot fail while the exactly-once contract holds: the queue has
        // room for every slot index.
        let _ = self.free.push(index);
    }

    /// Access the slot at `index`.
    #[inline]
    pub fn get(&self, index: u32) -> &T {
        &self.slots[index as usize]
    }

    /// Iterate over all slots, free and in-use alike.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }
}

impl<T> std::fmt::Debug for SlotPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("pooled_count", &self.pooled_count())
            .finish()
    }
}
