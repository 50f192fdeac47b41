//! Admission slot pool.
//!
//! A counted resource bounding how many tasks may be in the Downloading
//! state at once. Acquisition is always non-blocking (waiters park in the
//! manager's FIFO queue instead), release never underflows, and a live
//! resize preserves current holders: shrinking below the in-use count
//! grandfathers the overflow, which drains as holders release.

use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct SlotState {
    capacity: usize,
    in_use: usize,
}

#[derive(Debug)]
pub struct SlotPool {
    state: Mutex<SlotState>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                capacity: capacity.max(1),
                in_use: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Try to take a slot without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.in_use < state.capacity {
            state.in_use += 1;
            true
        } else {
            false
        }
    }

    /// Return one slot. A release with nothing held is a logged no-op so a
    /// double release can never poison the pool.
    pub fn release(&self) -> bool {
        let mut state = self.lock();
        if state.in_use == 0 {
            debug!("slot release with no slot held, ignoring");
            return false;
        }
        state.in_use -= 1;
        true
    }

    /// Change the capacity, keeping every held slot. With `in_use` above the
    /// new capacity no admission happens until holders drain below it.
    pub fn resize(&self, capacity: usize) {
        let mut state = self.lock();
        let capacity = capacity.max(1);
        if state.in_use > capacity {
            debug!(
                in_use = state.in_use,
                capacity, "pool shrunk below in-use count, grandfathering holders"
            );
        }
        state.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn available(&self) -> usize {
        let state = self.lock();
        state.capacity.saturating_sub(state.in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_up_to_capacity() {
        let pool = SlotPool::new(2);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn release_frees_a_slot() {
        let pool = SlotPool::new(1);
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        assert!(pool.release());
        assert!(pool.try_acquire());
    }

    #[test]
    fn double_release_is_a_noop() {
        let pool = SlotPool::new(1);
        assert!(pool.try_acquire());
        assert!(pool.release());
        assert!(!pool.release());
        assert_eq!(pool.in_use(), 0);
        // The pool is still bounded by its capacity afterwards.
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
    }

    #[test]
    fn growing_makes_slots_available_immediately() {
        let pool = SlotPool::new(1);
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        pool.resize(3);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
    }

    #[test]
    fn shrinking_grandfathers_current_holders() {
        let pool = SlotPool::new(3);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());

        pool.resize(1);
        assert_eq!(pool.in_use(), 3);
        assert!(!pool.try_acquire());

        // Two holders leave; still over the new capacity after the first.
        assert!(pool.release());
        assert!(!pool.try_acquire());
        assert!(pool.release());
        assert!(!pool.try_acquire());

        // Third release drops below capacity, admission resumes.
        assert!(pool.release());
        assert!(pool.try_acquire());
    }

    #[test]
    fn capacity_floor_is_one() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.capacity(), 1);
        pool.resize(0);
        assert_eq!(pool.capacity(), 1);
    }
}
