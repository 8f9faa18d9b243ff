//! A striped, auto-resizing concurrent counter (§4.4).
//!
//! A single atomic integer under contention becomes a CAS hotspot; this
//! counter instead spreads updates across a power-of-two array of cells
//! (a "CAT"), growing the array under sustained contention, and computes an
//! exact sum by walking the chain of CATs left behind by previous growths.

mod cat;

use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use crate::atomic::pause;
use crate::smr::{self, StablePtr};

use self::cat::{free_chain, Cat, MAX_CELLS, MAX_SPIN};

////////////////////////////////////////////////////////////////////////////////////////////////////
// StripedCounter
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free counter that automatically stripes its storage across more
/// cells as contention is observed.
pub struct StripedCounter {
    head: AtomicPtr<Cat>,
}

impl Default for StripedCounter {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl StripedCounter {
    /// Creates a new counter initialized to zero.
    #[inline]
    pub fn new() -> Self {
        Self { head: AtomicPtr::new(Box::into_raw(Cat::seeded(0))) }
    }

    /// Adds `x` to the counter. Equivalent to `add_if_mask(x, 0)`.
    ///
    /// `i64::MIN` is reserved internally as the "stale cache" sentinel for a
    /// CAT's memoized sum (see [`cat::SUM_CACHE_INVALID`]); a sequence of
    /// adds that happens to drive the counter's total to exactly that value
    /// is not checked for here; only [`Self::set`], which receives the
    /// resulting value directly rather than as a distributed delta, is.
    #[inline]
    pub fn add(&self, x: i64) {
        self.add_if_mask(x, 0);
    }

    /// Adds `1` to the counter.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtracts `1` from the counter.
    #[inline]
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Returns the exact sum of every cell in the chain.
    #[inline]
    pub fn get(&self) -> i64 {
        let head = StablePtr::new(&self.head);
        unsafe { &*head.as_ptr() }.sum(0)
    }

    /// Returns an approximate sum: exact for small tables, otherwise cached
    /// across a coarse time window.
    #[inline]
    pub fn estimate_get(&self) -> i64 {
        let head = StablePtr::new(&self.head);
        unsafe { &*head.as_ptr() }.estimate_sum(0, coarse_millis())
    }

    /// Replaces the entire counter with a fresh single-cell CAT seeded with
    /// `x`, retiring the whole previous chain through the SMR engine (other
    /// threads may hold hazards into any node of that chain, not only its
    /// head).
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `x == i64::MIN`: that value is reserved as
    /// the stale-sum-cache sentinel and cannot be a genuine counter value. In
    /// release builds this is not checked (the counter would simply behave
    /// as if its cache were always stale for this value, at a small cost to
    /// `get`'s memoization, not to correctness).
    #[inline]
    pub fn set(&self, x: i64) {
        debug_assert_ne!(
            x,
            cat::SUM_CACHE_INVALID,
            "i64::MIN is reserved as the counter's internal stale-cache sentinel"
        );
        let new_head = Box::into_raw(Cat::seeded(x));
        let old_head = self.head.swap(new_head, Ordering::AcqRel);
        unsafe { retire_chain(old_head) };
    }

    /// CAS-based add that only applies if `cell_value & mask == 0`; the
    /// primitive underlying both plain `add` (mask `0`) and reader/writer
    /// lock-style constructs. Returns the value observed immediately before
    /// the (possibly unsuccessful) attempt.
    pub fn add_if_mask(&self, x: i64, mask: i64) -> i64 {
        let idx = thread_cell_index();

        loop {
            let head = StablePtr::new(&self.head);
            let cat = unsafe { &*head.as_ptr() };

            let mut spins = 0;
            loop {
                let (observed, ok) = cat.try_add_if_mask(idx, x, mask);
                if ok || mask != 0 {
                    return observed;
                }
                spins += 1;
                if spins >= MAX_SPIN {
                    break;
                }
                pause();
            }

            if cat.len() >= MAX_CELLS {
                // at the hard cap; keep spinning on the same cells rather
                // than growing further.
                continue;
            }

            let my_ticket = cat.bump_resizers();
            if my_ticket > 2 {
                // enough other threads are already racing to resize; just
                // retry against the (possibly still-current) head.
                pause();
                continue;
            }

            let new_len = cat.len() * 2;
            let new_cat = Box::into_raw(Box::new(Cat::with_len(new_len, head.as_ptr())));

            match self.head.compare_exchange(
                head.as_ptr(),
                new_cat,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // the predecessor (`head.as_ptr()`) is now reachable only
                // through `new_cat.next`; it stays alive until the whole
                // chain is eventually retired.
                Ok(_) => continue,
                Err(_) => {
                    // lost the race: free only the node we just allocated.
                    // Its `next` is the still-live predecessor, shared with
                    // whichever chain actually won, so it must not be freed
                    // here.
                    drop(unsafe { Box::from_raw(new_cat) });
                    continue;
                }
            }
        }
    }
}

impl Drop for StripedCounter {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        unsafe { free_chain(head) };
    }
}

/// Retires an entire CAT chain through the SMR engine: the finalizer walks
/// and frees every node in the chain, mirroring the reference
/// implementation's recursive `~CAT()` destructor.
unsafe fn retire_chain(head: *mut Cat) {
    unsafe fn finalizer(object: *mut (), _context: *mut ()) {
        free_chain(object as *mut Cat);
    }
    smr::retire(head as *mut (), finalizer, core::ptr::null_mut());
}

/// Spreads the current thread's id across the cell-array index space with a
/// Wang/Jenkins-style bit mixer.
fn thread_cell_index() -> usize {
    let mut h = thread_id_hash();
    h ^= (h >> 20) ^ (h >> 12);
    h ^= (h >> 7) ^ (h >> 4);
    (h << 2) as usize
}

fn thread_id_hash() -> u64 {
    use core::hash::{Hash, Hasher};
    #[cfg(feature = "std")]
    {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }
    #[cfg(not(feature = "std"))]
    {
        // no_std has no thread identity; every caller collapses onto cell 0,
        // degrading to a single contended cell (still correct, just slower).
        0
    }
}

#[cfg(feature = "std")]
fn coarse_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(not(feature = "std"))]
fn coarse_millis() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_add_and_get() {
        let counter = StripedCounter::new();
        counter.increment();
        counter.increment();
        counter.add(3);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn set_replaces_the_chain() {
        let counter = StripedCounter::new();
        counter.add(100);
        counter.set(7);
        assert_eq!(counter.get(), 7);
    }

    #[test]
    fn concurrent_increments_conserve_the_sum() {
        let counter = Arc::new(StripedCounter::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        counter.increment();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(counter.get(), 80_000);
    }
}
