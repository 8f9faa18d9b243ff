//! The public-facing facade of the hazard-pointer SMR engine: retirement,
//! admin entry points, and the stable-pointer read helper (§4.2, §4.3).

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hazard::Hazard;
use crate::local;
use crate::retire::{FinalizerFn, Retired};

/// Schedules `object` for destruction once no hazard pointer references it.
///
/// `finalizer` is invoked with `context` just before the object's storage
/// would otherwise be freed, and stands in for the C++ source's virtual
/// "destructible" base: a plain function pointer plus an opaque context is
/// all the capability retirement needs.
///
/// # Safety
///
/// `object` must be unreachable from every live data structure at the moment
/// this is called, and must remain a valid pointer for `finalizer` to act on
/// until finalization actually happens.
#[inline]
pub(crate) unsafe fn retire(object: *mut (), finalizer: FinalizerFn, context: *mut ()) {
    local::retire(Retired::new(object, finalizer, context));
}

/// Manually triggers an immediate scan on the calling thread's retired list,
/// bypassing the usual threshold check. Mirrors the reference
/// implementation's `smr_clean()`.
#[inline]
pub fn scan_now() {
    local::scan_now();
}

/// Frees every retired object currently known to the engine — this thread's
/// own retired list and every bag abandoned by threads that have since
/// exited — unconditionally, ignoring hazard-pointer state entirely.
///
/// # Safety
///
/// The caller must guarantee that no other thread is concurrently using any
/// data structure backed by this engine. Intended for process shutdown and
/// for resetting state between independent test cases.
#[inline]
pub unsafe fn unsafe_full_clean() {
    local::unsafe_full_clean();
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// StablePtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hazard-protected, "stable" read of an `AtomicPtr<T>` location.
///
/// Construction repeatedly re-reads the source location, publishing each
/// candidate to a hazard slot, until the published pointer and the location's
/// current value agree — at which point no concurrent `retire` of that
/// pointer can complete without first observing the published hazard.
///
/// Only the high bits of the pointer are ever published: low-bit tag bits
/// used by the hash map and sorted list (prime/tombstone markers) would
/// otherwise make the hazard slot's value disagree with another thread's
/// untagged view of the same address.
pub(crate) struct StablePtr<T> {
    ptr: *mut T,
    hazard: &'static Hazard,
}

impl<T> StablePtr<T> {
    /// Performs the acquire-hazard-and-re-read loop against `location`.
    #[inline]
    pub(crate) fn new(location: &AtomicPtr<T>) -> Self {
        let hazard = local::acquire_hazard();
        loop {
            let candidate = location.load(Ordering::Acquire);
            Self::publish(hazard, candidate);
            if candidate == location.load(Ordering::Acquire) {
                return Self { ptr: candidate, hazard };
            }
        }
    }

    /// Wraps a pointer already known not to be concurrently reclaimed (e.g.
    /// one this thread itself just allocated and has not yet published).
    #[inline]
    pub(crate) fn unshared(ptr: *mut T) -> Self {
        let hazard = local::acquire_hazard();
        Self::publish(hazard, ptr);
        Self { ptr, hazard }
    }

    #[inline]
    fn publish(hazard: &'static Hazard, ptr: *mut T) {
        if let Some(masked) = NonNull::new(ptr) {
            hazard.set_protected(local::masked(masked.as_ptr()), Ordering::SeqCst);
        } else {
            hazard.set_thread_reserved(Ordering::SeqCst);
        }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<T> Drop for StablePtr<T> {
    #[inline]
    fn drop(&mut self) {
        local::release_hazard(self.hazard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicPtr;

    #[test]
    fn stable_ptr_reads_current_value() {
        let mut x = 42i32;
        let loc = AtomicPtr::new(&mut x as *mut i32);
        let stable = StablePtr::new(&loc);
        assert_eq!(stable.as_ptr(), &mut x as *mut i32);
        assert!(!stable.is_null());
    }

    #[test]
    fn stable_ptr_null_location() {
        let loc: AtomicPtr<i32> = AtomicPtr::new(core::ptr::null_mut());
        let stable = StablePtr::new(&loc);
        assert!(stable.is_null());
    }
}
