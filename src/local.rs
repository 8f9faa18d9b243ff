//! Thread-local state for the reclamation scheme: a small cache of hazard
//! pointers, the thread's own retired list, and the bookkeeping needed to
//! decide when to run a scan.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::config::Config;
use crate::global::{self, GLOBAL};
use crate::hazard::{Hazard, Protected};
use crate::retire::{Retired, RetiredList};

/// Number of hazard pointers kept in a thread's local cache before falling
/// back to the global list directly.
const HAZARD_CACHE: usize = 8;

thread_local! {
    static LOCAL: Local = Local::new(Config::default());
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Local {
    inner: UnsafeCell<LocalInner>,
}

struct LocalInner {
    config: Config,
    hazard_cache: ArrayVec<&'static Hazard, HAZARD_CACHE>,
    retired: RetiredList,
    scratch: Vec<Protected>,
    #[cfg(feature = "count-release")]
    release_count: u32,
}

impl Local {
    #[inline]
    fn new(config: Config) -> Self {
        Self {
            inner: UnsafeCell::new(LocalInner {
                config,
                hazard_cache: ArrayVec::new(),
                retired: RetiredList::with_capacity(config.init_cache()),
                scratch: Vec::new(),
                #[cfg(feature = "count-release")]
                release_count: 0,
            }),
        }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut LocalInner {
        &mut *self.inner.get()
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        let inner = unsafe { self.inner() };
        for hazard in inner.hazard_cache.drain(..) {
            hazard.set_free(Ordering::Release);
        }

        if !inner.retired.is_empty() {
            GLOBAL.abandon(core::mem::take(&mut inner.retired));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// public, per-thread entry points (used by smr.rs)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Acquires a hazard pointer, preferring the thread-local cache.
#[inline]
pub(crate) fn acquire_hazard() -> &'static Hazard {
    LOCAL.with(|local| {
        let inner = unsafe { local.inner() };
        inner.hazard_cache.pop().unwrap_or_else(|| GLOBAL.get_hazard())
    })
}

/// Returns a hazard pointer to the thread-local cache (or frees it globally
/// if the cache is full).
///
/// Under `count-release`, every release also ticks the counter that drives
/// the scan decision (see [`should_scan`]) instead of the retired-list
/// length: a thread that reads far more than it writes retires almost
/// nothing, so the list-length trigger would never fire for it even while it
/// is the one churning through the most hazard pointers.
#[inline]
pub(crate) fn release_hazard(hazard: &'static Hazard) {
    LOCAL.with(|local| {
        let inner = unsafe { local.inner() };
        // claim the slot for this thread's own cache *before* it becomes
        // visible as free: marking it free first would let another thread's
        // `GLOBAL.get_hazard()` claim it via CAS in the window before the
        // cache push below runs, and then overwrite whatever this thread
        // publishes into it next time it's popped back out.
        match inner.hazard_cache.try_push(hazard) {
            Ok(()) => hazard.set_thread_reserved(Ordering::Release),
            Err(_) => hazard.set_free(Ordering::Release),
        }
        record_release(inner);
        #[cfg(feature = "count-release")]
        if should_scan(inner) {
            GLOBAL.adopt_abandoned(&mut inner.retired);
            scan_local(inner);
        }
    });
}

/// Schedules `retired` for reclamation, adopting any bags abandoned by exited
/// threads and triggering a scan once the configured threshold is reached.
#[inline]
pub(crate) fn retire(retired: Retired) {
    LOCAL.with(|local| {
        let inner = unsafe { local.inner() };
        GLOBAL.adopt_abandoned(&mut inner.retired);
        inner.retired.push(retired);

        if should_scan(inner) {
            scan_local(inner);
        }
    });
}

cfg_if::cfg_if! {
    if #[cfg(feature = "count-release")] {
        #[inline]
        fn record_release(inner: &mut LocalInner) {
            inner.release_count = inner.release_count.saturating_add(1);
        }

        #[inline]
        fn should_scan(inner: &mut LocalInner) -> bool {
            if inner.release_count >= scan_threshold(inner.config) {
                inner.release_count = 0;
                true
            } else {
                false
            }
        }
    } else {
        #[inline]
        fn record_release(_inner: &mut LocalInner) {}

        #[inline]
        fn should_scan(inner: &mut LocalInner) -> bool {
            inner.retired.len() as u32 >= scan_threshold(inner.config)
        }
    }
}

/// Forces an immediate scan of the calling thread's retired list, bypassing
/// the threshold check. Mirrors the reference implementation's manual
/// `smr_clean()` admin call.
#[inline]
pub(crate) fn scan_now() {
    LOCAL.with(|local| {
        let inner = unsafe { local.inner() };
        GLOBAL.adopt_abandoned(&mut inner.retired);
        scan_local(inner);
    });
}

/// `R = factor * total_hazard_slots`, forced to `0` in debug builds so
/// reclamation happens eagerly during testing. `factor` defaults to `2`;
/// `maximum-reclamation-freq` lowers it to `1` (scan almost every retirement)
/// and `reduced-reclamation-freq` raises it to `8` (batch more retirements
/// per scan, at the cost of peak memory held before reclamation).
#[inline]
fn scan_threshold(config: Config) -> u32 {
    if config.scan_threshold() == 0 {
        0
    } else {
        (reclamation_factor() * GLOBAL.total_hazard_slots().max(1)) as u32
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "maximum-reclamation-freq")] {
        #[inline]
        fn reclamation_factor() -> usize { 1 }
    } else if #[cfg(feature = "reduced-reclamation-freq")] {
        #[inline]
        fn reclamation_factor() -> usize { 8 }
    } else {
        #[inline]
        fn reclamation_factor() -> usize { 2 }
    }
}

/// The scan algorithm from the SMR engine contract: snapshot every published
/// hazard, then partition the thread's retired list into "still protected"
/// (re-retired) and "safe to free" (finalized now).
fn scan_local(inner: &mut LocalInner) {
    GLOBAL.collect_protected_hazards(&mut inner.scratch);

    let entries = inner.retired.take();
    let mut freed = 0u32;
    let mut kept = 0u32;
    for retired in entries {
        let protected = inner
            .scratch
            .binary_search_by_key(&retired.address(), |p| p.address())
            .is_ok();

        if protected {
            inner.retired.push(retired);
            kept += 1;
        } else {
            unsafe { retired.finalize() };
            freed += 1;
        }
    }

    #[cfg(feature = "std")]
    tracing::trace!(freed, kept, "hazard-pointer scan");
}

/// Non-concurrent, process-wide teardown: frees every retired object this
/// thread and every abandoned bag currently hold, ignoring hazard state
/// entirely. Safe only when the caller can guarantee no other thread is
/// concurrently using the library.
pub(crate) unsafe fn unsafe_full_clean() {
    LOCAL.with(|local| {
        let inner = local.inner();
        let mut merged = core::mem::take(&mut inner.retired);
        GLOBAL.adopt_abandoned(&mut merged);
        for retired in merged.take() {
            retired.finalize();
        }
    });
}

/// Masks tag bits off `ptr` before it is published to a hazard slot.
#[inline]
pub(crate) fn masked<T>(ptr: *mut T) -> NonNull<()> {
    global::mask(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retire::drop_boxed;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, StdOrdering::Relaxed);
        }
    }

    #[test]
    fn retire_and_force_scan_frees_unprotected() {
        let count = Arc::new(AtomicUsize::new(0));
        let boxed = Box::into_raw(Box::new(DropCount(Arc::clone(&count))));
        retire(Retired::new(boxed as *mut (), drop_boxed::<DropCount>, core::ptr::null_mut()));
        scan_now();
        assert_eq!(count.load(StdOrdering::Relaxed), 1);
    }

    #[test]
    fn acquire_release_hazard_roundtrip() {
        let hazard = acquire_hazard();
        assert!(hazard.protected(Ordering::Relaxed).is_none());
        release_hazard(hazard);
    }
}
