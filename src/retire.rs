//! Retired objects awaiting reclamation once no hazard pointer references
//! them any longer.

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;
#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// A finalizer invoked on a retired object once no hazard pointer
/// references it any longer, responsible for destroying it.
///
/// Whether the underlying storage ends up freed is entirely up to what the
/// finalizer itself does, rather than a value it returns: this supports
/// externally-allocated slabs (e.g. the hash map's "shallow" table
/// finalizer, which destroys some but not all contained key/value objects
/// and always frees the table's own storage regardless).
pub(crate) type FinalizerFn = unsafe fn(object: *mut (), context: *mut ());

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single retired entry: an object, plus the means to destroy it.
pub(crate) struct Retired {
    object: *mut (),
    finalizer: FinalizerFn,
    context: *mut (),
}

unsafe impl Send for Retired {}

impl Retired {
    /// Wraps `object` for later destruction through `finalizer`, which will
    /// be invoked with `context` as its second argument.
    #[inline]
    pub(crate) fn new(object: *mut (), finalizer: FinalizerFn, context: *mut ()) -> Self {
        Self { object, finalizer, context }
    }

    /// The raw address of the retired object, used to compare against the
    /// hazard-pointer snapshot during a scan.
    #[inline]
    pub(crate) fn address(&self) -> usize {
        self.object as usize
    }

    /// Invokes the finalizer, consuming the retired entry.
    #[inline]
    pub(crate) unsafe fn finalize(self) {
        (self.finalizer)(self.object, self.context);
    }
}

/// Drops a boxed `T` behind an opaque pointer pair. The canonical finalizer
/// for objects that were simply `Box::into_raw`'d and need nothing but a
/// drop.
#[inline]
pub(crate) unsafe fn drop_boxed<T>(object: *mut (), _context: *mut ()) {
    drop(Box::from_raw(object as *mut T));
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The default capacity a fresh, empty retired list starts with.
pub(crate) const DEFAULT_CAPACITY: usize = 256;

/// A thread-local, unsynchronized, bounded-growth list of retired entries.
///
/// Backed directly by `Vec`, whose own capacity doubling already implements
/// the "doubled on overflow" growth policy called for in the data model.
#[derive(Default)]
pub(crate) struct RetiredList {
    entries: Vec<Retired>,
}

impl RetiredList {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[inline]
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self { entries: Vec::with_capacity(cap) }
    }

    #[inline]
    pub(crate) fn push(&mut self, retired: Retired) {
        self.entries.push(retired);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub(crate) fn append(&mut self, other: &mut RetiredList) {
        self.entries.append(&mut other.entries);
    }

    /// Takes ownership of every currently retired entry, leaving `self` empty.
    #[inline]
    pub(crate) fn take(&mut self) -> Vec<Retired> {
        core::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn retired_list_grows_and_finalizes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut list = RetiredList::new();

        for _ in 0..10 {
            let boxed = Box::into_raw(Box::new(DropCount(Arc::clone(&count))));
            list.push(Retired::new(boxed as *mut (), drop_boxed::<DropCount>, core::ptr::null_mut()));
        }

        assert_eq!(list.len(), 10);
        for retired in list.take() {
            unsafe { retired.finalize() };
        }
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }
}
