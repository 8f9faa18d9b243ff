//! A lock-free stack of [`RetiredList`]s abandoned by threads that exited
//! while entries were still pending reclamation.
//!
//! When a thread's thread-local state is dropped, any retired entries it
//! could not reclaim are pushed here rather than leaked. A later call to
//! `retire`/`scan` on any (other) thread first drains this stack into its own
//! retired list, so the abandoned entries eventually get freed.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use crate::retire::RetiredList;

struct Bag {
    list: RetiredList,
    next: *mut Bag,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AbandonedBags
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
pub(crate) struct AbandonedBags {
    head: AtomicPtr<Bag>,
}

unsafe impl Send for AbandonedBags {}
unsafe impl Sync for AbandonedBags {}

impl AbandonedBags {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Pushes `list` onto the abandoned stack. A no-op if `list` is empty.
    #[inline]
    pub(crate) fn abandon(&self, list: RetiredList) {
        if list.is_empty() {
            return;
        }

        let bag = Box::into_raw(Box::new(Bag { list, next: ptr::null_mut() }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*bag).next = head };
            match self.head.compare_exchange_weak(head, bag, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Atomically takes every currently abandoned bag and merges their
    /// entries into `into`.
    #[inline]
    pub(crate) fn adopt_all(&self, into: &mut RetiredList) {
        let mut curr = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        if curr.is_null() {
            return;
        }

        #[cfg(feature = "std")]
        let mut bags_adopted = 0u32;

        while !curr.is_null() {
            let mut bag = unsafe { Box::from_raw(curr) };
            into.append(&mut bag.list);
            curr = bag.next;
            #[cfg(feature = "std")]
            {
                bags_adopted += 1;
            }
        }

        #[cfg(feature = "std")]
        tracing::debug!(bags_adopted, "adopted abandoned retired bags from exited threads");
    }
}

impl Drop for AbandonedBags {
    fn drop(&mut self) {
        // only reachable once no other thread can observe `self`, so entries
        // can be finalized directly without a hazard-pointer check.
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            let mut bag = unsafe { Box::from_raw(curr) };
            for retired in bag.list.take() {
                unsafe { retired.finalize() };
            }
            curr = bag.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retire::{drop_boxed, Retired};
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, StdOrdering::Relaxed);
        }
    }

    #[test]
    fn abandon_and_adopt() {
        let count = Arc::new(AtomicUsize::new(0));
        let bags = AbandonedBags::new();

        let mut list = RetiredList::new();
        for _ in 0..4 {
            let boxed = Box::into_raw(Box::new(DropCount(Arc::clone(&count))));
            list.push(Retired::new(boxed as *mut (), drop_boxed::<DropCount>, ptr::null_mut()));
        }
        bags.abandon(list);

        let mut into = RetiredList::new();
        bags.adopt_all(&mut into);
        assert_eq!(into.len(), 4);

        for retired in into.take() {
            unsafe { retired.finalize() };
        }
        assert_eq!(count.load(StdOrdering::Relaxed), 4);
    }

    #[test]
    fn empty_list_is_not_abandoned() {
        let bags = AbandonedBags::new();
        bags.abandon(RetiredList::new());
        assert!(bags.head.load(StdOrdering::Relaxed).is_null());
    }
}
