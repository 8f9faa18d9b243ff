//! A Michael-Scott lock-free FIFO queue, hazard-guarded (§4.5).

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use crate::atomic::pause;
use crate::smr::{self, StablePtr};

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Self { value: None, next: AtomicPtr::new(ptr::null_mut()) }))
    }
}

/// A lock-free, multi-producer multi-consumer FIFO queue.
///
/// Always holds at least one dummy node so `head` and `tail` are never null;
/// `enqueue` appends past a possibly-stale `tail` and helps swing it forward,
/// `dequeue` stable-reads `head`, checks whether the queue is empty by
/// comparing against `tail`, and otherwise CASes `head` to the first real
/// node, retiring the old dummy.
pub struct Queue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
}

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Creates a new, empty queue.
    #[inline]
    pub fn new() -> Self {
        let dummy = Node::dummy();
        Self { head: AtomicPtr::new(dummy), tail: AtomicPtr::new(dummy) }
    }

    /// Appends `value` to the back of the queue.
    pub fn enqueue(&self, value: T) {
        let node = Box::into_raw(Box::new(Node { value: Some(value), next: AtomicPtr::new(ptr::null_mut()) }));

        loop {
            let tail = StablePtr::new(&self.tail);
            let next = unsafe { (*tail.as_ptr()).next.load(Ordering::Acquire) };

            if next.is_null() {
                match unsafe { &*tail.as_ptr() }.next.compare_exchange(
                    ptr::null_mut(),
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // best-effort: swing tail forward, ignore failure (another
                        // thread will do it for us before it needs to).
                        let _ = self.tail.compare_exchange(
                            tail.as_ptr(),
                            node,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                        return;
                    }
                    Err(_) => pause(),
                }
            } else {
                // tail has fallen behind; help swing it forward before retrying.
                let _ =
                    self.tail.compare_exchange(tail.as_ptr(), next, Ordering::AcqRel, Ordering::Relaxed);
                pause();
            }
        }
    }

    /// Removes and returns the value at the front of the queue, or `None` if
    /// it is empty.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head = StablePtr::new(&self.head);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head.as_ptr()).next.load(Ordering::Acquire) };

            if head.as_ptr() == tail {
                if next.is_null() {
                    return None;
                }
                // tail has fallen behind a completed enqueue; help it along.
                let _ =
                    self.tail.compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed);
                pause();
                continue;
            }

            if next.is_null() {
                // another thread is mid-enqueue past this head; retry.
                pause();
                continue;
            }

            if self
                .head
                .compare_exchange(head.as_ptr(), next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*next).value.take() };
                unsafe { retire_node(head.as_ptr()) };
                return value;
            }

            pause();
        }
    }

    /// Reports whether the queue currently appears to be empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = StablePtr::new(&self.head);
        let next = unsafe { (*head.as_ptr()).next.load(Ordering::Acquire) };
        next.is_null()
    }

    /// An approximate depth, computed by walking the queue with a bounded
    /// number of hazard-guarded retries; gives up and returns the
    /// best-effort count so far if the queue is mutated too many times
    /// during the walk.
    pub fn depth(&self) -> usize {
        const MAX_RETRIES: usize = 3;

        for _ in 0..MAX_RETRIES {
            let mut count = 0;
            let head = StablePtr::new(&self.head);
            let mut curr = unsafe { (*head.as_ptr()).next.load(Ordering::Acquire) };
            let mut consistent = true;

            while !curr.is_null() {
                count += 1;
                let node = StablePtr::unshared(curr);
                curr = unsafe { (*node.as_ptr()).next.load(Ordering::Acquire) };
                if count > 10_000_000 {
                    consistent = false;
                    break;
                }
            }

            if consistent {
                return count;
            }
        }

        0
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe fn retire_node<T>(node: *mut Node<T>) {
    unsafe fn finalizer<T>(object: *mut (), _context: *mut ()) {
        drop(Box::from_raw(object as *mut Node<T>));
    }
    smr::retire(node as *mut (), finalizer::<T>, ptr::null_mut());
}
