//! Multi-threaded integration scenarios exercising the whole crate together,
//! rather than a single data structure in isolation (see each module's own
//! `#[cfg(test)]` suite for that). Exactness of construction/destruction
//! under concurrent reclamation is checked directly, by counting live
//! instances of a value type whose `Clone` and `Drop` impls both touch a
//! shared counter, rather than by an external memory sanitizer.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use lockfree_collections::{NonBlockingMap, StripedCounter};

/// A value type whose every live instance (including ones produced by
/// `Clone`, e.g. by [`NonBlockingMap::get`]) is counted, so leaks and
/// double-frees during resize/reclamation both show up as a nonzero count
/// once every instance should have gone out of scope.
struct Counted {
    alive: Arc<AtomicIsize>,
}

impl Counted {
    fn new(alive: Arc<AtomicIsize>) -> Self {
        alive.fetch_add(1, Ordering::Relaxed);
        Self { alive }
    }
}

impl Clone for Counted {
    fn clone(&self) -> Self {
        self.alive.fetch_add(1, Ordering::Relaxed);
        Self { alive: Arc::clone(&self.alive) }
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::Relaxed);
    }
}

/// S1: single-thread put/get/replace/remove roundtrip. The scenario's
/// `replace("foo", "bar", "baz")` names the conditional, boolean-returning
/// replace (swap only if the current value equals the second argument),
/// which is [`NonBlockingMap::replace_if`] here; the unconditional,
/// `Option`-returning replace is a separate method ([`NonBlockingMap::replace`]),
/// covered by its own unit tests in `map`.
#[test]
fn s1_single_thread_roundtrip() {
    let map: NonBlockingMap<&'static str, &'static str> = NonBlockingMap::new();

    assert_eq!(map.put("foo", "bar"), None);
    assert_eq!(map.get(&"foo"), Some("bar"));
    assert!(map.replace_if("foo", &"bar", "baz"));
    assert_eq!(map.get(&"foo"), Some("baz"));
    assert_eq!(map.remove(&"foo"), Some("baz"));
    assert_eq!(map.get(&"foo"), None);
}

/// S2: `put_if_absent` is idempotent — the first call inserts, the second
/// leaves the map unchanged and reports the existing value.
#[test]
fn s2_put_if_absent_idempotence() {
    let map: NonBlockingMap<&'static str, &'static str> = NonBlockingMap::new();

    assert_eq!(map.put_if_absent("foo", "bar"), None);
    assert_eq!(map.put_if_absent("foo", "quux"), Some("bar"));
    assert_eq!(map.get(&"foo"), Some("bar"));
}

/// S3: inserting 64 distinct keys is reflected exactly in `size()` and every
/// key's `get`.
#[test]
fn s3_sixty_four_keys_size_and_get() {
    let map: NonBlockingMap<String, usize> = NonBlockingMap::new();

    for i in 0..64usize {
        let key = format!("k-{:02x}", i);
        assert_eq!(map.put(key, i), None);
    }

    assert_eq!(map.size(), 64);
    for i in 0..64usize {
        let key = format!("k-{:02x}", i);
        assert_eq!(map.get(&key), Some(i));
    }
}

/// S4: interleaved insert-then-delete of 64 keys leaves the map empty.
#[test]
fn s4_interleaved_insert_then_delete_empties_map() {
    let map: NonBlockingMap<usize, usize> = NonBlockingMap::new();

    for i in 0..64usize {
        map.put(i, i);
        if i % 2 == 0 {
            map.remove(&i);
        }
    }
    for i in (1..64usize).step_by(2) {
        map.remove(&i);
    }

    assert_eq!(map.size(), 0);
    for i in 0..64usize {
        assert_eq!(map.get(&i), None);
    }
}

/// S5: two threads each perform many increments on a shared striped counter;
/// the exact sum accounts for every one of them. The per-thread iteration
/// count here is reduced relative to a throughput benchmark's scale — the
/// property under test (exact conservation, no lost updates) does not
/// depend on the count.
#[test]
fn s5_concurrent_counter_conserves_exact_sum() {
    let counter = Arc::new(StripedCounter::new());
    const PER_THREAD: i64 = 50_000;

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    counter.increment();
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(counter.get(), 2 * PER_THREAD);
}

/// S6: eight threads mix put_if_absent/remove/get over a shared key universe
/// for a bounded number of operations. The map must stay internally
/// consistent: `size()` matches the net of successful inserts and removes,
/// and — checked via `Counted` — every value constructed over the run is
/// eventually dropped exactly once, with none left live once every key has
/// been removed.
#[test]
fn s6_concurrent_mixed_workload_stays_consistent() {
    const UNIVERSE: usize = 10_000;
    const THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 5_000;

    let map: Arc<NonBlockingMap<usize, Counted>> = Arc::new(NonBlockingMap::new());
    let alive = Arc::new(AtomicIsize::new(0));
    let puts_succeeded = Arc::new(AtomicUsize::new(0));
    let removes_succeeded = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            let alive = Arc::clone(&alive);
            let puts_succeeded = Arc::clone(&puts_succeeded);
            let removes_succeeded = Arc::clone(&removes_succeeded);

            thread::spawn(move || {
                // a small xorshift so each thread's key sequence differs
                // without pulling in a `rand::Rng` per op.
                let mut state = 0x9e3779b9u64 ^ (t as u64).wrapping_mul(0x2545f4914f6cdd1d);
                let mut next = move || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state as usize) % UNIVERSE
                };

                for i in 0..OPS_PER_THREAD {
                    let key = next();
                    match i % 4 {
                        0 => {
                            if map.put_if_absent(key, Counted::new(Arc::clone(&alive))).is_none() {
                                puts_succeeded.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        1 => {
                            if map.remove(&key).is_some() {
                                removes_succeeded.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            let _ = map.get(&key);
                        }
                    }
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }

    let expected_size = puts_succeeded.load(Ordering::Relaxed) as isize
        - removes_succeeded.load(Ordering::Relaxed) as isize;
    assert_eq!(map.size() as isize, expected_size);

    for key in 0..UNIVERSE {
        map.remove(&key);
    }
    assert_eq!(map.size(), 0);

    drop(map);
    lockfree_collections::scan_now();
    unsafe { lockfree_collections::unsafe_full_clean() };
    assert_eq!(
        alive.load(Ordering::Relaxed),
        0,
        "every constructed value must eventually be dropped exactly once"
    );
}
