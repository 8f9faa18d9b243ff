//! The non-blocking hash map (§4.6): a lock-free, resizable open-addressed
//! map with cooperative incremental table copy, modeled on Cliff Click's
//! non-blocking hash map design.
//!
//! [`NonBlockingMap`] itself only owns the top-level generation pointer and
//! the reprobe-count counter; [`table`] carries the entire single-generation
//! algorithm (probing, resize, cooperative copy). Every public operation
//! here follows the same shape: stable-read the current top generation,
//! delegate to `table`, then give the generation a chance to promote if its
//! copy has since finished.

mod table;

use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use crate::counter::StripedCounter;
use crate::smr::{self, StablePtr};

use self::table::{Expected, PutOutcome, Table};

const DEFAULT_CAPACITY: usize = 8;

/// A lock-free, resizable, open-addressed hash map.
///
/// Keys are cloned into each table generation a copy migrates them to (see
/// [`table`] for why `K: Clone` is required): this trades a clone per
/// migrated entry for a much simpler ownership story than chasing borrowed
/// keys across generations that may outlive the caller's own reference.
pub struct NonBlockingMap<K, V> {
    top: AtomicPtr<Table<K, V>>,
    reprobes: AtomicPtr<StripedCounter>,
}

impl<K, V> Default for NonBlockingMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> NonBlockingMap<K, V> {
    /// Creates a new, empty map with a small default initial capacity.
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a new, empty map sized to hold at least `capacity` entries
    /// without an initial resize.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            top: AtomicPtr::new(Box::into_raw(Table::with_capacity(capacity))),
            reprobes: AtomicPtr::new(Box::into_raw(Box::new(StripedCounter::new()))),
        }
    }

    /// The number of entries currently in the map.
    ///
    /// Read directly off the live generation's size counter rather than
    /// computed by a walk, so it is exact at the instant it is read but may
    /// be stale the instant it returns under concurrent mutation.
    pub fn size(&self) -> usize {
        let top = StablePtr::new(&self.top);
        unsafe { &*top.as_ptr() }.size()
    }

    /// §4.6.5: returns the total reprobe count accumulated since the last
    /// call to this method (or since the map was created), then resets it.
    ///
    /// Implemented by CAS-swapping in a fresh counter and retiring the old
    /// one through the SMR engine, rather than reading-then-zeroing (which
    /// would race against concurrent operations still ticking the old
    /// counter's cells).
    pub fn reprobes(&self) -> i64 {
        let fresh = Box::into_raw(Box::new(StripedCounter::new()));
        let old = self.reprobes.swap(fresh, Ordering::AcqRel);
        let total = unsafe { &*old }.get();
        unsafe { retire_counter(old) };
        total
    }
}

impl<K, V> NonBlockingMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + 'static,
{
    /// Unconditionally associates `value` with `key`, returning the
    /// previously associated value, if any.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.apply(&key, Some(value), Expected::Any)
    }

    /// Associates `value` with `key` only if `key` is not already present.
    /// Returns the existing value if `key` was already present (in which
    /// case `value` is dropped without being inserted), or `None` if the
    /// insertion happened.
    #[inline]
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        self.apply(&key, Some(value), Expected::Absent)
    }

    /// Replaces the value associated with `key`, only if `key` is currently
    /// present. Returns the replaced value, or `None` (without inserting)
    /// if `key` was absent.
    pub fn replace(&self, key: K, value: V) -> Option<V> {
        self.apply(&key, Some(value), Expected::Present)
    }

    /// Replaces the value associated with `key` only if it currently equals
    /// `old`. Returns whether the replacement happened.
    pub fn replace_if(&self, key: K, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        self.apply_conditional(&key, Some(new), old)
    }

    /// Removes `key`, returning its associated value if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.apply(key, None, Expected::Any)
    }

    /// Removes `key` only if it is currently associated with `value`.
    /// Returns whether the removal happened.
    pub fn remove_if(&self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.apply_conditional(key, None, value)
    }

    /// Looks up `key`, returning a clone of its associated value if present.
    pub fn get(&self, key: &K) -> Option<V> {
        let fullhash = spread_hash(key);
        let top = StablePtr::new(&self.top);
        let table = unsafe { &*top.as_ptr() };
        let result = table::get(table, key, fullhash);
        unsafe { table::try_promote(&self.top, top.as_ptr()) };
        result
    }

    /// Reports whether `key` is currently present.
    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Replaces the entire map with a fresh, empty table, retiring the
    /// previous generation (and any in-flight resize it was still
    /// cooperatively copying into) through the SMR engine.
    pub fn clear(&self) {
        let fresh = Box::into_raw(Table::with_capacity(DEFAULT_CAPACITY));
        let old = self.top.swap(fresh, Ordering::AcqRel);
        unsafe { table::retire_generation(old) };
    }

    fn apply(&self, key: &K, value: Option<V>, expected: Expected<'_, V>) -> Option<V> {
        let fullhash = spread_hash(key);
        loop {
            let top = StablePtr::new(&self.top);
            let table = unsafe { &*top.as_ptr() };
            let reprobes = StablePtr::new(&self.reprobes);
            let counter = unsafe { &*reprobes.as_ptr() };
            let tick = || counter.increment();

            let outcome =
                table::put_if_match(table, key, fullhash, value.clone(), expected_clone(&expected), &tick);

            match outcome {
                PutOutcome::Applied(prev) | PutOutcome::Mismatch(prev) => {
                    unsafe { table::try_promote(&self.top, top.as_ptr()) };
                    return prev;
                }
                PutOutcome::Retry => continue,
            }
        }
    }

    fn apply_conditional(&self, key: &K, value: Option<V>, expected_value: &V) -> bool
    where
        V: PartialEq,
    {
        let fullhash = spread_hash(key);
        loop {
            let top = StablePtr::new(&self.top);
            let table = unsafe { &*top.as_ptr() };
            let reprobes = StablePtr::new(&self.reprobes);
            let counter = unsafe { &*reprobes.as_ptr() };
            let tick = || counter.increment();

            let matches = |observed: &V| observed == expected_value;
            let outcome =
                table::put_if_match(table, key, fullhash, value.clone(), Expected::Matches(&matches), &tick);

            match outcome {
                PutOutcome::Applied(_) => {
                    unsafe { table::try_promote(&self.top, top.as_ptr()) };
                    return true;
                }
                PutOutcome::Mismatch(_) => {
                    unsafe { table::try_promote(&self.top, top.as_ptr()) };
                    return false;
                }
                PutOutcome::Retry => continue,
            }
        }
    }
}

/// Frees the old counter's own CAT chain, through the SMR engine, after
/// [`NonBlockingMap::reprobes`] has already read its total and swapped it
/// out: a concurrent operation may still hold a `StablePtr` to this exact
/// counter and be mid-`increment`.
unsafe fn retire_counter(counter: *mut StripedCounter) {
    unsafe fn finalizer(object: *mut (), _context: *mut ()) {
        drop(Box::from_raw(object as *mut StripedCounter));
    }
    smr::retire(counter as *mut (), finalizer, core::ptr::null_mut());
}

/// `Expected` doesn't implement `Clone` (the `Matches` variant borrows a
/// `dyn Fn`); this is only ever called with a variant that contains no
/// borrow, since the borrowing variant is routed through `apply_conditional`
/// instead.
fn expected_clone<'a, V>(expected: &Expected<'a, V>) -> Expected<'a, V> {
    match expected {
        Expected::Any => Expected::Any,
        Expected::Absent => Expected::Absent,
        Expected::Present => Expected::Present,
        Expected::Matches(pred) => Expected::Matches(*pred),
    }
}

impl<K, V> Drop for NonBlockingMap<K, V> {
    fn drop(&mut self) {
        let top = *self.top.get_mut();
        drop(unsafe { Box::from_raw(top) });
        let reprobes = *self.reprobes.get_mut();
        drop(unsafe { Box::from_raw(reprobes) });
    }
}

/// Spreads a key's hash across the full 64-bit space with a Murmur3-style
/// finalizer mix, and guards against the all-zero sentinel `table` uses to
/// mean "no stored hash yet" for a slot.
fn spread_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = FnvHasher::new();
    key.hash(&mut hasher);
    let mut h = hasher.finish();
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    if h == 0 {
        0x9e3779b97f4a7c15
    } else {
        h
    }
}

/// A small, dependency-free `Hasher` to feed into [`spread_hash`]'s own
/// finalizer mix; any reasonable hash of the key's bytes works here, since
/// the mix above is what actually spreads the bits.
struct FnvHasher(u64);

impl FnvHasher {
    fn new() -> Self {
        Self(0xcbf29ce484222325)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_get_replace_remove_roundtrip() {
        let map: NonBlockingMap<String, i32> = NonBlockingMap::new();
        assert_eq!(map.put("a".to_string(), 1), None);
        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert_eq!(map.replace("a".to_string(), 2), Some(1));
        assert_eq!(map.get(&"a".to_string()), Some(2));
        assert_eq!(map.remove(&"a".to_string()), Some(2));
        assert_eq!(map.get(&"a".to_string()), None);
    }

    #[test]
    fn put_if_absent_is_idempotent() {
        let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
        assert_eq!(map.put_if_absent(1, 100), None);
        assert_eq!(map.put_if_absent(1, 200), Some(100));
        assert_eq!(map.get(&1), Some(100));
    }

    #[test]
    fn replace_requires_presence() {
        let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
        assert_eq!(map.replace(1, 100), None);
        assert!(!map.contains(&1));
        map.put(1, 100);
        assert_eq!(map.replace(1, 200), Some(100));
    }

    #[test]
    fn conditional_replace_and_remove() {
        let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
        map.put(1, 100);
        assert!(!map.replace_if(1, &999, 200));
        assert!(map.replace_if(1, &100, 200));
        assert_eq!(map.get(&1), Some(200));

        assert!(!map.remove_if(&1, &999));
        assert!(map.remove_if(&1, &200));
        assert!(!map.contains(&1));
    }

    #[test]
    fn insert_many_keys_tracks_size() {
        let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
        for i in 0..64 {
            assert_eq!(map.put(i, i * 2), None);
        }
        assert_eq!(map.size(), 64);
        for i in 0..64 {
            assert_eq!(map.get(&i), Some(i * 2));
        }
    }

    #[test]
    fn insert_then_delete_all_empties_the_map() {
        let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
        for i in 0..64 {
            map.put(i, i);
        }
        for i in 0..64 {
            assert_eq!(map.remove(&i), Some(i));
        }
        assert_eq!(map.size(), 0);
        for i in 0..64 {
            assert!(!map.contains(&i));
        }
    }

    #[test]
    fn concurrent_inserts_survive_a_resize() {
        let map = Arc::new(NonBlockingMap::<i32, i32>::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..200 {
                        map.put(t * 200 + i, i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(map.size(), 800);
        for t in 0..4 {
            for i in 0..200 {
                assert_eq!(map.get(&(t * 200 + i)), Some(i));
            }
        }
    }

    #[test]
    fn clear_empties_and_frees_the_table() {
        let map: NonBlockingMap<i32, i32> = NonBlockingMap::new();
        for i in 0..32 {
            map.put(i, i);
        }
        map.clear();
        assert_eq!(map.size(), 0);
        assert!(!map.contains(&0));
    }
}
