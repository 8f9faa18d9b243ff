//! A single generation of the non-blocking hash map's backing table: the
//! `kv_array` and its `CHM` resize-coordination control block (§4.6).
//!
//! The original's flat, untyped `kv_array` (one word-slot array holding a
//! control block, a hash array, and interleaved key/value pointers) is
//! translated here into a struct of separately-typed atomic fields with the
//! same invariants, rather than a literal array of untyped words: `hashes`,
//! `keys`, and `values` are each their own array, and the control block lives
//! alongside them instead of occupying slot zero of the same array.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use crate::atomic::{is_prime, prime, unprime};
use crate::smr::{self, StablePtr};

/// Reprobe budget before a table is considered too full to keep reprobing
/// linearly; combined with the fill estimate in [`Chm::table_full`].
pub(crate) const REPROBE_LIMIT: usize = 10;

/// Chunk size a single thread claims when helping an in-progress copy.
pub(crate) const MIN_COPY_WORK: usize = 1024;

/// `2^MIN_SIZE_LOG` is the smallest table capacity ever allocated.
const MIN_SIZE_LOG: u32 = 3;

/// Forces an allocation's address to be low-bit-free regardless of `T`'s own
/// alignment, so the prime/tombstone tag bit can never collide with a real
/// pointer to boxed content. Mirrors the reference implementation's reliance
/// on >=16-byte-aligned heap allocations; the explicit wrapper is the sound
/// Rust equivalent for types that would not otherwise guarantee it (notably
/// anything with alignment 1).
#[repr(align(16))]
struct Boxed<T>(T);

type KeyPtr<K> = *mut Boxed<K>;
type ValPtr<V> = *mut Boxed<V>;

/// Sentinel standing in for a deleted key: once a slot's key reaches this
/// value it is permanently claimed and never reused for another key.
fn tombstone_key<K>() -> KeyPtr<K> {
    0x10 as KeyPtr<K>
}

/// Sentinel standing in for a deleted value.
fn tombstone_val<V>() -> ValPtr<V> {
    0x8 as ValPtr<V>
}

/// `prime(tombstone_val())`: a value slot that is both deleted and locked for
/// copy.
fn tombprime_val<V>() -> ValPtr<V> {
    prime(tombstone_val::<V>())
}

fn is_tombstone_key<K>(p: KeyPtr<K>) -> bool {
    unprime(p) == tombstone_key::<K>()
}

fn is_tombstone_val<V>(p: ValPtr<V>) -> bool {
    unprime(p) == tombstone_val::<V>()
}

/// Outcome of a `put_if_match` call against a single table generation.
pub(crate) enum PutOutcome<V> {
    /// The update applied; carries the value previously in the slot, if any.
    Applied(Option<V>),
    /// The caller's expectation did not hold; nothing changed.
    Mismatch(Option<V>),
    /// This table is stale; retry against `newkvs` (guaranteed non-null).
    Retry,
}

/// What the caller expects the current value to be, before applying.
pub(crate) enum Expected<'a, V> {
    /// No constraint: unconditional put.
    Any,
    /// The slot must currently be absent (null or tombstoned).
    Absent,
    /// The slot must currently hold some real value, whatever it is.
    Present,
    /// The slot must currently hold a value for which this predicate
    /// returns `true`. A closure rather than a bare `&'a V` so that callers
    /// needing equality (`replace_if`/`remove_if`) can supply it themselves
    /// — table.rs's own generic code stays free of a `V: PartialEq` bound
    /// that every other operation (`put`, `get`, ...) would otherwise have
    /// to carry too.
    Matches(&'a dyn Fn(&V) -> bool),
}

/// Resize coordination state for one table generation.
pub(crate) struct Chm<K, V> {
    newkvs: AtomicPtr<Table<K, V>>,
    slots: AtomicUsize,
    size: core::sync::atomic::AtomicIsize,
    resizers: AtomicUsize,
    copy_idx: AtomicUsize,
    copy_done: AtomicUsize,
}

impl<K, V> Chm<K, V> {
    fn new() -> Self {
        Self {
            newkvs: AtomicPtr::new(ptr::null_mut()),
            slots: AtomicUsize::new(0),
            size: core::sync::atomic::AtomicIsize::new(0),
            resizers: AtomicUsize::new(0),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
        }
    }

    /// `reprobe_cnt >= REPROBE_LIMIT && slots >= REPROBE_LIMIT + (len >> 2)`.
    fn table_full(&self, reprobe_cnt: usize, len: usize) -> bool {
        reprobe_cnt >= REPROBE_LIMIT && self.slots.load(Ordering::Relaxed) >= REPROBE_LIMIT + (len >> 2)
    }
}

/// One generation of the map's backing storage.
pub(crate) struct Table<K, V> {
    chm: Chm<K, V>,
    hashes: Box<[AtomicU64]>,
    keys: Box<[AtomicPtr<Boxed<K>>]>,
    values: Box<[AtomicPtr<Boxed<V>>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Box<Self> {
        let len = capacity.next_power_of_two().max(1 << MIN_SIZE_LOG);
        Box::new(Self {
            chm: Chm::new(),
            hashes: (0..len).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice(),
            keys: (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect::<Vec<_>>().into_boxed_slice(),
            values: (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect::<Vec<_>>().into_boxed_slice(),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.hashes.len()
    }

    pub(crate) fn size(&self) -> usize {
        self.chm.size.load(Ordering::Relaxed).max(0) as usize
    }

    /// Frees this generation's own key/value allocations, per the normal
    /// per-slot ownership rules. Does not touch `chm.newkvs`: callers decide
    /// separately whether the next generation is this table's to free.
    unsafe fn free_own_slots(&mut self) {
        for key in self.keys.iter() {
            let k = *key.get_mut();
            if !k.is_null() && !is_tombstone_key::<K>(k) {
                drop(Box::from_raw(unprime(k)));
            }
        }
        for val in self.values.iter() {
            let v = *val.get_mut();
            if !v.is_null() && !is_tombstone_val::<V>(v) {
                drop(Box::from_raw(unprime(v)));
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        unsafe { self.free_own_slots() };
        let next = *self.chm.newkvs.get_mut();
        if !next.is_null() {
            drop(unsafe { Box::from_raw(next) });
        }
    }
}

/// Retires a table generation exactly as it currently stands, including
/// recursively freeing any still-attached, never-promoted `next` generation
/// that nobody else owns. Used when the top-level table is replaced
/// wholesale (`clear`): any resize this table was mid-copying into has no
/// other owner.
unsafe fn retire_table<K, V>(table: *mut Table<K, V>) {
    unsafe fn finalizer<K, V>(object: *mut (), _context: *mut ()) {
        drop(Box::from_raw(object as *mut Table<K, V>));
    }
    smr::retire(table as *mut (), finalizer::<K, V>, ptr::null_mut());
}

/// Retires a table generation that has just been promoted (§4.6.3): its
/// `next` is `_newkvs`, whose ownership has already passed to the map's
/// top-level pointer, so this generation's finalizer must free only its own
/// slots and must not recurse into `next` a second time.
unsafe fn retire_promoted_table<K, V>(table: *mut Table<K, V>) {
    unsafe fn finalizer<K, V>(object: *mut (), _context: *mut ()) {
        let mut table = Box::from_raw(object as *mut Table<K, V>);
        *table.chm.newkvs.get_mut() = ptr::null_mut();
        drop(table);
    }
    smr::retire(table as *mut (), finalizer::<K, V>, ptr::null_mut());
}

/// Schedules the box backing a replaced value slot for reclamation through
/// the SMR engine, rather than freeing it synchronously: a concurrent `get`
/// or mismatched `put_if_match` elsewhere may still be mid-clone of `V`
/// through this exact address (protected by its own hazard, see the
/// hazard-protected reads in [`get`] and [`apply_value`]). The hazard only
/// protects the box's own address, not `V`'s inner heap data, so `V`'s
/// destructor must not run until the finalizer itself runs, once every such
/// hazard has cleared — this is a full, normal drop of `Box<Boxed<V>>`, not
/// a bare deallocation.
unsafe fn retire_boxed_value<V: 'static>(value_ptr: ValPtr<V>) {
    unsafe fn finalizer<V>(object: *mut (), _context: *mut ()) {
        drop(Box::from_raw(object as *mut Boxed<V>));
    }
    smr::retire(value_ptr as *mut (), finalizer::<V>, ptr::null_mut());
}

/// Schedules the box backing a value slot for memory-only reclamation, once
/// its `V` payload has already been moved out via `ptr::read` (the copy-slot
/// path, which relocates the value into the new table before retiring the
/// old box). The finalizer must free the allocation without running `V`'s
/// destructor a second time.
unsafe fn retire_moved_boxed_value<V: 'static>(value_ptr: ValPtr<V>) {
    unsafe fn finalizer<V>(object: *mut (), _context: *mut ()) {
        drop(Box::from_raw(object as *mut core::mem::ManuallyDrop<Boxed<V>>));
    }
    smr::retire(value_ptr as *mut (), finalizer::<V>, ptr::null_mut());
}

/// Clones the value at `value_ptr`, for a reader that does not take
/// ownership of it (a `get`, a `put_if_match` whose expectation did not
/// hold, or the previous value returned by a successful update — the slot's
/// old box is retired, not moved out of, so a concurrent clone of the same
/// address stays sound). Never moves out of a slot the table still owns.
fn peek_value<V: Clone>(value_ptr: ValPtr<V>) -> Option<V> {
    if value_ptr.is_null() || is_tombstone_val::<V>(value_ptr) {
        None
    } else {
        Some(unsafe { (*unprime(value_ptr)).0.clone() })
    }
}

/// The universal update primitive (§4.6, "Universal update primitive
/// putIfMatch"). `reprobe_counter` receives one tick per reprobe performed,
/// for the diagnostic reprobe count exposed by the map.
pub(crate) fn put_if_match<K, V>(
    table: &Table<K, V>,
    key: &K,
    fullhash: u64,
    new_value: Option<V>,
    expected: Expected<'_, V>,
    reprobe_counter: &impl Fn(),
) -> PutOutcome<V>
where
    K: Eq + Clone,
    V: Clone + 'static,
{
    let len = table.len();
    let mut idx = (fullhash as usize) & (len - 1);
    let mut reprobes = 0usize;

    loop {
        let key_slot = &table.keys[idx];
        let observed_key = key_slot.load(Ordering::Acquire);

        if observed_key.is_null() {
            if new_value.is_none() {
                // delete-of-absent: there is no slot, and no value to have
                // matched `expected` against, so no slot is claimed for it.
                // Whether that counts as an applied no-op or a mismatch
                // depends on what the caller expected to find here.
                let matches = match &expected {
                    Expected::Any | Expected::Absent => true,
                    Expected::Present | Expected::Matches(_) => false,
                };
                return if matches { PutOutcome::Applied(None) } else { PutOutcome::Mismatch(None) };
            }

            let boxed_key = Box::into_raw(Box::new(Boxed(key.clone())));
            match key_slot.compare_exchange(ptr::null_mut(), boxed_key, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    table.chm.slots.fetch_add(1, Ordering::Relaxed);
                    table.hashes[idx].store(fullhash, Ordering::Release);
                    return apply_value(table, idx, new_value, expected);
                }
                Err(_) => {
                    // lost the race for this slot; reclaim and re-read.
                    drop(unsafe { Box::from_raw(boxed_key) });
                    continue;
                }
            }
        }

        if is_tombstone_key::<K>(observed_key) {
            reprobes += 1;
            reprobe_counter();
            idx = (idx + 1) & (len - 1);
            if reprobes >= REPROBE_LIMIT + (len >> 2) {
                return route_to_resize(table, key, fullhash, new_value, expected, reprobe_counter);
            }
            continue;
        }

        let stored_hash = table.hashes[idx].load(Ordering::Acquire);
        let keys_match = (stored_hash == 0 || stored_hash == fullhash)
            && unsafe { &(*unprime(observed_key)).0 } == key;

        if keys_match {
            return apply_value(table, idx, new_value, expected);
        }

        reprobes += 1;
        reprobe_counter();
        idx = (idx + 1) & (len - 1);
        if reprobes >= REPROBE_LIMIT + (len >> 2) || table.chm.table_full(reprobes, len) {
            return route_to_resize(table, key, fullhash, new_value, expected, reprobe_counter);
        }
    }
}

fn apply_value<K, V>(
    table: &Table<K, V>,
    idx: usize,
    new_value: Option<V>,
    expected: Expected<'_, V>,
) -> PutOutcome<V>
where
    K: Eq + Clone,
    V: Clone + 'static,
{
    // allocated once up front: a CAS retry reuses the very same boxed node
    // rather than reallocating (and `new_value` is moved exactly once).
    let now_present = new_value.is_some();
    let new_ptr = match new_value {
        Some(v) => Box::into_raw(Box::new(Boxed(v))),
        None => tombstone_val::<V>(),
    };
    let owns_new_ptr = new_ptr != tombstone_val::<V>();

    let val_slot = &table.values[idx];
    loop {
        // every dereference of the slot's current value below goes through
        // this hazard-protected stable read: a plain `load` would let a
        // concurrent `retire_boxed_value` elsewhere free the pointee out
        // from under the upcoming `peek_value`/comparison (Testable
        // Property 7, "hazard-pointer safety").
        let stable = StablePtr::new(val_slot);
        let observed = stable.as_ptr();

        if is_prime(observed) {
            if owns_new_ptr {
                drop(unsafe { Box::from_raw(new_ptr) });
            }
            // mid-copy: this generation is retiring, caller must retry on
            // whichever table the copy helper resolves to.
            return PutOutcome::Retry;
        }

        let observed_present = !observed.is_null() && !is_tombstone_val::<V>(observed);
        let matches = match &expected {
            Expected::Any => true,
            Expected::Absent => !observed_present,
            Expected::Present => observed_present,
            Expected::Matches(pred) => {
                observed_present && pred(unsafe { &(*unprime(observed)).0 })
            }
        };

        if !matches {
            if owns_new_ptr {
                drop(unsafe { Box::from_raw(new_ptr) });
            }
            let prev = peek_value(observed);
            return PutOutcome::Mismatch(prev);
        }

        match val_slot.compare_exchange(observed, new_ptr, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                if !observed_present && now_present {
                    table.chm.size.fetch_add(1, Ordering::Relaxed);
                } else if observed_present && !now_present {
                    table.chm.size.fetch_sub(1, Ordering::Relaxed);
                }
                let prev = peek_value(observed);
                if !observed.is_null() && !is_tombstone_val::<V>(observed) {
                    unsafe { retire_boxed_value::<V>(unprime(observed)) };
                }
                return PutOutcome::Applied(prev);
            }
            Err(_) => continue,
        }
    }
}

fn route_to_resize<K, V>(
    table: &Table<K, V>,
    key: &K,
    fullhash: u64,
    new_value: Option<V>,
    expected: Expected<'_, V>,
    reprobe_counter: &impl Fn(),
) -> PutOutcome<V>
where
    K: Eq + Clone,
    V: Clone + 'static,
{
    let newkvs = resize(table);
    help_copy(table, newkvs);
    put_if_match(unsafe { &*newkvs }, key, fullhash, new_value, expected, reprobe_counter)
}

/// §4.6.2: installs (or returns the already-installed) next-generation table,
/// sized per the occupancy-based heuristic in [`next_len`].
pub(crate) fn resize<K, V>(table: &Table<K, V>) -> *mut Table<K, V> {
    let existing = table.chm.newkvs.load(Ordering::Acquire);
    if !existing.is_null() {
        return existing;
    }

    table.chm.resizers.fetch_add(1, Ordering::AcqRel);
    let new_len = next_len(table);
    let fresh = Box::into_raw(Table::with_capacity(new_len));

    #[cfg(feature = "std")]
    tracing::debug!(old_len = table.len(), new_len, "hash map resize triggered");

    match table.chm.newkvs.compare_exchange(
        ptr::null_mut(),
        fresh,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => fresh,
        Err(observed) => {
            drop(unsafe { Box::from_raw(fresh) });
            observed
        }
    }
}

/// §4.6.2 sizing heuristic: double at >=1/4 occupancy, quadruple at >=1/2,
/// otherwise still double (reprobe exhaustion without high occupancy means
/// the table is full of dead/tombstoned slots, not live ones); never shrink,
/// minimum `2^MIN_SIZE_LOG`.
///
/// The source's additional "double again if the last resize was within the
/// last second and half the slots are dead" throttle-breaker is not
/// reproduced: it requires tracking a last-resize timestamp purely to avoid
/// a handful of redundant resizes under pathological churn, and omitting it
/// changes no invariant (the table never shrinks and reprobe exhaustion
/// always triggers *some* growth regardless).
fn next_len<K, V>(table: &Table<K, V>) -> usize {
    let len = table.len();
    let sz = table.size();
    let grown = if sz >= len / 2 { len * 4 } else { len * 2 };
    grown.max(1 << MIN_SIZE_LOG).next_power_of_two()
}

/// §4.6.3: claims and performs one chunk of the cooperative copy from
/// `table` into `newkvs`. Falls back to an unclaimed direct scan ("panic
/// mode") once `_copyIdx` has wrapped past `2 * oldlen` without `_copyDone`
/// reaching `oldlen`.
pub(crate) fn help_copy<K, V>(table: &Table<K, V>, newkvs: *mut Table<K, V>)
where
    K: Eq + Clone,
    V: Clone + 'static,
{
    let len = table.len();
    if table.chm.copy_done.load(Ordering::Acquire) >= len {
        return;
    }

    let chunk = MIN_COPY_WORK.min(len);
    let start = table.chm.copy_idx.fetch_add(chunk, Ordering::AcqRel);
    let new_table = unsafe { &*newkvs };

    if start >= 2 * len {
        // panic mode: every chunk has already been claimed (possibly more
        // than once) without the copy completing; copy directly regardless
        // of claims. `copy_slot` is safe to call redundantly.
        let mut copied = 0usize;
        for idx in 0..len {
            if table.chm.copy_done.load(Ordering::Acquire) >= len {
                break;
            }
            if copy_slot(table, new_table, idx) {
                copied += 1;
            }
        }
        if copied > 0 {
            table.chm.copy_done.fetch_add(copied, Ordering::AcqRel);
        }
        return;
    }

    if start >= len {
        return;
    }
    let end = (start + chunk).min(len);

    let mut copied = 0usize;
    for idx in start..end {
        if copy_slot(table, new_table, idx) {
            copied += 1;
        }
    }

    if copied > 0 {
        table.chm.copy_done.fetch_add(copied, Ordering::AcqRel);
    }
}

/// Copies a single slot per §4.6.3's recipe, returning whether this call is
/// the one that newly resolved the slot (a fresh vacuous-delete or a
/// confirmed migration) — the only transitions `help_copy` counts towards
/// `_copyDone`.
fn copy_slot<K, V>(old: &Table<K, V>, new_table: &Table<K, V>, idx: usize) -> bool
where
    K: Eq + Clone,
    V: Clone + 'static,
{
    let key_slot = &old.keys[idx];
    loop {
        let key = key_slot.load(Ordering::Acquire);
        if !key.is_null() {
            break;
        }
        match key_slot.compare_exchange(
            ptr::null_mut(),
            tombstone_key::<K>(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(_) => continue,
        }
    }

    let val_slot = &old.values[idx];
    let mut claimed = None;
    loop {
        let val = val_slot.load(Ordering::Acquire);
        if is_prime(val) {
            break;
        }
        let primed =
            if val.is_null() || is_tombstone_val::<V>(val) { tombprime_val::<V>() } else { prime(val) };
        match val_slot.compare_exchange(val, primed, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                claimed = Some(primed);
                break;
            }
            Err(_) => continue,
        }
    }

    let primed_val = match claimed {
        // this call made the null/tombstone -> TOMBPRIME transition itself:
        // vacuously copied, nothing further to migrate or free.
        Some(v) if v == tombprime_val::<V>() => return true,
        Some(v) => v,
        // another call already primed this slot first (only reachable via
        // panic mode's redundant direct scan); only proceed if there is
        // still real content that call hasn't resolved to TOMBPRIME yet.
        None => {
            let observed = val_slot.load(Ordering::Acquire);
            if observed == tombprime_val::<V>() {
                return false;
            }
            observed
        }
    };

    let real_val = unprime(primed_val);
    let key_ref = unsafe { &(*unprime(key_slot.load(Ordering::Acquire))).0 };
    let fullhash = old.hashes[idx].load(Ordering::Acquire);
    let moved = unsafe { ptr::read(&(*real_val).0) };

    let no_tick = || {};
    let confirmed = matches!(
        put_if_match(new_table, key_ref, fullhash, Some(moved), Expected::Absent, &no_tick),
        PutOutcome::Applied(None)
    );

    // Whichever call wins this CAS is the one responsible for the old
    // allocation from here on: its content was already moved out above, so
    // it must be freed without running `V`'s destructor a second time.
    if val_slot
        .compare_exchange(primed_val, tombprime_val::<V>(), Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        unsafe { retire_moved_boxed_value::<V>(real_val) };
        true
    } else {
        confirmed
    }
}

/// §4.6.4: probes `table` for `key`, recursing through primed slots and
/// stale generations.
pub(crate) fn get<K, V>(table: &Table<K, V>, key: &K, fullhash: u64) -> Option<V>
where
    K: Eq + Clone,
    V: Clone + 'static,
{
    let len = table.len();
    let mut idx = (fullhash as usize) & (len - 1);
    let mut reprobes = 0usize;

    loop {
        let observed_key = table.keys[idx].load(Ordering::Acquire);

        if observed_key.is_null() {
            return None;
        }

        if !is_tombstone_key::<K>(observed_key) {
            let stored_hash = table.hashes[idx].load(Ordering::Acquire);
            if (stored_hash == 0 || stored_hash == fullhash)
                && unsafe { &(*unprime(observed_key)).0 } == key
            {
                // hazard-protected: see the comment in `apply_value`.
                let val = StablePtr::new(&table.values[idx]);
                if is_prime(val.as_ptr()) {
                    let newkvs = resize(table);
                    help_copy(table, newkvs);
                    return get(unsafe { &*newkvs }, key, fullhash);
                }
                return if val.is_null() || is_tombstone_val::<V>(val.as_ptr()) {
                    None
                } else {
                    Some(unsafe { (*unprime(val.as_ptr())).0.clone() })
                };
            }
        }

        reprobes += 1;
        idx = (idx + 1) & (len - 1);
        if reprobes >= REPROBE_LIMIT + (len >> 2) {
            let next = table.chm.newkvs.load(Ordering::Acquire);
            return if next.is_null() { None } else { get(unsafe { &*next }, key, fullhash) };
        }
    }
}

/// §4.6.3 "Promotion": if `old`'s cooperative copy has fully finished, CAS
/// the map's top-level pointer from `old` to its `_newkvs` and retire `old`.
/// A no-op if the copy has not finished, or if some other thread already won
/// this promotion.
pub(crate) unsafe fn try_promote<K: 'static, V: 'static>(
    top: &AtomicPtr<Table<K, V>>,
    old: *mut Table<K, V>,
) {
    let old_ref = &*old;
    let newkvs = old_ref.chm.newkvs.load(Ordering::Acquire);
    if newkvs.is_null() {
        return;
    }
    if old_ref.chm.copy_done.load(Ordering::Acquire) < old_ref.len() {
        return;
    }

    if top.compare_exchange(old, newkvs, Ordering::AcqRel, Ordering::Acquire).is_ok() {
        #[cfg(feature = "std")]
        tracing::debug!(old_len = old_ref.len(), new_len = (*newkvs).len(), "hash map resize promoted");
        retire_promoted_table(old);
    }
}

/// Retires an entire table generation through the SMR engine, exactly as it
/// stands, for the cases (`clear`, final map teardown via a fresh swap) where
/// no promotion has transferred ownership of any `next` generation elsewhere.
pub(crate) unsafe fn retire_generation<K: 'static, V: 'static>(table: *mut Table<K, V>) {
    retire_table(table);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread(h: u64) -> u64 {
        h
    }

    #[test]
    fn put_then_get_roundtrip() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(1);
        let outcome = put_if_match(&table, &1, fullhash, Some(100), Expected::Any, &tick);
        assert!(matches!(outcome, PutOutcome::Applied(None)));
        assert_eq!(get(&table, &1, fullhash), Some(100));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn put_if_absent_then_present_mismatches() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(2);
        let first = put_if_match(&table, &2, fullhash, Some(1), Expected::Absent, &tick);
        assert!(matches!(first, PutOutcome::Applied(None)));
        let second = put_if_match(&table, &2, fullhash, Some(2), Expected::Absent, &tick);
        assert!(matches!(second, PutOutcome::Mismatch(Some(1))));
        assert_eq!(get(&table, &2, fullhash), Some(1));
    }

    #[test]
    fn remove_transfers_ownership_back() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(3);
        put_if_match(&table, &3, fullhash, Some(9), Expected::Any, &tick);
        let removed = put_if_match(&table, &3, fullhash, None, Expected::Any, &tick);
        assert!(matches!(removed, PutOutcome::Applied(Some(9))));
        assert_eq!(get(&table, &3, fullhash), None);
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn replace_requires_presence() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(4);
        let absent = put_if_match(&table, &4, fullhash, Some(1), Expected::Present, &tick);
        assert!(matches!(absent, PutOutcome::Mismatch(None)));
        put_if_match(&table, &4, fullhash, Some(1), Expected::Any, &tick);
        let replaced = put_if_match(&table, &4, fullhash, Some(2), Expected::Present, &tick);
        assert!(matches!(replaced, PutOutcome::Applied(Some(1))));
    }

    #[test]
    fn delete_of_absent_key_claims_no_slot() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(5);

        let outcome = put_if_match(&table, &5, fullhash, None, Expected::Any, &tick);
        assert!(matches!(outcome, PutOutcome::Applied(None)));
        assert_eq!(table.chm.slots.load(Ordering::Relaxed), 0);
        assert!(table.keys[(fullhash as usize) & (table.len() - 1)].load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn conditional_delete_of_absent_key_mismatches() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(6);

        let matches_nine = |v: &i32| *v == 9;
        let outcome = put_if_match(&table, &6, fullhash, None, Expected::Matches(&matches_nine), &tick);
        assert!(matches!(outcome, PutOutcome::Mismatch(None)));
        assert_eq!(table.chm.slots.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn replaced_value_is_independently_clonable_after_update() {
        // regression: the previous value returned from a successful update
        // must be a clone, not a move out of the slot the table just
        // retired, or a concurrent reader cloning the same retired slot
        // would race with this thread's caller dropping its own copy.
        let table = Table::<i32, String>::with_capacity(8);
        let tick = || {};
        let fullhash = spread(7);

        put_if_match(&table, &7, fullhash, Some(String::from("one")), Expected::Any, &tick);
        let outcome = put_if_match(&table, &7, fullhash, Some(String::from("two")), Expected::Any, &tick);
        match outcome {
            PutOutcome::Applied(Some(prev)) => assert_eq!(prev, "one"),
            _ => panic!("expected Applied(Some(\"one\"))"),
        }
        assert_eq!(get(&table, &7, fullhash), Some(String::from("two")));
    }

    #[test]
    fn resize_migrates_all_live_entries() {
        let table = Table::<i32, i32>::with_capacity(8);
        let tick = || {};

        for i in 0..40i32 {
            let outcome = put_if_match(&table, &i, i as u64, Some(i * 10), Expected::Any, &tick);
            assert!(matches!(outcome, PutOutcome::Applied(None)));
        }

        for i in 0..40i32 {
            assert_eq!(get(&table, &i, i as u64), Some(i * 10));
        }
    }
}
