//! # Cuckoo Hash Table
//!
//! Primary index from `(table id, key)` to a tagged record pointer.
//! Geometry: three independent hash functions, each selecting a bucket
//! of four slots, so a lookup probes at most twelve slots lock-free.
//!
//! ## Slot Protocol
//!
//! Each slot is three atomic words:
//!
//! ```text
//! meta  = state (low 8 bits) | table_id << 8
//! key   = user key
//! value = tagged RecordPtr word
//! ```
//!
//! States: `EMPTY → BUSY → VALID → TOMB → BUSY → ...`. A claimer CASes
//! `EMPTY`/`TOMB` to `BUSY`, stores key and value, then releases the
//! slot with a `VALID` meta store. Readers accept only `VALID` slots, so
//! they never observe a half-written pair. Once `VALID`, the (table id,
//! key) of a slot never changes within a table generation; only the
//! value word moves (head swings by GC, dead-head replacement by
//! inserts).
//!
//! ## Runtime Inserts vs the Modifier
//!
//! Runtime inserts claim one of the twelve candidate slots and never
//! displace residents; a full neighborhood reports `Full` and the
//! engine surfaces `OutOfMemory`. Real cuckoo displacement happens in
//! the [`Modifier`](super::Modifier) rebuild, which runs single-threaded
//! at a GC boundary, builds a fresh (possibly larger) generation and
//! swaps it in atomically; superseded generations retire through the
//! epoch.
//!
//! The rebuild races runtime claims: a claim that lands in the old
//! generation while the rebuild is copying could be lost. The
//! `rebuilding` flag closes the window: claimers re-check the flag and
//! the generation pointer *after* publishing their slot and retract if
//! either moved (SeqCst ordering makes the claim visible to the copier
//! otherwise). Two racing claims for the same key deduplicate by
//! re-scanning the neighborhood: the lowest candidate slot wins, the
//! loser retracts and reports the winner.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned};

use crate::config::{
    CUCKOO_BUCKET_SLOTS, CUCKOO_DEFAULT_CAPACITY, CUCKOO_GROW_LOAD_PCT, CUCKOO_HASH_FUNCTIONS,
};
use crate::record::RecordPtr;

const STATE_EMPTY: u64 = 0;
const STATE_BUSY: u64 = 1;
const STATE_VALID: u64 = 2;
const STATE_TOMB: u64 = 3;
const STATE_MASK: u64 = 0xFF;

// Fixed odd multipliers for the three hash functions (splitmix64-derived).
const SEEDS: [u64; CUCKOO_HASH_FUNCTIONS] = [
    0x9E37_79B9_7F4A_7C15,
    0xBF58_476D_1CE4_E5B9,
    0x94D0_49BB_1331_11EB,
];

struct Slot {
    meta: AtomicU64,
    key: AtomicU64,
    value: AtomicU64,
}

impl Slot {
    fn state(&self) -> u64 {
        self.meta.load(Ordering::Acquire) & STATE_MASK
    }
}

fn meta_word(state: u64, table_id: u32) -> u64 {
    state | ((table_id as u64) << 8)
}

struct Generation {
    slots: Box<[Slot]>,
    bucket_mask: usize,
}

impl Generation {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| Slot {
                meta: AtomicU64::new(0),
                key: AtomicU64::new(0),
                value: AtomicU64::new(0),
            })
            .collect();
        Generation {
            slots,
            bucket_mask: capacity / CUCKOO_BUCKET_SLOTS - 1,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn bucket(&self, table_id: u32, key: u64, func: usize) -> usize {
        let mixed = (key ^ ((table_id as u64) << 32)).wrapping_mul(SEEDS[func]);
        ((mixed >> 17) as usize & self.bucket_mask) * CUCKOO_BUCKET_SLOTS
    }

    fn candidate_slots(&self, table_id: u32, key: u64) -> impl Iterator<Item = usize> + '_ {
        (0..CUCKOO_HASH_FUNCTIONS).flat_map(move |f| {
            let base = self.bucket(table_id, key, f);
            base..base + CUCKOO_BUCKET_SLOTS
        })
    }

    fn find_valid(&self, table_id: u32, key: u64) -> Option<usize> {
        let want_meta = meta_word(STATE_VALID, table_id);
        self.candidate_slots(table_id, key).find(|&idx| {
            let slot = &self.slots[idx];
            slot.meta.load(Ordering::Acquire) == want_meta
                && slot.key.load(Ordering::Acquire) == key
        })
    }

    /// Build-time insert with displacement. Exclusive access only.
    fn displace_insert(&self, table_id: u32, key: u64, value: u64) -> bool {
        let (mut table_id, mut key, mut value) = (table_id, key, value);
        for round in 0..512 {
            for idx in self.candidate_slots(table_id, key) {
                let slot = &self.slots[idx];
                if slot.state() != STATE_VALID {
                    slot.key.store(key, Ordering::Relaxed);
                    slot.value.store(value, Ordering::Relaxed);
                    slot.meta
                        .store(meta_word(STATE_VALID, table_id), Ordering::Release);
                    return true;
                }
            }
            // Kick a resident from a rotating candidate bucket.
            let victim_idx = self.bucket(table_id, key, round % CUCKOO_HASH_FUNCTIONS)
                + (round / CUCKOO_HASH_FUNCTIONS) % CUCKOO_BUCKET_SLOTS;
            let victim = &self.slots[victim_idx];
            let v_meta = victim.meta.load(Ordering::Relaxed);
            let v_key = victim.key.load(Ordering::Relaxed);
            let v_value = victim.value.load(Ordering::Relaxed);
            victim.key.store(key, Ordering::Relaxed);
            victim.value.store(value, Ordering::Relaxed);
            victim
                .meta
                .store(meta_word(STATE_VALID, table_id), Ordering::Release);
            table_id = (v_meta >> 8) as u32;
            key = v_key;
            value = v_value;
        }
        false
    }
}

/// Outcome of a runtime insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was claimed and now maps to the given pointer.
    Inserted,
    /// The key already has a slot; its current value is returned.
    Exists(u64),
    /// All candidate slots are occupied.
    Full,
}

pub struct CuckooHash {
    current: Atomic<Generation>,
    rebuilding: AtomicBool,
    live: AtomicUsize,
}

impl CuckooHash {
    pub fn new() -> Self {
        Self::with_capacity(CUCKOO_DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CuckooHash {
            current: Atomic::new(Generation::new(capacity)),
            rebuilding: AtomicBool::new(false),
            live: AtomicUsize::new(0),
        }
    }

    fn generation<'g>(&self, guard: &'g Guard) -> &'g Generation {
        unsafe { self.current.load(Ordering::Acquire, guard).deref() }
    }

    /// Lock-free lookup. A zero value word is a dead mapping (removed
    /// by GC, slot pending reuse) and reads as a miss.
    pub fn get(&self, table_id: u32, key: u64, guard: &Guard) -> Option<u64> {
        let generation = self.generation(guard);
        let idx = generation.find_valid(table_id, key)?;
        let value = generation.slots[idx].value.load(Ordering::Acquire);
        (value != 0).then_some(value)
    }

    /// Claims a slot for a new key. Never displaces residents; the
    /// modifier rebuild resolves crowded neighborhoods.
    pub fn insert(&self, table_id: u32, key: u64, value: u64, guard: &Guard) -> InsertOutcome {
        loop {
            while self.rebuilding.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            let gen_ptr = self.current.load(Ordering::SeqCst, guard);
            let generation = unsafe { gen_ptr.deref() };

            if let Some(idx) = generation.find_valid(table_id, key) {
                let slot = &generation.slots[idx];
                let current = slot.value.load(Ordering::Acquire);
                if current != 0 {
                    return InsertOutcome::Exists(current);
                }
                // Dead mapping left by a GC removal: revive in place.
                match slot
                    .value
                    .compare_exchange(0, value, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => {
                        self.live.fetch_add(1, Ordering::Relaxed);
                        return InsertOutcome::Inserted;
                    }
                    Err(actual) => return InsertOutcome::Exists(actual),
                }
            }

            let mut claimed = None;
            for idx in generation.candidate_slots(table_id, key) {
                let slot = &generation.slots[idx];
                let state = slot.state();
                if state != STATE_EMPTY && state != STATE_TOMB {
                    continue;
                }
                let old_meta = slot.meta.load(Ordering::Acquire);
                if old_meta & STATE_MASK != state {
                    continue;
                }
                if slot
                    .meta
                    .compare_exchange(
                        old_meta,
                        meta_word(STATE_BUSY, table_id),
                        Ordering::SeqCst,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    slot.key.store(key, Ordering::Release);
                    slot.value.store(value, Ordering::Release);
                    slot.meta
                        .store(meta_word(STATE_VALID, table_id), Ordering::SeqCst);
                    claimed = Some(idx);
                    break;
                }
            }
            let Some(my_idx) = claimed else {
                return InsertOutcome::Full;
            };

            // Close the race against a concurrent rebuild: if the flag or
            // the generation moved after our publish, the copier may not
            // have seen the slot. Retract and redo.
            if self.rebuilding.load(Ordering::SeqCst)
                || self.current.load(Ordering::SeqCst, guard) != gen_ptr
            {
                generation.slots[my_idx]
                    .meta
                    .store(meta_word(STATE_TOMB, table_id), Ordering::SeqCst);
                continue;
            }

            // Deduplicate racing claims for the same key: lowest
            // candidate slot wins.
            let winner = generation
                .find_valid(table_id, key)
                .expect("just-published slot vanished");
            if winner != my_idx {
                generation.slots[my_idx]
                    .meta
                    .store(meta_word(STATE_TOMB, table_id), Ordering::SeqCst);
                return InsertOutcome::Exists(
                    generation.slots[winner].value.load(Ordering::Acquire),
                );
            }
            self.live.fetch_add(1, Ordering::Relaxed);
            return InsertOutcome::Inserted;
        }
    }

    /// CAS on the value word of an existing key. Used to replace a dead
    /// (aborted-insert) head with a fresh one.
    pub fn update(
        &self,
        table_id: u32,
        key: u64,
        expected: u64,
        value: u64,
        guard: &Guard,
    ) -> Result<(), Option<u64>> {
        let generation = self.generation(guard);
        match generation.find_valid(table_id, key) {
            None => Err(None),
            Some(idx) => generation.slots[idx]
                .value
                .compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst)
                .map(|_| ())
                .map_err(|actual| Some(actual)),
        }
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// GC-side batched writer. One modifier exists at a time (the GC
    /// driver is single-threaded).
    pub fn modifier(&self) -> Modifier<'_> {
        Modifier {
            hash: self,
            ops: Vec::new(),
        }
    }

    fn capacity(&self, guard: &Guard) -> usize {
        self.generation(guard).capacity()
    }
}

impl Default for CuckooHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CuckooHash {
    fn drop(&mut self) {
        // The final generation is owned exclusively here.
        let guard = crossbeam_epoch::pin();
        let ptr = self.current.load(Ordering::Acquire, &guard);
        if !ptr.is_null() {
            unsafe {
                guard.defer_destroy(ptr);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Upsert {
        table_id: u32,
        key: u64,
        value: u64,
    },
    Remove {
        table_id: u32,
        key: u64,
        expected: u64,
    },
}

/// Batched hash mutations produced during one GC pass and published
/// together at the pass boundary.
pub struct Modifier<'a> {
    hash: &'a CuckooHash,
    ops: Vec<Op>,
}

impl<'a> Modifier<'a> {
    /// Queues key → pointer. Upsert semantics: relocations overwrite the
    /// previous head pointer.
    pub fn insert(&mut self, table_id: u32, key: u64, ptr: RecordPtr) {
        self.ops.push(Op::Upsert {
            table_id,
            key,
            value: ptr.encode(),
        });
    }

    /// Queues a removal, conditional on the mapping still holding
    /// `expected`. A key revived by a concurrent insert (the value word
    /// moved on) survives the batch untouched.
    pub fn remove(&mut self, table_id: u32, key: u64, expected: RecordPtr) {
        self.ops.push(Op::Remove {
            table_id,
            key,
            expected: expected.encode(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Publishes the batch. Grows (with real cuckoo displacement) into a
    /// fresh generation when the table runs hot; otherwise applies the
    /// ops to the live generation slot by slot. Readers that observe the
    /// old head of a relocated record chase its forward pointer, so the
    /// per-slot path never exposes a torn view.
    pub fn publish(self, guard: &Guard) {
        let projected = self.hash.len() + self.ops.len();
        if projected * 100 >= self.hash.capacity(guard) * CUCKOO_GROW_LOAD_PCT {
            self.publish_rebuild(guard);
        } else {
            self.publish_in_place(guard);
        }
    }

    fn publish_in_place(self, guard: &Guard) {
        let generation = self.hash.generation(guard);
        for i in 0..self.ops.len() {
            match self.ops[i] {
                Op::Upsert {
                    table_id,
                    key,
                    value,
                } => match generation.find_valid(table_id, key) {
                    Some(idx) => generation.slots[idx].value.store(value, Ordering::SeqCst),
                    None => {
                        // Key drained from the log for the first time.
                        match self.hash.insert(table_id, key, value, guard) {
                            InsertOutcome::Inserted => {}
                            InsertOutcome::Exists(_) | InsertOutcome::Full => {
                                // Neighborhood exhausted: fall back to a
                                // displacing rebuild. Re-applying the
                                // already-installed prefix is idempotent.
                                return Modifier {
                                    hash: self.hash,
                                    ops: self.ops,
                                }
                                .publish_rebuild(guard);
                            }
                        }
                    }
                },
                Op::Remove {
                    table_id,
                    key,
                    expected,
                } => {
                    if let Some(idx) = generation.find_valid(table_id, key) {
                        if generation.slots[idx]
                            .value
                            .compare_exchange(expected, 0, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            self.hash.live.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    fn publish_rebuild(self, guard: &Guard) {
        self.hash.rebuilding.store(true, Ordering::SeqCst);

        let old_ptr = self.hash.current.load(Ordering::SeqCst, guard);
        let old = unsafe { old_ptr.deref() };
        let mut entries: Vec<(u32, u64, u64)> = Vec::with_capacity(self.hash.len());
        for slot in old.slots.iter() {
            let meta = slot.meta.load(Ordering::SeqCst);
            if meta & STATE_MASK == STATE_VALID {
                let value = slot.value.load(Ordering::SeqCst);
                if value != 0 {
                    entries.push(((meta >> 8) as u32, slot.key.load(Ordering::SeqCst), value));
                }
            }
        }
        for op in &self.ops {
            match *op {
                Op::Upsert {
                    table_id,
                    key,
                    value,
                } => {
                    if let Some(e) = entries.iter_mut().find(|e| e.0 == table_id && e.1 == key) {
                        e.2 = value;
                    } else {
                        entries.push((table_id, key, value));
                    }
                }
                Op::Remove {
                    table_id,
                    key,
                    expected,
                } => {
                    entries.retain(|e| !(e.0 == table_id && e.1 == key && e.2 == expected));
                }
            }
        }

        let mut capacity = old.capacity();
        while entries.len() * 100 >= capacity * CUCKOO_GROW_LOAD_PCT {
            capacity *= 2;
        }
        'retry: loop {
            let fresh = Generation::new(capacity);
            for &(table_id, key, value) in &entries {
                if !fresh.displace_insert(table_id, key, value) {
                    capacity *= 2;
                    continue 'retry;
                }
            }
            self.hash
                .current
                .store(Owned::new(fresh), Ordering::SeqCst);
            break;
        }
        self.hash.live.store(entries.len(), Ordering::SeqCst);
        unsafe {
            guard.defer_destroy(old_ptr);
        }
        self.hash.rebuilding.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pin;

    #[test]
    fn insert_then_get() {
        let hash = CuckooHash::with_capacity(64);
        let guard = pin();
        assert_eq!(hash.insert(1, 42, 0x1000, &guard), InsertOutcome::Inserted);
        assert_eq!(hash.get(1, 42, &guard), Some(0x1000));
        assert_eq!(hash.get(1, 43, &guard), None);
        assert_eq!(hash.get(2, 42, &guard), None, "table ids separate keyspaces");
    }

    #[test]
    fn double_insert_reports_existing_value() {
        let hash = CuckooHash::with_capacity(64);
        let guard = pin();
        hash.insert(1, 42, 0x1000, &guard);
        assert_eq!(hash.insert(1, 42, 0x2000, &guard), InsertOutcome::Exists(0x1000));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    fn value_cas_swings_head() {
        let hash = CuckooHash::with_capacity(64);
        let guard = pin();
        hash.insert(1, 7, 0x1000, &guard);
        assert!(hash.update(1, 7, 0x1000, 0x2000, &guard).is_ok());
        assert_eq!(hash.get(1, 7, &guard), Some(0x2000));
        assert_eq!(hash.update(1, 7, 0x1000, 0x3000, &guard), Err(Some(0x2000)));
        assert_eq!(hash.update(1, 99, 0, 0x3000, &guard), Err(None));
    }

    #[test]
    fn modifier_upsert_and_remove() {
        let hash = CuckooHash::with_capacity(256);
        let guard = pin();
        hash.insert(1, 10, 0x1000, &guard);
        hash.insert(1, 11, 0x1100, &guard);
        let mut modifier = hash.modifier();
        modifier.insert(1, 10, RecordPtr::MainRow(0x2000));
        modifier.insert(1, 12, RecordPtr::MainRow(0x2200));
        modifier.remove(1, 11, RecordPtr::decode(0x1100));
        modifier.publish(&guard);
        assert_eq!(hash.get(1, 10, &guard), Some(RecordPtr::MainRow(0x2000).encode()));
        assert_eq!(hash.get(1, 11, &guard), None);
        assert_eq!(hash.get(1, 12, &guard), Some(RecordPtr::MainRow(0x2200).encode()));
    }

    #[test]
    fn rebuild_preserves_entries_and_grows() {
        let hash = CuckooHash::with_capacity(64);
        let guard = pin();
        // Push the load factor over the rebuild threshold via modifiers.
        let mut modifier = hash.modifier();
        for key in 0..200u64 {
            modifier.insert(3, key, RecordPtr::MainRow(0x1000 + (key as usize) * 8));
        }
        modifier.publish(&guard);
        assert!(hash.capacity(&guard) > 64);
        for key in 0..200u64 {
            assert_eq!(
                hash.get(3, key, &guard),
                Some(RecordPtr::MainRow(0x1000 + (key as usize) * 8).encode()),
                "key {key} lost in rebuild"
            );
        }
    }

    #[test]
    fn removed_mapping_reads_as_miss_and_revives() {
        let hash = CuckooHash::with_capacity(64);
        let guard = pin();
        hash.insert(1, 5, 0x1000, &guard);
        let mut modifier = hash.modifier();
        modifier.remove(1, 5, RecordPtr::decode(0x1000));
        modifier.publish(&guard);
        assert_eq!(hash.get(1, 5, &guard), None);
        assert_eq!(hash.len(), 0);
        assert_eq!(hash.insert(1, 5, 0x2000, &guard), InsertOutcome::Inserted);
        assert_eq!(hash.get(1, 5, &guard), Some(0x2000));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    fn conditional_remove_spares_a_moved_value() {
        let hash = CuckooHash::with_capacity(64);
        let guard = pin();
        hash.insert(1, 5, 0x1000, &guard);
        let mut modifier = hash.modifier();
        modifier.remove(1, 5, RecordPtr::decode(0x1000));
        // The key moved on before the batch published.
        assert!(hash.update(1, 5, 0x1000, 0x3000, &guard).is_ok());
        modifier.publish(&guard);
        assert_eq!(hash.get(1, 5, &guard), Some(0x3000));
    }

    #[test]
    fn concurrent_inserts_distinct_keys() {
        use std::sync::Arc;
        let hash = Arc::new(CuckooHash::with_capacity(1 << 13));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let hash = Arc::clone(&hash);
            handles.push(std::thread::spawn(move || {
                let guard = pin();
                for i in 0..500u64 {
                    let key = t * 1_000 + i;
                    assert_eq!(
                        hash.insert(1, key, key << 3, &guard),
                        InsertOutcome::Inserted
                    );
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let guard = pin();
        for t in 0..4u64 {
            for i in 0..500u64 {
                let key = t * 1_000 + i;
                assert_eq!(hash.get(1, key, &guard), Some(key << 3));
            }
        }
    }
}
