//! Transient key → log-insert index built once per GC pass.
//!
//! For every key that lives only in the log (its hash entry still points
//! at a `LogInsert` record), the map lists the insert payload addresses
//! in ascending version order. Page-level GC drains the map after the
//! main pages of a table are compacted, so fresh inserts reach main in
//! the same pass.

use hashbrown::HashMap;
use smallvec::SmallVec;

#[derive(Debug, Default)]
pub struct InsertMap {
    entries: HashMap<u64, SmallVec<[usize; 1]>>,
}

impl InsertMap {
    pub fn new() -> Self {
        InsertMap {
            entries: HashMap::new(),
        }
    }

    /// Registers an insert record for `key`. Addresses arrive in log
    /// order; within one key that is ascending version order.
    pub fn push(&mut self, key: u64, addr: usize) {
        self.entries.entry(key).or_default().push(addr);
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: u64) -> Option<&[usize]> {
        self.entries.get(&key).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, key: u64) {
        self.entries.remove(&key);
    }

    /// Snapshot of the pending keys; GC iterates this while removing
    /// entries as they drain.
    pub fn keys(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
