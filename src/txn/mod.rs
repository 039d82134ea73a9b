//! # Snapshots and the Commit Manager
//!
//! Multi-version visibility is decided entirely by [`SnapshotDescriptor`]
//! values handed out at transaction start. A descriptor carries:
//!
//! - `base_version`: the newest version number issued before this
//!   transaction started.
//! - `inflight`: versions that were issued but not yet finished (committed
//!   or aborted) at start time. These are invisible even though they are
//!   numerically below `base_version`.
//! - `own_version`: the version this transaction writes with. A
//!   transaction always sees its own writes.
//!
//! A stored version `v` is in the read set iff
//! `v == own || (v <= base && v not inflight)`.
//!
//! ## Commit Manager
//!
//! The engine-internal implementation of the commit interface: a global
//! atomic version counter plus a fixed array of active-transaction slots.
//! Slot values are the `base_version` of the occupying transaction; the
//! **lowest active version**, the GC reclamation watermark, is the
//! minimum over occupied slots (or the issue counter when idle), computed
//! by a lock-free O(64) sweep.
//!
//! ```text
//! start ──> Active ──> commit ──> slot cleared, writes visible
//!              │
//!              └────> abort ───> slot cleared, writes flagged dead
//! ```
//!
//! Slot claim takes a short mutex; everything else is atomics. Version
//! numbers are never reused.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::MAX_ACTIVE_TRANSACTIONS;
use crate::error::{Result, StorageError};

/// Monotone version number assigned at transaction start.
pub type Version = u64;

/// The visibility cut of one transaction.
#[derive(Debug, Clone)]
pub struct SnapshotDescriptor {
    base_version: Version,
    own_version: Version,
    inflight: SmallVec<[Version; 8]>,
    slot: usize,
}

impl SnapshotDescriptor {
    pub fn base_version(&self) -> Version {
        self.base_version
    }

    pub fn own_version(&self) -> Version {
        self.own_version
    }

    pub fn inflight(&self) -> &[Version] {
        &self.inflight
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// True iff a tuple stamped `version` is visible to this snapshot.
    pub fn in_read_set(&self, version: Version) -> bool {
        if version == self.own_version {
            return true;
        }
        version <= self.base_version && !self.inflight.contains(&version)
    }

    /// Descriptor for tests and standalone readers: sees everything at or
    /// below `base`, writes nothing.
    pub fn at_base(base: Version) -> Self {
        SnapshotDescriptor {
            base_version: base,
            own_version: 0,
            inflight: SmallVec::new(),
            slot: usize::MAX,
        }
    }
}

/// Issues version numbers and snapshot descriptors, tracks which
/// transactions are live, and derives the GC watermark.
pub struct CommitManager {
    counter: AtomicU64,
    // Slot value = own_version of the occupant, 0 = free. Versions start
    // at 1, so 0 is unambiguous.
    slots: [AtomicU64; MAX_ACTIVE_TRANSACTIONS],
    claim: Mutex<()>,
}

impl CommitManager {
    pub fn new() -> Self {
        const FREE: AtomicU64 = AtomicU64::new(0);
        CommitManager {
            counter: AtomicU64::new(0),
            slots: [FREE; MAX_ACTIVE_TRANSACTIONS],
            claim: Mutex::new(()),
        }
    }

    /// Starts a transaction: issues the next version and captures the
    /// set of currently active versions as the inflight set.
    pub fn start_transaction(&self) -> Result<SnapshotDescriptor> {
        let _guard = self.claim.lock();
        let slot = self
            .slots
            .iter()
            .position(|s| s.load(Ordering::Relaxed) == 0)
            .ok_or(StorageError::OutOfMemory("transaction slots exhausted"))?;

        let mut inflight = SmallVec::new();
        for (idx, s) in self.slots.iter().enumerate() {
            if idx == slot {
                continue;
            }
            let own = s.load(Ordering::Acquire);
            if own != 0 {
                inflight.push(own);
            }
        }
        let own_version = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.slots[slot].store(own_version, Ordering::SeqCst);
        Ok(SnapshotDescriptor {
            base_version: own_version - 1,
            own_version,
            inflight,
            slot,
        })
    }

    /// Finishes a transaction. Commit and abort are identical from the
    /// manager's view: the slot frees and the version stops being
    /// inflight for future snapshots.
    pub fn finish(&self, snapshot: &SnapshotDescriptor) {
        if snapshot.slot < MAX_ACTIVE_TRANSACTIONS {
            self.slots[snapshot.slot].store(0, Ordering::SeqCst);
        }
    }

    /// Newest version issued so far.
    pub fn current_version(&self) -> Version {
        self.counter.load(Ordering::SeqCst)
    }

    /// Minimum `base_version` across all live snapshots; versions
    /// strictly older are reclaimable. Falls back to the issue counter
    /// when no transaction is active.
    pub fn lowest_active_version(&self) -> Version {
        let mut min = self.counter.load(Ordering::Acquire);
        for s in &self.slots {
            let own = s.load(Ordering::Acquire);
            if own != 0 && own - 1 < min {
                min = own - 1;
            }
        }
        min
    }

    /// Captures the reclamation horizon for one GC pass: the watermark
    /// plus the set of versions whose transactions are still undecided.
    pub fn horizon(&self) -> GcHorizon {
        // Slots first: a transaction finishing between the two reads then
        // shows up as active with a stale watermark, which only makes the
        // horizon more conservative.
        let mut active = SmallVec::new();
        for s in &self.slots {
            let own = s.load(Ordering::SeqCst);
            if own != 0 {
                active.push(own);
            }
        }
        GcHorizon {
            lowest_active: self.lowest_active_version(),
            active,
        }
    }
}

/// The reclamation cut of one GC pass.
///
/// Versions strictly below `lowest_active` are unobservable by any live
/// snapshot and may be dropped (keeping the newest such version so the
/// watermark snapshot itself still reads). Versions in `active` belong to
/// undecided transactions: GC never inlines them into main images.
#[derive(Debug, Clone)]
pub struct GcHorizon {
    lowest_active: Version,
    active: SmallVec<[Version; MAX_ACTIVE_TRANSACTIONS]>,
}

impl GcHorizon {
    pub fn new(lowest_active: Version, active: &[Version]) -> Self {
        GcHorizon {
            lowest_active,
            active: SmallVec::from_slice(active),
        }
    }

    pub fn lowest_active(&self) -> Version {
        self.lowest_active
    }

    /// True once `version`'s transaction has committed or aborted.
    pub fn decided(&self, version: Version) -> bool {
        !self.active.contains(&version)
    }
}

impl Default for CommitManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_monotone_and_unique() {
        let cm = CommitManager::new();
        let a = cm.start_transaction().unwrap();
        let b = cm.start_transaction().unwrap();
        assert!(b.own_version() > a.own_version());
        assert_eq!(a.base_version(), a.own_version() - 1);
    }

    #[test]
    fn concurrent_transaction_is_inflight() {
        let cm = CommitManager::new();
        let a = cm.start_transaction().unwrap();
        let b = cm.start_transaction().unwrap();
        // b started while a was live: a's version is below b's base but
        // must stay invisible.
        assert!(b.base_version() >= a.own_version());
        assert!(!b.in_read_set(a.own_version()));
        cm.finish(&a);
        let c = cm.start_transaction().unwrap();
        assert!(c.in_read_set(a.own_version()));
        cm.finish(&b);
        cm.finish(&c);
    }

    #[test]
    fn own_writes_are_always_visible() {
        let cm = CommitManager::new();
        let snap = cm.start_transaction().unwrap();
        assert!(snap.in_read_set(snap.own_version()));
        assert!(!snap.in_read_set(snap.own_version() + 1));
    }

    #[test]
    fn lowest_active_version_tracks_oldest_snapshot() {
        let cm = CommitManager::new();
        let a = cm.start_transaction().unwrap();
        let b = cm.start_transaction().unwrap();
        assert_eq!(cm.lowest_active_version(), a.base_version());
        cm.finish(&a);
        assert_eq!(cm.lowest_active_version(), b.base_version());
        cm.finish(&b);
        assert_eq!(cm.lowest_active_version(), cm.current_version());
    }

    #[test]
    fn slot_exhaustion_is_reported() {
        let cm = CommitManager::new();
        let mut live = Vec::new();
        for _ in 0..MAX_ACTIVE_TRANSACTIONS {
            live.push(cm.start_transaction().unwrap());
        }
        assert!(matches!(
            cm.start_transaction(),
            Err(StorageError::OutOfMemory(_))
        ));
        for snap in &live {
            cm.finish(snap);
        }
    }
}
