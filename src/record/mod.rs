//! # Polymorphic Record Views
//!
//! A record is a view over bytes tagged by a leading type byte. Five
//! byte-image variants exist:
//!
//! - `SingleVersion` / `MultiVersion`: compacted main images written by
//!   GC into row-store pages ([`main_image`]).
//! - `LogInsert` / `LogUpdate` / `LogDelete`: versioned deltas appended
//!   to the log ([`log_image`]).
//!
//! [`RecordView`] dispatches the capability set (`size`, `key`,
//! `get_version`, `needs_cleaning`, `copy_and_compact`) over the type
//! byte.
//!
//! ## Version chains
//!
//! Every record head (a main image, or a `LogInsert` for keys not yet
//! compacted) carries an atomic **newest pointer**. Updates link new log
//! records in front of the head by CAS on that word; each update's
//! `previous` field points at the next older log record, and `previous
//! == 0` means "continue in the head image". First-committer-wins falls
//! out of the CAS: the loser observes a changed word and reports a write
//! conflict.
//!
//! ## Newest word encoding
//!
//! Log records and page slots are 8-aligned, so the low bits carry tags:
//!
//! ```text
//! 0                      no newer version
//! addr (bits 0-1 = 00)   payload address of the newest log record
//! addr | 01              forwarded: GC relocated the record; the target
//!                        is a main row image (bit 1 = 0) or a
//!                        column-map entry (bit 1 = 1)
//! 1 (GONE)               record fully reclaimed by GC
//! ```
//!
//! Readers chase forwards transparently; writers re-resolve through the
//! hash table when their CAS meets a forward.

mod compact;
mod log_image;
mod main_image;

pub use compact::{
    copy_and_compact, gather_from_parts, gather_record, CompactOutcome, CompactedRecord,
    GatherOutcome,
};
pub use log_image::{
    flags, log_record_size, write_log_record, LogRecordView, LOG_RECORD_HEADER_SIZE,
};
pub use main_image::{
    multi_version_size, single_version_size, write_multi_version, write_single_version,
    MultiVersionView, SingleVersionView, MAIN_RECORD_HEADER_SIZE,
};

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::Guard;
use smallvec::SmallVec;

use crate::txn::SnapshotDescriptor;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    SingleVersion = 1,
    MultiVersion = 2,
    LogInsert = 3,
    LogUpdate = 4,
    LogDelete = 5,
}

impl RecordType {
    pub fn from_byte(b: u8) -> RecordType {
        match b {
            1 => RecordType::SingleVersion,
            2 => RecordType::MultiVersion,
            3 => RecordType::LogInsert,
            4 => RecordType::LogUpdate,
            5 => RecordType::LogDelete,
            other => panic!("corrupt record type byte {other}"),
        }
    }
}

/// Tagged pointer stored in the hash table: where a key's record head
/// lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPtr {
    /// Address of a main row image (single- or multi-version).
    MainRow(usize),
    /// Payload address of a `LogInsert` entry not yet compacted.
    LogHead(usize),
    /// Address of a column-map entry slot (the key cell of the record's
    /// first row).
    ColumnEntry(usize),
}

impl RecordPtr {
    const TAG_MASK: u64 = 0b11;

    pub fn encode(self) -> u64 {
        match self {
            RecordPtr::MainRow(addr) => addr as u64,
            RecordPtr::LogHead(addr) => addr as u64 | 1,
            RecordPtr::ColumnEntry(addr) => addr as u64 | 2,
        }
    }

    pub fn decode(word: u64) -> RecordPtr {
        let addr = (word & !Self::TAG_MASK) as usize;
        match word & Self::TAG_MASK {
            0 => RecordPtr::MainRow(addr),
            1 => RecordPtr::LogHead(addr),
            2 => RecordPtr::ColumnEntry(addr),
            _ => panic!("corrupt record pointer tag"),
        }
    }

    pub fn addr(self) -> usize {
        match self {
            RecordPtr::MainRow(a) | RecordPtr::LogHead(a) | RecordPtr::ColumnEntry(a) => a,
        }
    }
}

/// Newest-pointer word encoding (see the module doc).
pub mod newest {
    const FORWARD: u64 = 0b01;
    const COLUMN: u64 = 0b10;
    const ADDR_MASK: u64 = !0b111;

    /// Forward-with-no-target: the record was reclaimed outright.
    pub const GONE: u64 = FORWARD;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Newest {
        None,
        /// Payload address of the newest log record in the chain.
        Log(usize),
        /// GC moved the head; follow to a main row image.
        ForwardMain(usize),
        /// GC moved the head; follow to a column-map entry.
        ForwardColumn(usize),
        Gone,
    }

    pub fn decode(word: u64) -> Newest {
        if word == 0 {
            Newest::None
        } else if word == GONE {
            Newest::Gone
        } else if word & FORWARD == 0 {
            Newest::Log(word as usize)
        } else if word & COLUMN == 0 {
            Newest::ForwardMain((word & ADDR_MASK) as usize)
        } else {
            Newest::ForwardColumn((word & ADDR_MASK) as usize)
        }
    }

    pub fn encode_log(addr: usize) -> u64 {
        debug_assert_eq!(addr % 8, 0);
        addr as u64
    }

    pub fn encode_forward(ptr: super::RecordPtr) -> u64 {
        match ptr {
            super::RecordPtr::MainRow(addr) => addr as u64 | FORWARD,
            super::RecordPtr::ColumnEntry(addr) => addr as u64 | FORWARD | COLUMN,
            super::RecordPtr::LogHead(_) => unreachable!("records never forward into the log"),
        }
    }
}

/// Tuple bytes resolved from storage: log and row-main reads borrow the
/// underlying page; column-map reads re-materialize the row.
#[derive(Debug, Clone)]
pub enum TupleData<'g> {
    Borrowed(&'g [u8]),
    Owned(Vec<u8>),
}

impl<'g> TupleData<'g> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            TupleData::Borrowed(b) => b,
            TupleData::Owned(v) => v,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            TupleData::Borrowed(b) => b.to_vec(),
            TupleData::Owned(v) => v,
        }
    }
}

/// One tuple resolved for a snapshot. `data == None` is a tombstone.
#[derive(Debug, Clone)]
pub struct VisibleVersion<'g> {
    pub data: Option<TupleData<'g>>,
    pub version: u64,
    pub is_newest: bool,
}

/// Outcome of asking a head view for a snapshot's version: either an
/// answer, or a forward left behind by GC that the caller must chase.
#[derive(Debug)]
pub enum Lookup<'g> {
    Done(Option<VisibleVersion<'g>>),
    Forward(RecordPtr),
    Gone,
}

/// Walks a version chain from a newest-word value, yielding linked log
/// records newest-first. Aborted records are yielded too; callers filter.
pub(crate) struct ChainIter<'g> {
    next: usize,
    _guard: &'g Guard,
}

impl<'g> ChainIter<'g> {
    pub(crate) fn from_word(word: u64, guard: &'g Guard) -> Self {
        let next = match newest::decode(word) {
            newest::Newest::Log(addr) => addr,
            _ => 0,
        };
        ChainIter { next, _guard: guard }
    }
}

impl<'g> Iterator for ChainIter<'g> {
    type Item = LogRecordView<'g>;

    fn next(&mut self) -> Option<LogRecordView<'g>> {
        if self.next == 0 {
            return None;
        }
        let view = unsafe { LogRecordView::from_addr(self.next) };
        self.next = view.previous() as usize;
        Some(view)
    }
}

/// A typed view over any record image, dispatched on the leading byte.
#[derive(Clone, Copy, Debug)]
pub enum RecordView<'g> {
    Single(SingleVersionView<'g>),
    Multi(MultiVersionView<'g>),
    Insert(LogRecordView<'g>),
    Update(LogRecordView<'g>),
    Delete(LogRecordView<'g>),
}

impl<'g> RecordView<'g> {
    /// # Safety
    /// `addr` must point at a published record image and stay valid for
    /// the guard's critical section.
    pub unsafe fn from_addr(addr: usize, _guard: &'g Guard) -> Self {
        match RecordType::from_byte(*(addr as *const u8)) {
            RecordType::SingleVersion => RecordView::Single(SingleVersionView::from_addr(addr)),
            RecordType::MultiVersion => RecordView::Multi(MultiVersionView::from_addr(addr)),
            RecordType::LogInsert => RecordView::Insert(LogRecordView::from_addr(addr)),
            RecordType::LogUpdate => RecordView::Update(LogRecordView::from_addr(addr)),
            RecordType::LogDelete => RecordView::Delete(LogRecordView::from_addr(addr)),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            RecordView::Single(_) => RecordType::SingleVersion,
            RecordView::Multi(_) => RecordType::MultiVersion,
            RecordView::Insert(_) => RecordType::LogInsert,
            RecordView::Update(_) => RecordType::LogUpdate,
            RecordView::Delete(_) => RecordType::LogDelete,
        }
    }

    /// Total byte length of the record image (8-aligned for main images).
    pub fn size(&self) -> usize {
        match self {
            RecordView::Single(v) => v.size(),
            RecordView::Multi(v) => v.size(),
            RecordView::Insert(v) | RecordView::Update(v) | RecordView::Delete(v) => v.size(),
        }
    }

    pub fn key(&self) -> u64 {
        match self {
            RecordView::Single(v) => v.key(),
            RecordView::Multi(v) => v.key(),
            RecordView::Insert(v) | RecordView::Update(v) | RecordView::Delete(v) => v.key(),
        }
    }

    /// The atomic newest word. Only head variants carry one.
    pub(crate) fn newest_word(&self) -> Option<&'g AtomicU64> {
        match self {
            RecordView::Single(v) => Some(v.newest_word()),
            RecordView::Multi(v) => Some(v.newest_word()),
            RecordView::Insert(v) => Some(v.previous_word()),
            RecordView::Update(_) | RecordView::Delete(_) => None,
        }
    }

    pub fn load_newest(&self) -> u64 {
        self.newest_word()
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// CAS on the newest word; used by writers to link new versions and
    /// by GC to install forwards.
    pub fn cas_newest(&self, expected: u64, new: u64) -> Result<(), u64> {
        let word = self.newest_word().expect("cas_newest on non-head record");
        word.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }

    /// The head image's own versions, newest first, tombstones as `None`.
    /// Aborted insert heads contribute nothing.
    pub(crate) fn own_versions(&self) -> SmallVec<[(u64, Option<&'g [u8]>); 4]> {
        let mut out = SmallVec::new();
        match self {
            RecordView::Single(v) => out.push((v.version(), Some(v.tuple()))),
            RecordView::Multi(v) => {
                for (i, &version) in v.versions().iter().enumerate() {
                    out.push((version, v.version_data(i)));
                }
            }
            RecordView::Insert(v) => {
                if !v.aborted() {
                    out.push((v.version(), Some(v.tuple())));
                }
            }
            RecordView::Update(_) | RecordView::Delete(_) => {
                unreachable!("own_versions on a non-head record")
            }
        }
        out
    }

    /// Returns the tuple visible to `snapshot`: the highest version in
    /// the snapshot's read set, walking the newest chain first and then
    /// the head image. A forward installed by GC is returned to the
    /// caller for re-resolution.
    pub fn get_version(&self, snapshot: &SnapshotDescriptor, guard: &'g Guard) -> Lookup<'g> {
        let word = self.load_newest();
        match newest::decode(word) {
            newest::Newest::ForwardMain(addr) => return Lookup::Forward(RecordPtr::MainRow(addr)),
            newest::Newest::ForwardColumn(addr) => {
                return Lookup::Forward(RecordPtr::ColumnEntry(addr))
            }
            newest::Newest::Gone => return Lookup::Gone,
            newest::Newest::None | newest::Newest::Log(_) => {}
        }

        let mut latest: Option<u64> = None;
        for entry in ChainIter::from_word(word, guard) {
            if entry.aborted() {
                continue;
            }
            let version = entry.version();
            latest.get_or_insert(version);
            if snapshot.in_read_set(version) {
                let data = if entry.is_tombstone() {
                    None
                } else {
                    Some(TupleData::Borrowed(entry.tuple()))
                };
                return Lookup::Done(Some(VisibleVersion {
                    data,
                    version,
                    is_newest: latest == Some(version),
                }));
            }
        }
        for (version, data) in self.own_versions() {
            latest.get_or_insert(version);
            if snapshot.in_read_set(version) {
                return Lookup::Done(Some(VisibleVersion {
                    data: data.map(TupleData::Borrowed),
                    version,
                    is_newest: latest == Some(version),
                }));
            }
        }
        Lookup::Done(None)
    }

    /// True if GC can improve this record: a chain with at least one
    /// decided entry to inline, an obsolete version below the horizon, or
    /// a dead tombstone. Records whose only pending work involves
    /// undecided transactions are left alone.
    pub fn needs_cleaning(
        &self,
        horizon: &crate::txn::GcHorizon,
        insert_map: &crate::index::InsertMap,
        guard: &'g Guard,
    ) -> bool {
        let word = self.load_newest();
        if ChainIter::from_word(word, guard).any(|e| horizon.decided(e.version())) {
            return true;
        }
        match self {
            RecordView::Multi(v) => {
                let versions = v.versions();
                if versions.iter().skip(1).any(|&v| v < horizon.lowest_active()) {
                    return true;
                }
                // A record reduced to one stale tombstone is dead weight.
                if versions.len() == 1
                    && versions[0] < horizon.lowest_active()
                    && v.version_data(0).is_none()
                {
                    return true;
                }
                insert_map.contains(v.key())
            }
            RecordView::Single(v) => insert_map.contains(v.key()),
            RecordView::Insert(v) => v.aborted() || horizon.decided(v.version()),
            RecordView::Update(_) | RecordView::Delete(_) => false,
        }
    }
}
