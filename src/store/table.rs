//! One table: schema, its log, its main page list, and the versioned
//! write protocols on top of the shared hash table.
//!
//! ## Write protocol
//!
//! Every write appends a log record carrying the writer's own version,
//! then publishes it:
//!
//! - **insert** claims the key's hash slot with a CAS; if the key
//!   already has a head, the write degrades to a chain link (allowed
//!   over tombstones and dead heads, a duplicate otherwise).
//! - **update / remove** link the new record in front of the head by
//!   CAS on the newest pointer. First-committer-wins: losing the CAS to
//!   another writer is a `WriteConflict`; losing it to a GC forward just
//!   re-resolves and retries.
//!
//! Entries seal immediately after linking. Visibility is controlled by
//! snapshots (the writer's version stays in other transactions' inflight
//! sets until it finishes), and aborts flag the records dead in place.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned};
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::index::{CuckooHash, InsertOutcome};
use crate::log::Log;
use crate::memory::{PageManager, PagePtr};
use crate::page::{ColumnEntryRef, MainFormat};
use crate::record::{
    log_record_size, newest, write_log_record, ChainIter, LogRecordView, RecordPtr, RecordType,
    RecordView,
};
use crate::scan::{self, ScanContext, ScanRequest, ScanResult};
use crate::tuple::{encode_tuple_vec, Schema, TupleDesc, Value};
use crate::txn::SnapshotDescriptor;

pub struct Table {
    id: u32,
    name: String,
    desc: TupleDesc,
    format: MainFormat,
    pub(crate) log: Log,
    main: Atomic<Vec<PagePtr>>,
    pub(crate) gc_lock: Mutex<()>,
}

/// A record read copied out of the engine.
#[derive(Debug, Clone)]
pub struct GetResult {
    pub tuple: Vec<u8>,
    pub version: u64,
    pub is_newest: bool,
}

/// Where a record head lives right now; the CAS point for writers.
enum HeadHandle<'g> {
    Bytes(RecordView<'g>),
    Column(ColumnEntryRef),
}

impl<'g> HeadHandle<'g> {
    fn load_newest(&self, desc: &TupleDesc, guard: &'g Guard) -> u64 {
        match self {
            HeadHandle::Bytes(view) => view.load_newest(),
            HeadHandle::Column(entry) => entry.load_newest(desc, guard),
        }
    }

    fn cas_newest(
        &self,
        desc: &TupleDesc,
        expected: u64,
        new: u64,
        guard: &Guard,
    ) -> std::result::Result<(), u64> {
        match self {
            HeadHandle::Bytes(view) => view.cas_newest(expected, new),
            HeadHandle::Column(entry) => entry.cas_newest(desc, expected, new, guard),
        }
    }

    /// Newest non-aborted version and whether it is a tombstone, given
    /// the observed newest word.
    fn top_version(&self, word: u64, desc: &TupleDesc, guard: &'g Guard) -> Option<(u64, bool)> {
        for entry in ChainIter::from_word(word, guard) {
            if !entry.aborted() {
                return Some((entry.version(), entry.is_tombstone()));
            }
        }
        match self {
            HeadHandle::Bytes(RecordView::Single(v)) => Some((v.version(), false)),
            HeadHandle::Bytes(RecordView::Multi(v)) => {
                Some((v.versions()[0], v.version_data(0).is_none()))
            }
            HeadHandle::Bytes(RecordView::Insert(v)) => {
                (!v.aborted()).then(|| (v.version(), false))
            }
            HeadHandle::Bytes(_) => unreachable!("chain records are never heads"),
            HeadHandle::Column(entry) => {
                let view = unsafe {
                    crate::page::ColumnPageView::from_addr(entry.page, desc, guard)
                };
                let row = entry.first_row;
                Some((
                    view.valid_from()[row],
                    view.valid_from()[row] == view.valid_to()[row],
                ))
            }
        }
    }
}

enum LinkOutcome {
    Linked,
    /// The hash value itself moved; redo the hash-level operation.
    RetryHash,
}

impl Table {
    pub(crate) fn new(
        id: u32,
        name: String,
        schema: Schema,
        format: MainFormat,
        page_manager: PageManager,
    ) -> Result<Table> {
        Ok(Table {
            id,
            name,
            desc: TupleDesc::new(schema),
            format,
            log: Log::new(page_manager)?,
            main: Atomic::new(Vec::new()),
            gc_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn format(&self) -> MainFormat {
        self.format
    }

    /// Number of installed main pages (clean + fill), for monitoring.
    pub fn main_page_count(&self) -> usize {
        let guard = crossbeam_epoch::pin();
        self.main_pages(&guard).len()
    }

    pub(crate) fn main_pages(&self, guard: &Guard) -> Vec<PagePtr> {
        unsafe {
            self.main
                .load(Ordering::Acquire, guard)
                .as_ref()
                .cloned()
                .unwrap_or_default()
        }
    }

    pub(crate) fn swap_main(&self, new: Vec<PagePtr>, guard: &Guard) {
        let old = self.main.swap(Owned::new(new), Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }

    fn abort_entry(entry: crate::log::LogEntry) {
        let view = unsafe { LogRecordView::from_addr(entry.data_addr()) };
        view.set_aborted();
        entry.seal();
    }

    /// Resolves the head handle for a hash word, chasing GC forwards.
    /// Returns the handle plus its observed newest word; `None` when
    /// the record is gone.
    fn resolve_head<'g>(&self, word: u64, guard: &'g Guard) -> Option<(HeadHandle<'g>, u64)> {
        let mut ptr = RecordPtr::decode(word);
        loop {
            let handle = match ptr {
                RecordPtr::MainRow(addr) | RecordPtr::LogHead(addr) => {
                    HeadHandle::Bytes(unsafe { RecordView::from_addr(addr, guard) })
                }
                RecordPtr::ColumnEntry(addr) => HeadHandle::Column(ColumnEntryRef::from_addr(addr)),
            };
            let observed = handle.load_newest(&self.desc, guard);
            match newest::decode(observed) {
                newest::Newest::ForwardMain(addr) => ptr = RecordPtr::MainRow(addr),
                newest::Newest::ForwardColumn(addr) => ptr = RecordPtr::ColumnEntry(addr),
                newest::Newest::Gone => return None,
                newest::Newest::None | newest::Newest::Log(_) => return Some((handle, observed)),
            }
        }
    }

    pub(crate) fn insert(
        &self,
        key: u64,
        values: &[Value<'_>],
        fail_on_exists: bool,
        hash: &CuckooHash,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Result<usize> {
        let tuple = encode_tuple_vec(&self.desc, values)?;
        let entry = self
            .log
            .append(log_record_size(tuple.len()) as u32, guard)?;
        write_log_record(
            unsafe { entry.data_mut() },
            RecordType::LogInsert,
            key,
            snapshot.own_version(),
            0,
            &tuple,
        );
        let ptr = RecordPtr::LogHead(entry.data_addr()).encode();

        loop {
            match hash.insert(self.id, key, ptr, guard) {
                InsertOutcome::Inserted => {
                    entry.seal();
                    return Ok(entry.data_addr());
                }
                InsertOutcome::Full => {
                    Self::abort_entry(entry);
                    return Err(StorageError::OutOfMemory("hash table full"));
                }
                InsertOutcome::Exists(word) => {
                    match self.link_over_existing(
                        word,
                        key,
                        entry,
                        ptr,
                        fail_on_exists,
                        hash,
                        snapshot,
                        guard,
                    )? {
                        LinkOutcome::Linked => return Ok(entry.data_addr()),
                        LinkOutcome::RetryHash => continue,
                    }
                }
            }
        }
    }

    /// Insert found an existing head. Over a live record this is a
    /// duplicate (or an upsert when `fail_on_exists` is off); over a
    /// tombstoned or fully-aborted record the fresh version links onto
    /// the existing chain.
    #[allow(clippy::too_many_arguments)]
    fn link_over_existing(
        &self,
        hash_word: u64,
        key: u64,
        entry: crate::log::LogEntry,
        our_ptr: u64,
        fail_on_exists: bool,
        hash: &CuckooHash,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Result<LinkOutcome> {
        loop {
            let Some((handle, observed)) = self.resolve_head(hash_word, guard) else {
                // Record reclaimed; swing the hash value to our fresh
                // insert so the key comes back to life.
                match hash.update(self.id, key, hash_word, our_ptr, guard) {
                    Ok(()) => {
                        entry.seal();
                        return Ok(LinkOutcome::Linked);
                    }
                    Err(_) => return Ok(LinkOutcome::RetryHash),
                }
            };
            match handle.top_version(observed, &self.desc, guard) {
                Some((top, is_tombstone)) => {
                    if !snapshot.in_read_set(top) {
                        Self::abort_entry(entry);
                        return Err(StorageError::WriteConflict { key });
                    }
                    if !is_tombstone && fail_on_exists {
                        Self::abort_entry(entry);
                        return Err(StorageError::DuplicateKey { key });
                    }
                }
                None => {
                    // Every version aborted; the head is a husk we chain
                    // a fresh version onto.
                }
            }
            // The record image stays a chain link: rewrite the pending
            // entry as an update carrying the observed chain.
            let data = unsafe { entry.data_mut() };
            data[0] = RecordType::LogUpdate as u8;
            let previous = match newest::decode(observed) {
                newest::Newest::Log(addr) => addr as u64,
                _ => 0,
            };
            data[24..32].copy_from_slice(&previous.to_le_bytes());
            match handle.cas_newest(&self.desc, observed, entry.data_addr() as u64, guard) {
                Ok(()) => {
                    entry.seal();
                    return Ok(LinkOutcome::Linked);
                }
                Err(actual) => match newest::decode(actual) {
                    // GC moved the record under us; chase and retry.
                    newest::Newest::ForwardMain(_)
                    | newest::Newest::ForwardColumn(_)
                    | newest::Newest::Gone => continue,
                    _ => {
                        Self::abort_entry(entry);
                        return Err(StorageError::WriteConflict { key });
                    }
                },
            }
        }
    }

    pub(crate) fn update(
        &self,
        key: u64,
        values: &[Value<'_>],
        hash: &CuckooHash,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Result<usize> {
        let tuple = encode_tuple_vec(&self.desc, values)?;
        self.link_version(key, RecordType::LogUpdate, &tuple, hash, snapshot, guard)
    }

    pub(crate) fn remove(
        &self,
        key: u64,
        hash: &CuckooHash,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Result<usize> {
        self.link_version(key, RecordType::LogDelete, &[], hash, snapshot, guard)
    }

    /// Shared update/delete path: append, link in front of the head,
    /// seal. The new version's `previous` points at the old chain.
    fn link_version(
        &self,
        key: u64,
        record_type: RecordType,
        tuple: &[u8],
        hash: &CuckooHash,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Result<usize> {
        let word = hash
            .get(self.id, key, guard)
            .ok_or(StorageError::NotFound { key })?;
        let entry = self
            .log
            .append(log_record_size(tuple.len()) as u32, guard)?;
        write_log_record(
            unsafe { entry.data_mut() },
            record_type,
            key,
            snapshot.own_version(),
            0,
            tuple,
        );

        loop {
            let Some((handle, observed)) = self.resolve_head(word, guard) else {
                Self::abort_entry(entry);
                return Err(StorageError::NotFound { key });
            };
            let Some((top, is_tombstone)) = handle.top_version(observed, &self.desc, guard) else {
                Self::abort_entry(entry);
                return Err(StorageError::NotFound { key });
            };
            if !snapshot.in_read_set(top) {
                Self::abort_entry(entry);
                return Err(StorageError::WriteConflict { key });
            }
            if is_tombstone {
                Self::abort_entry(entry);
                return Err(StorageError::NotFound { key });
            }
            let previous = match newest::decode(observed) {
                newest::Newest::Log(addr) => addr as u64,
                _ => 0,
            };
            (unsafe { entry.data_mut() })[24..32].copy_from_slice(&previous.to_le_bytes());
            match handle.cas_newest(&self.desc, observed, entry.data_addr() as u64, guard) {
                Ok(()) => {
                    entry.seal();
                    return Ok(entry.data_addr());
                }
                Err(actual) => match newest::decode(actual) {
                    newest::Newest::ForwardMain(_)
                    | newest::Newest::ForwardColumn(_)
                    | newest::Newest::Gone => continue,
                    _ => {
                        Self::abort_entry(entry);
                        return Err(StorageError::WriteConflict { key });
                    }
                },
            }
        }
    }

    pub(crate) fn get(
        &self,
        key: u64,
        hash: &CuckooHash,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Option<GetResult> {
        let word = hash.get(self.id, key, guard)?;
        let visible =
            scan::resolve_version(RecordPtr::decode(word), &self.desc, snapshot, guard)?;
        visible.data.map(|data| GetResult {
            tuple: data.into_vec(),
            version: visible.version,
            is_newest: visible.is_newest,
        })
    }

    pub(crate) fn scan(
        &self,
        request: &ScanRequest,
        snapshot: &SnapshotDescriptor,
        guard: &Guard,
    ) -> Result<ScanResult> {
        // Log before main: a truncation racing this capture implies the
        // corresponding main swap is already visible, so absorbed keys
        // are covered by whichever side the capture sees.
        let log = self.log.snapshot(guard);
        let pages = self.main_pages(guard);
        let ctx = ScanContext {
            table_id: self.id,
            desc: &self.desc,
            format: self.format,
            pages,
            log,
        };
        scan::execute(&ctx, request, snapshot)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        let guard = crossbeam_epoch::pin();
        let old = self.main.swap(crossbeam_epoch::Shared::null(), Ordering::AcqRel, &guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }
}
