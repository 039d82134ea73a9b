//! # Row-Store Main Page
//!
//! A main page in row-major layout: a leading used-length word followed
//! by a packed sequence of record images, each self-describing via its
//! header.
//!
//! ```text
//! | used (8 bytes) | record | record | record | ... | zero tail |
//! ```
//!
//! Iteration starts at byte 8 and advances by each record's `size()`.
//!
//! ## Page GC
//!
//! `gc` runs in two passes. The first walks the records and asks each
//! whether it needs cleaning; a fully clean page is kept as-is. The
//! second copies a compacted image of each record into the current **fill
//! page**, installing a forward pointer on the old head and registering
//! the new location with the hash-table modifier *before* the fill page
//! can be released. When the fill page runs out of space the pass parks
//! its position (`GcPageState::start_offset`) and reports `FillFull`;
//! the driver hands over a fresh fill page and the sweep resumes.
//!
//! After the last main page drains, pending log inserts are pulled into
//! the remaining fill space (`fill_with_inserts`), so fresh keys reach
//! main in the same pass.

use std::collections::HashSet;

use crossbeam_epoch::Guard;
use tracing::trace;

use crate::config::{MAIN_PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{Result, StorageError};
use crate::index::{InsertMap, Modifier};
use crate::memory::PagePtr;
use crate::record::{gather_record, newest, GatherOutcome, RecordPtr, RecordView};
use crate::txn::GcHorizon;

/// Non-owning view of a row-store page.
#[derive(Clone, Copy)]
pub struct RowStorePage(PagePtr);

impl RowStorePage {
    pub fn new(page: PagePtr) -> Self {
        RowStorePage(page)
    }

    pub fn page(&self) -> PagePtr {
        self.0
    }

    pub fn addr(&self) -> usize {
        self.0.addr()
    }

    pub fn used(&self) -> usize {
        unsafe { *(self.addr() as *const u64) as usize }
    }

    /// Record image addresses, in layout order.
    pub fn records<'g>(&self, _guard: &'g Guard) -> RowRecordIter {
        RowRecordIter {
            current: self.addr() + MAIN_PAGE_HEADER_SIZE,
            end: self.addr() + self.used(),
        }
    }

    /// First GC pass: does any record on this page have work?
    pub fn needs_cleaning(
        &self,
        horizon: &GcHorizon,
        insert_map: &InsertMap,
        guard: &Guard,
    ) -> bool {
        self.records(guard).any(|addr| {
            let view = unsafe { RecordView::from_addr(addr, guard) };
            view.needs_cleaning(horizon, insert_map, guard)
        })
    }

    /// Second GC pass: compact every record from `state.start_offset`
    /// into `fill`. Returns `true` when the page is fully processed,
    /// `false` when the fill page filled up (resume with a fresh one).
    #[allow(clippy::too_many_arguments)]
    pub fn gc(
        &self,
        state: &mut GcPageState,
        fill: &mut FillWriter,
        horizon: &GcHorizon,
        modifier: &mut Modifier<'_>,
        table_id: u32,
        blocked: &mut HashSet<usize>,
        guard: &Guard,
    ) -> Result<bool> {
        let end = self.addr() + self.used();
        let mut addr = self.addr() + state.start_offset;
        while addr < end {
            let view = unsafe { RecordView::from_addr(addr, guard) };
            let advance = view.size();
            if !relocate_record(&view, addr, fill, horizon, modifier, table_id, blocked, guard)? {
                state.start_offset = addr - self.addr();
                return Ok(false);
            }
            addr += advance;
        }
        state.start_offset = addr - self.addr();
        Ok(true)
    }
}

/// Per-pass resumption state of one source page. Scoped to a single GC
/// pass; a later pass re-scans the page from the start.
#[derive(Debug)]
pub struct GcPageState {
    pub start_offset: usize,
}

impl Default for GcPageState {
    fn default() -> Self {
        GcPageState {
            start_offset: MAIN_PAGE_HEADER_SIZE,
        }
    }
}

pub struct RowRecordIter {
    current: usize,
    end: usize,
}

impl Iterator for RowRecordIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.current >= self.end {
            return None;
        }
        let addr = self.current;
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let view = unsafe { RecordView::from_addr(addr, guard) };
        self.current += view.size();
        Some(addr)
    }
}

/// Append cursor over one fill page.
pub struct FillWriter {
    page: PagePtr,
    offset: usize,
}

impl FillWriter {
    pub fn new(page: PagePtr) -> Self {
        FillWriter {
            page,
            offset: MAIN_PAGE_HEADER_SIZE,
        }
    }

    pub fn page(&self) -> PagePtr {
        self.page
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        PAGE_SIZE - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == MAIN_PAGE_HEADER_SIZE
    }

    fn dst(&mut self) -> &mut [u8] {
        let addr = self.page.addr() + self.offset;
        unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, self.remaining()) }
    }

    /// Writes the used-length header and releases the page.
    pub fn finish(self) -> PagePtr {
        unsafe { *(self.page.addr() as *mut u64) = self.offset as u64 };
        self.page
    }
}

/// Compacts one head record into the fill page and installs the forward.
/// Returns `false` when the fill page cannot hold the image.
///
/// The forward CAS can lose to a writer linking a new version; the
/// gather is then repeated against the fresh chain, overwriting the
/// image written on the failed attempt (the fill offset only advances
/// on success).
#[allow(clippy::too_many_arguments)]
pub(crate) fn relocate_record(
    view: &RecordView<'_>,
    self_addr: usize,
    fill: &mut FillWriter,
    horizon: &GcHorizon,
    modifier: &mut Modifier<'_>,
    table_id: u32,
    blocked: &mut HashSet<usize>,
    guard: &Guard,
) -> Result<bool> {
    loop {
        match gather_record(view, horizon, guard) {
            GatherOutcome::Skip => return Ok(true),
            GatherOutcome::Dead { observed } => {
                if view.cas_newest(observed, newest::GONE).is_err() {
                    continue;
                }
                // The removal is conditional on the mapping still
                // pointing here; a stale husk never evicts a newer head.
                modifier.remove(table_id, view.key(), RecordPtr::MainRow(self_addr));
                return Ok(true);
            }
            GatherOutcome::Live(record) => {
                if record.image_size() > PAGE_SIZE - MAIN_PAGE_HEADER_SIZE {
                    return Err(StorageError::OutOfMemory(
                        "record image exceeds page capacity",
                    ));
                }
                let new_addr = fill.page.addr() + fill.offset;
                let Some(bytes) = record.write(fill.dst()) else {
                    return Ok(false);
                };
                let forward = newest::encode_forward(RecordPtr::MainRow(new_addr));
                if view.cas_newest(record.observed, forward).is_err() {
                    // A writer linked a new version; re-gather.
                    continue;
                }
                fill.offset += bytes;
                modifier.insert(table_id, record.key, RecordPtr::MainRow(new_addr));
                blocked.extend(record.blocked_pages.iter().copied());
                return Ok(true);
            }
        }
    }
}

/// Drains pending log inserts into the fill page. Returns `true` when
/// the map is empty afterwards, `false` when the fill page filled up.
pub fn fill_with_inserts(
    fill: &mut FillWriter,
    insert_map: &mut InsertMap,
    horizon: &GcHorizon,
    modifier: &mut Modifier<'_>,
    table_id: u32,
    hash: &crate::index::CuckooHash,
    blocked: &mut HashSet<usize>,
    guard: &Guard,
) -> Result<bool> {
    for key in insert_map.keys() {
        // Log truncation is page-granular, so inserts drained by an
        // earlier pass can reappear; the hash already points into main.
        let head = match hash.get(table_id, key, guard).map(RecordPtr::decode) {
            Some(RecordPtr::LogHead(addr)) => addr,
            _ => {
                insert_map.remove(key);
                continue;
            }
        };
        let view = unsafe { RecordView::from_addr(head, guard) };
        debug_assert!(matches!(view, RecordView::Insert(_)));
        match gather_record(&view, horizon, guard) {
            GatherOutcome::Skip => {
                // Undecided insert; stays in the log for a later pass.
                for &entry in insert_map.get(key).unwrap_or(&[]) {
                    blocked.insert(entry & !(PAGE_SIZE - 1));
                }
                blocked.insert(head & !(PAGE_SIZE - 1));
                insert_map.remove(key);
                continue;
            }
            GatherOutcome::Dead { observed } => {
                if view.cas_newest(observed, newest::GONE).is_ok() {
                    modifier.remove(table_id, key, RecordPtr::LogHead(head));
                    insert_map.remove(key);
                }
                continue;
            }
            GatherOutcome::Live(record) => {
                if record.image_size() > PAGE_SIZE - MAIN_PAGE_HEADER_SIZE {
                    // Never fits any fill page; the record stays in the
                    // log and keeps its pages pinned.
                    blocked.insert(head & !(PAGE_SIZE - 1));
                    insert_map.remove(key);
                    continue;
                }
                let new_addr = fill.page.addr() + fill.offset;
                let Some(bytes) = record.write(fill.dst()) else {
                    return Ok(false);
                };
                let forward = newest::encode_forward(RecordPtr::MainRow(new_addr));
                if view.cas_newest(record.observed, forward).is_err() {
                    // Writer raced us; leave the key for the next pass.
                    blocked.insert(head & !(PAGE_SIZE - 1));
                    insert_map.remove(key);
                    continue;
                }
                fill.offset += bytes;
                modifier.insert(table_id, key, RecordPtr::MainRow(new_addr));
                blocked.extend(record.blocked_pages.iter().copied());
                insert_map.remove(key);
            }
        }
    }
    trace!(pending = insert_map.len(), "insert drain finished");
    Ok(insert_map.is_empty())
}
