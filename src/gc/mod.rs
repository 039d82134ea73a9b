//! # Garbage Collection Driver
//!
//! Per-table copying compaction. One pass:
//!
//! 1. Capture the reclamation horizon (watermark + undecided versions)
//!    and the sealed log range, and build the [`InsertMap`] for keys
//!    that still live only in the log.
//! 2. Sweep the main pages. Clean pages survive as-is; dirty pages have
//!    every record compacted into fill pages (row format) or packed
//!    into fresh column pages (column format), with the old head
//!    forwarded and the new location registered in the hash-table
//!    modifier before any fill page is released.
//! 3. Drain the insert map into the remaining fill space, so fresh keys
//!    reach main in the same pass.
//! 4. Install: publish the modifier batch, swap the main page list,
//!    advance the log tail past the absorbed range, and retire the old
//!    pages through the epoch.
//!
//! A pass that cannot allocate a fill page installs the work done so
//! far (forwards already point into the allocated fills, so they must
//! publish) and leaves the rest for the next schedule. The log tail
//! advances only when the absorbed range is airtight: every page fully
//! processed, no entry still unsealed, and no log page still referenced
//! by a retained chain.

use std::collections::HashSet;

use crossbeam_epoch::Guard;
use tracing::{debug, warn};

use crate::config::PAGE_SIZE;
use crate::error::Result;
use crate::index::{CuckooHash, InsertMap, Modifier};
use crate::log::LogPage;
use crate::memory::{pin, PageManager, PagePtr};
use crate::page::column_map::{entry_addr, ColumnEntryRef, ColumnPageBuilder, ColumnPageView};
use crate::page::row_store::{fill_with_inserts, FillWriter, GcPageState, RowStorePage};
use crate::page::MainFormat;
use crate::record::{
    gather_from_parts, gather_record, newest, ChainIter, GatherOutcome, RecordPtr, RecordView,
};
use crate::store::Table;
use crate::txn::{CommitManager, GcHorizon};

/// Outcome summary of one pass over one table.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub pages_compacted: usize,
    pub fill_pages: usize,
    pub log_truncated: bool,
    pub complete: bool,
}

/// Runs one GC pass over `table`. Serialized per table by its gc lock;
/// concurrent readers and writers proceed untouched.
pub fn collect_table(
    page_manager: &PageManager,
    hash: &CuckooHash,
    commit_manager: &CommitManager,
    table: &Table,
) -> Result<GcStats> {
    let _pass = table.gc_lock.lock();
    let guard = pin();
    let horizon = commit_manager.horizon();
    let log_range = table.log.snapshot(&guard);

    // Build the insert map and note in-flight entries; an unsealed entry
    // belongs to a writer still between append and seal, so its page
    // cannot be reclaimed yet.
    let mut insert_map = InsertMap::new();
    let mut saw_unsealed = false;
    for (entry, sealed) in log_range.iter_raw(&guard) {
        if !sealed {
            saw_unsealed = true;
            continue;
        }
        let record = unsafe { RecordView::from_addr(entry.data_addr(), &guard) };
        if let RecordView::Insert(view) = record {
            // Only the head the hash actually points at anchors the
            // record; claim losers (aborted, never linked) fall through
            // and their entries truncate with the range. An aborted head
            // still qualifies: a fresh version may have chained onto it.
            if hash.get(table.id(), view.key(), &guard)
                == Some(RecordPtr::LogHead(entry.data_addr()).encode())
            {
                insert_map.push(view.key(), entry.data_addr());
            }
        }
    }

    let pages = table.main_pages(&guard);
    let dirty: Vec<bool> = pages
        .iter()
        .map(|&page| match table.format() {
            MainFormat::RowMajor => {
                RowStorePage::new(page).needs_cleaning(&horizon, &insert_map, &guard)
            }
            MainFormat::ColumnMajor => {
                column_page_needs_cleaning(page, table, &horizon, &insert_map, &guard)
            }
        })
        .collect();

    if !dirty.iter().any(|&d| d) && insert_map.is_empty() {
        return Ok(GcStats {
            complete: true,
            ..GcStats::default()
        });
    }

    let modifier = hash.modifier();
    let mut blocked: HashSet<usize> = HashSet::new();
    let stats = match table.format() {
        MainFormat::RowMajor => collect_row_table(
            page_manager,
            hash,
            table,
            &pages,
            &dirty,
            &horizon,
            &mut insert_map,
            modifier,
            &mut blocked,
            &guard,
        )?,
        MainFormat::ColumnMajor => collect_column_table(
            page_manager,
            hash,
            table,
            &pages,
            &dirty,
            &horizon,
            &mut insert_map,
            modifier,
            &mut blocked,
            &guard,
        )?,
    };

    // Truncate the absorbed log prefix when nothing in it can still be
    // referenced.
    let mut truncated = false;
    if stats.complete && blocked.is_empty() && !saw_unsealed {
        if let Some(new_tail) = log_range.head_pos() {
            let old_tail = table.log.tail();
            if new_tail != old_tail {
                table.log.set_tail(new_tail);
                let head_page = LogPage::from_addr(new_tail.page());
                let mut addr = head_page.next();
                head_page.clear_next();
                while addr != 0 {
                    let page = LogPage::from_addr(addr);
                    let next = page.next();
                    page_manager.free(unsafe { PagePtr::from_addr(addr) }, &guard);
                    addr = next;
                }
                truncated = true;
            }
        }
    }
    debug!(
        table = table.id(),
        compacted = stats.pages_compacted,
        fills = stats.fill_pages,
        complete = stats.complete,
        truncated,
        "gc pass finished"
    );
    Ok(GcStats {
        log_truncated: truncated,
        ..stats
    })
}

fn column_page_needs_cleaning(
    page: PagePtr,
    table: &Table,
    horizon: &GcHorizon,
    insert_map: &InsertMap,
    guard: &Guard,
) -> bool {
    let view = unsafe { ColumnPageView::from_addr(page.addr(), table.desc(), guard) };
    let valid_from = view.valid_from();
    let valid_to = view.valid_to();
    for (key, first_row) in view.record_heads() {
        let word = view
            .newest_word(first_row)
            .load(std::sync::atomic::Ordering::Acquire);
        if ChainIter::from_word(word, guard).any(|e| horizon.decided(e.version())) {
            return true;
        }
        let rows = view.record_rows(first_row);
        if rows
            .clone()
            .skip(1)
            .any(|row| valid_from[row] < horizon.lowest_active())
        {
            return true;
        }
        let first = rows.start;
        if rows.len() == 1
            && valid_from[first] == valid_to[first]
            && valid_from[first] < horizon.lowest_active()
        {
            return true;
        }
        if insert_map.contains(key) {
            return true;
        }
    }
    false
}

#[allow(clippy::too_many_arguments)]
fn collect_row_table(
    page_manager: &PageManager,
    hash: &CuckooHash,
    table: &Table,
    pages: &[PagePtr],
    dirty: &[bool],
    horizon: &GcHorizon,
    insert_map: &mut InsertMap,
    mut modifier: Modifier<'_>,
    blocked: &mut HashSet<usize>,
    guard: &Guard,
) -> Result<GcStats> {
    let mut new_main: Vec<PagePtr> = Vec::new();
    let mut retired: Vec<PagePtr> = Vec::new();
    let mut fills: Vec<PagePtr> = Vec::new();
    let mut fill: Option<FillWriter> = None;
    let mut complete = true;
    let mut compacted = 0usize;

    'pages: for (idx, &page) in pages.iter().enumerate() {
        if !complete || !dirty[idx] {
            // Unprocessed or clean pages survive in place.
            new_main.push(page);
            continue;
        }
        let source = RowStorePage::new(page);
        let mut state = GcPageState::default();
        loop {
            if fill.is_none() {
                match page_manager.alloc() {
                    Ok(p) => fill = Some(FillWriter::new(p)),
                    Err(err) => {
                        warn!(table = table.id(), %err, "gc pass abandoned: no fill page");
                        complete = false;
                        new_main.push(page);
                        continue 'pages;
                    }
                }
            }
            let writer = fill.as_mut().unwrap();
            match source.gc(
                &mut state,
                writer,
                horizon,
                &mut modifier,
                table.id(),
                blocked,
                guard,
            ) {
                Ok(true) => {
                    retired.push(page);
                    compacted += 1;
                    break;
                }
                Ok(false) => {
                    fills.push(fill.take().unwrap().finish());
                }
                Err(err) => {
                    warn!(table = table.id(), %err, "row page gc failed; page retained");
                    complete = false;
                    new_main.push(page);
                    break;
                }
            }
        }
    }

    if complete && !insert_map.is_empty() {
        loop {
            if fill.is_none() {
                match page_manager.alloc() {
                    Ok(p) => fill = Some(FillWriter::new(p)),
                    Err(err) => {
                        warn!(table = table.id(), %err, "insert drain abandoned: no fill page");
                        complete = false;
                        break;
                    }
                }
            }
            let writer = fill.as_mut().unwrap();
            let drained = fill_with_inserts(
                writer,
                insert_map,
                horizon,
                &mut modifier,
                table.id(),
                hash,
                blocked,
                guard,
            )?;
            if drained {
                break;
            }
            fills.push(fill.take().unwrap().finish());
        }
    } else if !insert_map.is_empty() {
        complete = false;
    }

    if let Some(writer) = fill.take() {
        if writer.is_empty() {
            page_manager.free_unpublished(writer.page());
        } else {
            fills.push(writer.finish());
        }
    }
    let fill_count = fills.len();
    new_main.extend(fills.iter().copied());

    install(table, modifier, new_main, retired, page_manager, guard);
    Ok(GcStats {
        pages_compacted: compacted,
        fill_pages: fill_count,
        log_truncated: false,
        complete,
    })
}

/// A record packed into a pending column page, awaiting its forward
/// installation at flush time.
struct PendingInstall {
    key: u64,
    first_row: usize,
    row_count: usize,
    observed: u64,
    source: PendingSource,
    blocked_pages: Vec<usize>,
}

enum PendingSource {
    Column(ColumnEntryRef),
    Log(usize),
}

/// Writes the builder into a fresh page and installs a forward for each
/// packed record. Records whose CAS lost to a concurrent writer get
/// their copied rows killed; the caller must retain their source.
#[allow(clippy::too_many_arguments)]
fn flush_column_page<'d>(
    page_manager: &PageManager,
    table: &'d Table,
    builder: &mut ColumnPageBuilder<'d>,
    pending: &mut Vec<PendingInstall>,
    flushed: &mut Vec<PagePtr>,
    modifier: &mut Modifier<'_>,
    blocked: &mut HashSet<usize>,
    must_retain: &mut HashSet<usize>,
    guard: &Guard,
) -> Result<()> {
    if builder.is_empty() {
        pending.clear();
        return Ok(());
    }
    let page = page_manager.alloc()?;
    let taken = std::mem::replace(builder, ColumnPageBuilder::new(table.desc()));
    taken.flush(page);
    for install in pending.drain(..) {
        let new_addr = entry_addr(page.addr(), install.first_row);
        let forward = newest::encode_forward(RecordPtr::ColumnEntry(new_addr));
        let cas = match &install.source {
            PendingSource::Column(entry) => {
                entry.cas_newest(table.desc(), install.observed, forward, guard)
            }
            PendingSource::Log(addr) => {
                let view = unsafe { RecordView::from_addr(*addr, guard) };
                view.cas_newest(install.observed, forward)
            }
        };
        match cas {
            Ok(()) => {
                modifier.insert(table.id(), install.key, RecordPtr::ColumnEntry(new_addr));
                blocked.extend(install.blocked_pages.iter().copied());
            }
            Err(_) => {
                kill_rows(page, table.desc(), install.first_row, install.row_count, guard);
                match &install.source {
                    PendingSource::Column(entry) => {
                        must_retain.insert(entry.page);
                    }
                    PendingSource::Log(addr) => {
                        let log_page = addr & !(PAGE_SIZE - 1);
                        must_retain.insert(log_page);
                        blocked.insert(log_page);
                    }
                }
            }
        }
    }
    flushed.push(page);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn collect_column_table(
    page_manager: &PageManager,
    hash: &CuckooHash,
    table: &Table,
    pages: &[PagePtr],
    dirty: &[bool],
    horizon: &GcHorizon,
    insert_map: &mut InsertMap,
    mut modifier: Modifier<'_>,
    blocked: &mut HashSet<usize>,
    guard: &Guard,
) -> Result<GcStats> {
    let mut new_main: Vec<PagePtr> = Vec::new();
    let mut retired: Vec<PagePtr> = Vec::new();
    let mut flushed: Vec<PagePtr> = Vec::new();
    let mut must_retain: HashSet<usize> = HashSet::new();
    let mut builder = ColumnPageBuilder::new(table.desc());
    let mut pending: Vec<PendingInstall> = Vec::new();
    let mut complete = true;
    let mut compacted = 0usize;

    for (idx, &page) in pages.iter().enumerate() {
        if !complete || !dirty[idx] {
            new_main.push(page);
            continue;
        }
        let view = unsafe { ColumnPageView::from_addr(page.addr(), table.desc(), guard) };
        let mut page_ok = true;
        'records: for (key, first_row) in view.record_heads() {
            let entry_ref = ColumnEntryRef {
                page: page.addr(),
                first_row,
            };
            loop {
                let observed = entry_ref.load_newest(table.desc(), guard);
                match newest::decode(observed) {
                    newest::Newest::ForwardMain(_)
                    | newest::Newest::ForwardColumn(_)
                    | newest::Newest::Gone => break,
                    _ => {}
                }
                let own = entry_ref.own_versions(table.desc(), guard);
                let own_slices: Vec<(u64, Option<&[u8]>)> =
                    own.iter().map(|(v, d)| (*v, d.as_deref())).collect();
                match gather_from_parts(key, observed, &own_slices, horizon, guard) {
                    GatherOutcome::Dead { observed } => {
                        if entry_ref
                            .cas_newest(table.desc(), observed, newest::GONE, guard)
                            .is_err()
                        {
                            continue;
                        }
                        // Conditional on the mapping still pointing at
                        // this entry: a stale husk (rows killed after a
                        // lost flush CAS) never evicts the live head.
                        modifier.remove(
                            table.id(),
                            key,
                            RecordPtr::ColumnEntry(entry_ref.addr()),
                        );
                        break;
                    }
                    GatherOutcome::Skip => break,
                    GatherOutcome::Live(record) => {
                        match builder.try_add_record(key, &record.versions, record.kept_chain) {
                            Some(new_first) => {
                                pending.push(PendingInstall {
                                    key,
                                    first_row: new_first,
                                    row_count: record.versions.len(),
                                    observed: record.observed,
                                    source: PendingSource::Column(entry_ref),
                                    blocked_pages: record.blocked_pages.to_vec(),
                                });
                                break;
                            }
                            None => {
                                if builder.is_empty() {
                                    // A single record larger than a page:
                                    // leave it (and its chain) in place.
                                    warn!(table = table.id(), key, "record exceeds column page");
                                    must_retain.insert(page.addr());
                                    complete = false;
                                    break;
                                }
                                if let Err(err) = flush_column_page(
                                    page_manager,
                                    table,
                                    &mut builder,
                                    &mut pending,
                                    &mut flushed,
                                    &mut modifier,
                                    blocked,
                                    &mut must_retain,
                                    guard,
                                ) {
                                    warn!(table = table.id(), %err, "gc pass abandoned");
                                    complete = false;
                                    page_ok = false;
                                    break 'records;
                                }
                            }
                        }
                    }
                };
            }
        }
        // Flush at the page boundary so retirement of this source only
        // happens once all its forwards are installed.
        if page_ok
            && flush_column_page(
                page_manager,
                table,
                &mut builder,
                &mut pending,
                &mut flushed,
                &mut modifier,
                blocked,
                &mut must_retain,
                guard,
            )
            .is_err()
        {
            complete = false;
            page_ok = false;
        }
        if !page_ok || must_retain.contains(&page.addr()) {
            new_main.push(page);
        } else {
            retired.push(page);
            compacted += 1;
        }
    }

    // Drain pending log inserts into fresh column pages.
    if complete {
        'drain: for key in insert_map.keys() {
            let head = match hash.get(table.id(), key, guard).map(RecordPtr::decode) {
                Some(RecordPtr::LogHead(addr)) => addr,
                _ => {
                    insert_map.remove(key);
                    continue;
                }
            };
            let view = unsafe { RecordView::from_addr(head, guard) };
            match gather_record(&view, horizon, guard) {
                GatherOutcome::Skip => {
                    blocked.insert(head & !(PAGE_SIZE - 1));
                    insert_map.remove(key);
                }
                GatherOutcome::Dead { observed } => {
                    if view.cas_newest(observed, newest::GONE).is_ok() {
                        modifier.remove(table.id(), key, RecordPtr::LogHead(head));
                        insert_map.remove(key);
                    }
                }
                GatherOutcome::Live(record) => loop {
                    match builder.try_add_record(key, &record.versions, record.kept_chain) {
                        Some(new_first) => {
                            pending.push(PendingInstall {
                                key,
                                first_row: new_first,
                                row_count: record.versions.len(),
                                observed: record.observed,
                                source: PendingSource::Log(head),
                                blocked_pages: record.blocked_pages.to_vec(),
                            });
                            insert_map.remove(key);
                            break;
                        }
                        None => {
                            if builder.is_empty() {
                                warn!(table = table.id(), key, "insert exceeds column page");
                                blocked.insert(head & !(PAGE_SIZE - 1));
                                insert_map.remove(key);
                                break;
                            }
                            if let Err(err) = flush_column_page(
                                page_manager,
                                table,
                                &mut builder,
                                &mut pending,
                                &mut flushed,
                                &mut modifier,
                                blocked,
                                &mut must_retain,
                                guard,
                            ) {
                                warn!(table = table.id(), %err, "insert drain abandoned");
                                complete = false;
                                break 'drain;
                            }
                        }
                    }
                },
            }
        }
    } else if !insert_map.is_empty() {
        complete = false;
    }

    if flush_column_page(
        page_manager,
        table,
        &mut builder,
        &mut pending,
        &mut flushed,
        &mut modifier,
        blocked,
        &mut must_retain,
        guard,
    )
    .is_err()
    {
        complete = false;
    }

    let fill_count = flushed.len();
    new_main.extend(flushed.iter().copied());
    install(table, modifier, new_main, retired, page_manager, guard);
    Ok(GcStats {
        pages_compacted: compacted,
        fill_pages: fill_count,
        log_truncated: false,
        complete,
    })
}

/// Kills rows of a not-yet-published column page after a lost CAS: a
/// zero interval is invisible to every snapshot.
fn kill_rows(
    page: PagePtr,
    desc: &crate::tuple::TupleDesc,
    first_row: usize,
    count: usize,
    guard: &Guard,
) {
    let view = unsafe { ColumnPageView::from_addr(page.addr(), desc, guard) };
    let from = view.valid_from().as_ptr() as *mut u64;
    let to = view.valid_to().as_ptr() as *mut u64;
    for row in first_row..first_row + count {
        unsafe {
            *from.add(row) = 0;
            *to.add(row) = 0;
        }
        // The copied chain head must die with the rows, or a scan of
        // this page would re-emit the chain alongside the live source.
        view.newest_word(row)
            .store(0, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Publication order: hash first (readers holding old heads follow
/// forwards meanwhile), then the page list, then retire sources.
fn install(
    table: &Table,
    modifier: Modifier<'_>,
    new_main: Vec<PagePtr>,
    retired: Vec<PagePtr>,
    page_manager: &PageManager,
    guard: &Guard,
) {
    modifier.publish(guard);
    table.swap_main(new_main, guard);
    for page in retired {
        page_manager.free(page, guard);
    }
}
