//! # Parallel Scan Processor
//!
//! A scan is instantiated over a snapshot of the table's main page list
//! plus the log range captured at start; later writes are invisible.
//! The page range is split across `N` processors; the shared log tail
//! is processed once, partitioned by key hash mod `N` so no key is
//! emitted twice.
//!
//! ## Per-processor work
//!
//! 1. **Column pages**: build a scratch `valid_to` array that encodes
//!    exact per-snapshot visibility: per record, the one row this
//!    snapshot resolves to is opened, everything else stays masked. A
//!    chain version that covers the snapshot supersedes the rows and is
//!    evaluated through the row path; a relocated (forwarded) record is
//!    served through the forward instead. Then run the column-scan
//!    kernel to produce a match bitmap and materialize matches (tuples,
//!    projection, or aggregate update).
//! 2. **Row pages**: resolve each record against the snapshot and
//!    evaluate the row kernel over the visible tuple.
//! 3. **Log tail**: `LogInsert` heads in this processor's key partition
//!    whose record has not been absorbed into main are resolved and
//!    evaluated the same way.
//!
//! ## Aggregation
//!
//! Each processor owns private accumulator slots; the slots merge after
//! every worker returns `Ok`. A failing worker fails the whole scan;
//! partial aggregates never escape.
//!
//! ## Cancellation
//!
//! Cooperative: processors check the scan's cancel flag between pages
//! and finish the current batch before returning `Cancelled`.

pub mod kernel;
pub mod query;

pub use kernel::{AggFn, AggSpec, AggState, BitMask, ColumnScanKernel, InterpretedScan};
pub use query::{CmpOp, Conjunct, PredValue, Predicate, ScanQuery, ScanQueryBuilder};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_epoch::Guard;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::SCAN_DEFAULT_THREADS;
use crate::error::{Result, StorageError};
use crate::log::LogRange;
use crate::memory::{pin, PagePtr};
use crate::page::{ColumnPageView, MainFormat, RowStorePage};
use crate::record::{
    newest, ChainIter, Lookup, RecordPtr, RecordView, TupleData, VisibleVersion,
};
use crate::tuple::{encode_tuple_vec, Field, OwnedValue, Schema, TupleDesc, TupleView, Value};
use crate::txn::SnapshotDescriptor;

/// What a matching row turns into.
#[derive(Debug, Clone)]
pub enum ScanProjection {
    /// Full tuples.
    All,
    /// Packed tuples of the selected fields.
    Fields(Vec<usize>),
    /// Aggregates over the selected specs; no rows are produced.
    Aggregate(Vec<AggSpec>),
}

#[derive(Clone)]
pub struct ScanRequest {
    pub query: ScanQuery,
    pub projection: ScanProjection,
    pub threads: usize,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ScanRequest {
    pub fn new(query: ScanQuery) -> Self {
        ScanRequest {
            query,
            projection: ScanProjection::All,
            threads: SCAN_DEFAULT_THREADS,
            cancel: None,
        }
    }

    pub fn with_projection(mut self, fields: Vec<usize>) -> Self {
        self.projection = ScanProjection::Fields(fields);
        self
    }

    pub fn with_aggregates(mut self, specs: Vec<AggSpec>) -> Self {
        self.projection = ScanProjection::Aggregate(specs);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// Materialized scan output.
pub struct ScanResult {
    /// Tuple images in the output schema (empty for aggregations).
    pub rows: Vec<Vec<u8>>,
    /// One value per aggregate spec (empty otherwise).
    pub aggregates: Vec<OwnedValue>,
    /// Schema of `rows`.
    pub output_desc: TupleDesc,
}

impl ScanResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn tuples(&self) -> impl Iterator<Item = TupleView<'_>> {
        self.rows
            .iter()
            .map(move |row| TupleView::new(row, &self.output_desc))
    }
}

/// Everything a scan captures at start. The epoch guard held by the
/// caller keeps every captured page alive for the scan's duration.
pub(crate) struct ScanContext<'a> {
    pub table_id: u32,
    pub desc: &'a TupleDesc,
    pub format: MainFormat,
    pub pages: Vec<PagePtr>,
    pub log: LogRange,
}

fn output_desc(desc: &TupleDesc, projection: &ScanProjection) -> Result<TupleDesc> {
    match projection {
        ScanProjection::All | ScanProjection::Aggregate(_) => Ok(desc.clone()),
        ScanProjection::Fields(fields) => {
            let mut selected = Vec::with_capacity(fields.len());
            for &id in fields {
                let field = desc.field(id).ok_or_else(|| {
                    StorageError::InvalidArgument(format!("projection references field {id}"))
                })?;
                selected.push(Field {
                    name: field.name.clone(),
                    field_type: field.field_type,
                    nullable: field.nullable,
                })
            }
            Ok(TupleDesc::new(Schema::new(selected)?))
        }
    }
}

/// Deterministic log partitioning: the same key maps to the same
/// processor on every (re)run with the same worker count.
fn log_partition(key: u64, workers: usize) -> usize {
    (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 33) as usize % workers
}

struct ProcessorOutput {
    rows: Vec<Vec<u8>>,
    aggs: Vec<AggState>,
}

struct Processor<'a> {
    ctx: &'a ScanContext<'a>,
    request: &'a ScanRequest,
    snapshot: &'a SnapshotDescriptor,
    out_desc: &'a TupleDesc,
    index: usize,
    workers: usize,
}

impl<'a> Processor<'a> {
    fn check_cancel(&self) -> Result<()> {
        if let Some(flag) = &self.request.cancel {
            if flag.load(Ordering::Acquire) {
                return Err(StorageError::Cancelled);
            }
        }
        Ok(())
    }

    fn agg_states(&self) -> Vec<AggState> {
        match &self.request.projection {
            ScanProjection::Aggregate(specs) => specs
                .iter()
                .map(|spec| {
                    let ty = self
                        .ctx
                        .desc
                        .field(spec.field_id)
                        .expect("aggregate field validated at request build")
                        .field_type;
                    AggState::new(spec, ty)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn run(&self, guard: &Guard) -> Result<ProcessorOutput> {
        let mut output = ProcessorOutput {
            rows: Vec::new(),
            aggs: self.agg_states(),
        };
        let captured: std::collections::HashSet<usize> =
            self.ctx.pages.iter().map(|p| p.addr()).collect();

        // Contiguous page range for this processor.
        let total = self.ctx.pages.len();
        let chunk = total.div_ceil(self.workers).max(1);
        let start = (self.index * chunk).min(total);
        let end = ((self.index + 1) * chunk).min(total);
        for &page in &self.ctx.pages[start..end] {
            self.check_cancel()?;
            match self.ctx.format {
                MainFormat::RowMajor => {
                    self.process_row_page(page, &captured, &mut output, guard)?
                }
                MainFormat::ColumnMajor => {
                    self.process_column_page(page, &captured, &mut output, guard)?
                }
            }
        }

        self.check_cancel()?;
        self.process_log_tail(&captured, &mut output, guard)?;
        Ok(output)
    }

    /// True when a record's forward points at a page this scan already
    /// covers, so the covering page pass is the single emitter.
    fn forward_covered(word: u64, captured: &std::collections::HashSet<usize>) -> Option<bool> {
        match newest::decode(word) {
            newest::Newest::Gone => Some(true),
            newest::Newest::ForwardMain(addr) | newest::Newest::ForwardColumn(addr) => {
                Some(captured.contains(&(addr & !(crate::config::PAGE_SIZE - 1))))
            }
            newest::Newest::None | newest::Newest::Log(_) => None,
        }
    }

    fn emit_values(&self, values: &[Value<'_>], output: &mut ProcessorOutput) -> Result<()> {
        match &self.request.projection {
            ScanProjection::All => {
                output.rows.push(encode_tuple_vec(self.out_desc, values)?);
            }
            ScanProjection::Fields(fields) => {
                let projected: Vec<Value<'_>> =
                    fields.iter().map(|&id| values[id]).collect();
                output.rows.push(encode_tuple_vec(self.out_desc, &projected)?);
            }
            ScanProjection::Aggregate(specs) => {
                for (state, spec) in output.aggs.iter_mut().zip(specs) {
                    state.update(&values[spec.field_id]);
                }
            }
        }
        Ok(())
    }

    /// Row-path evaluation of one materialized tuple.
    fn emit_tuple(&self, tuple: &[u8], output: &mut ProcessorOutput) -> Result<()> {
        let view = TupleView::new(tuple, self.ctx.desc);
        if !self.request.query.matches_tuple(&view) {
            return Ok(());
        }
        let values = view.values()?;
        self.emit_values(&values, output)
    }

    fn resolve_and_emit(
        &self,
        ptr: RecordPtr,
        output: &mut ProcessorOutput,
        guard: &Guard,
    ) -> Result<()> {
        if let Some(visible) = resolve_version(ptr, self.ctx.desc, self.snapshot, guard) {
            if let Some(data) = visible.data {
                self.emit_tuple(data.as_slice(), output)?;
            }
        }
        Ok(())
    }

    fn process_row_page(
        &self,
        page: PagePtr,
        captured: &std::collections::HashSet<usize>,
        output: &mut ProcessorOutput,
        guard: &Guard,
    ) -> Result<()> {
        let page = RowStorePage::new(page);
        for addr in page.records(guard) {
            let view = unsafe { RecordView::from_addr(addr, guard) };
            if Self::forward_covered(view.load_newest(), captured) == Some(true) {
                continue;
            }
            self.resolve_and_emit(RecordPtr::MainRow(addr), output, guard)?;
        }
        Ok(())
    }

    fn process_column_page(
        &self,
        page: PagePtr,
        captured: &std::collections::HashSet<usize>,
        output: &mut ProcessorOutput,
        guard: &Guard,
    ) -> Result<()> {
        let view = unsafe { ColumnPageView::from_addr(page.addr(), self.ctx.desc, guard) };
        let count = view.row_count();
        let valid_from = view.valid_from();
        let page_valid_to = view.valid_to();

        // Per-snapshot visibility fix-up. The scratch valid_to starts
        // all-masked (0 is in every read set, so the interval test
        // fails); the walk below opens exactly the one row per record
        // that this snapshot resolves to. Chain versions supersede rows
        // and are evaluated through the row path; forwarded records are
        // served through their new location.
        let mut valid_to = vec![0u64; count];
        for (_key, first_row) in view.record_heads() {
            let word = view.newest_word(first_row).load(Ordering::Acquire);
            match newest::decode(word) {
                newest::Newest::None | newest::Newest::Log(_) => {
                    let mut covered: Option<Option<&[u8]>> = None;
                    for entry in ChainIter::from_word(word, guard) {
                        if entry.aborted() {
                            continue;
                        }
                        if self.snapshot.in_read_set(entry.version()) {
                            covered = Some(if entry.is_tombstone() {
                                None
                            } else {
                                Some(entry.tuple())
                            });
                            break;
                        }
                    }
                    match covered {
                        Some(Some(data)) => self.emit_tuple(data, output)?,
                        Some(None) => {} // deleted for this snapshot
                        None => {
                            // Highest row version in the read set wins;
                            // a tombstone row keeps the record masked.
                            for row in view.record_rows(first_row) {
                                if self.snapshot.in_read_set(valid_from[row]) {
                                    if valid_from[row] != page_valid_to[row] {
                                        valid_to[row] = u64::MAX;
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
                newest::Newest::ForwardMain(_)
                | newest::Newest::ForwardColumn(_)
                | newest::Newest::Gone => {
                    if Self::forward_covered(word, captured) == Some(true) {
                        continue;
                    }
                    match newest::decode(word) {
                        newest::Newest::ForwardMain(addr) => {
                            self.resolve_and_emit(RecordPtr::MainRow(addr), output, guard)?;
                        }
                        newest::Newest::ForwardColumn(addr) => {
                            self.resolve_and_emit(RecordPtr::ColumnEntry(addr), output, guard)?;
                        }
                        _ => {}
                    }
                }
            }
        }

        let scan_kernel = InterpretedScan {
            query: self.request.query.clone(),
        };
        let mut matches = BitMask::with_len(count);
        scan_kernel.scan(&view, 0, count, self.snapshot, &valid_to, &mut matches);

        for row in matches.ones() {
            let values: SmallVec<[Value<'_>; 8]> = (0..self.ctx.desc.field_count())
                .map(|f| view.value(f, row))
                .collect();
            self.emit_values(&values, output)?;
        }
        Ok(())
    }

    /// Shared log tail, filtered to this processor's key partition.
    /// Only insert heads are considered: updates and deletes are
    /// reachable through main records' chains and would double-emit.
    fn process_log_tail(
        &self,
        captured: &std::collections::HashSet<usize>,
        output: &mut ProcessorOutput,
        guard: &Guard,
    ) -> Result<()> {
        for entry in self.ctx.log.iter(guard) {
            let record = unsafe { RecordView::from_addr(entry.data_addr(), guard) };
            let RecordView::Insert(insert) = record else {
                continue;
            };
            // Aborted heads are not skipped: a fresh version may have
            // chained onto a dead insert, and resolution handles the
            // husk (it contributes no version of its own).
            if log_partition(insert.key(), self.workers) != self.index {
                continue;
            }
            // An insert absorbed into main carries a forward. If the
            // forward target sits on one of the captured main pages, the
            // page pass already covers the record; otherwise (target on
            // a fill page newer than this capture) the log side is still
            // the only source and the forward is chased here.
            if Self::forward_covered(record.load_newest(), captured) == Some(true) {
                continue;
            }
            self.resolve_and_emit(RecordPtr::LogHead(entry.data_addr()), output, guard)?;
        }
        Ok(())
    }
}

/// Resolves a record pointer to the version visible to `snapshot`,
/// chasing GC forwards across relocations.
pub(crate) fn resolve_version<'g>(
    ptr: RecordPtr,
    desc: &TupleDesc,
    snapshot: &SnapshotDescriptor,
    guard: &'g Guard,
) -> Option<VisibleVersion<'g>> {
    let mut current = ptr;
    loop {
        match current {
            RecordPtr::MainRow(addr) | RecordPtr::LogHead(addr) => {
                let view = unsafe { RecordView::from_addr(addr, guard) };
                match view.get_version(snapshot, guard) {
                    Lookup::Done(v) => return v,
                    Lookup::Forward(next) => current = next,
                    Lookup::Gone => return None,
                }
            }
            RecordPtr::ColumnEntry(addr) => {
                let entry = crate::page::ColumnEntryRef::from_addr(addr);
                // Column reads copy out, so the result does not borrow
                // the (shorter-lived) desc reference.
                match entry.get_version(desc, snapshot, guard) {
                    Lookup::Done(v) => {
                        return v.map(|vv| VisibleVersion {
                            data: vv.data.map(|d| TupleData::Owned(d.into_vec())),
                            version: vv.version,
                            is_newest: vv.is_newest,
                        })
                    }
                    Lookup::Forward(next) => current = next,
                    Lookup::Gone => return None,
                }
            }
        }
    }
}

/// Runs a scan over captured state with `request.threads` processors.
pub(crate) fn execute(
    ctx: &ScanContext<'_>,
    request: &ScanRequest,
    snapshot: &SnapshotDescriptor,
) -> Result<ScanResult> {
    if let ScanProjection::Aggregate(specs) = &request.projection {
        for spec in specs {
            if ctx.desc.field(spec.field_id).is_none() {
                return Err(StorageError::InvalidArgument(format!(
                    "aggregate references field {}",
                    spec.field_id
                )));
            }
        }
    }
    let out_desc = output_desc(ctx.desc, &request.projection)?;
    let workers = request.threads.max(1);
    debug!(
        table = ctx.table_id,
        pages = ctx.pages.len(),
        workers,
        "scan start"
    );

    let results: Vec<Result<ProcessorOutput>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let out_desc = &out_desc;
                scope.spawn(move || {
                    let guard = pin();
                    Processor {
                        ctx,
                        request,
                        snapshot,
                        out_desc,
                        index,
                        workers,
                    }
                    .run(&guard)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("scan worker panicked"))
            .collect()
    });

    // All-or-nothing: merge only when every processor succeeded.
    let mut rows = Vec::new();
    let mut merged: Option<Vec<AggState>> = None;
    for result in results {
        let output = result?;
        rows.extend(output.rows);
        match &mut merged {
            None => merged = Some(output.aggs),
            Some(states) => {
                for (state, other) in states.iter_mut().zip(output.aggs) {
                    state.merge(other);
                }
            }
        }
    }
    let aggregates = merged
        .unwrap_or_default()
        .into_iter()
        .map(AggState::finish)
        .collect();
    Ok(ScanResult {
        rows,
        aggregates,
        output_desc: out_desc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_partitioning_is_deterministic_and_total() {
        for workers in [1, 3, 8] {
            for key in 0..1_000u64 {
                let p = log_partition(key, workers);
                assert!(p < workers);
                assert_eq!(p, log_partition(key, workers));
            }
        }
    }

    #[test]
    fn projection_desc_selects_fields() {
        let desc = TupleDesc::new(
            Schema::new(vec![
                Field::new("a", crate::tuple::FieldType::Int),
                Field::new("b", crate::tuple::FieldType::Text),
            ])
            .unwrap(),
        );
        let out = output_desc(&desc, &ScanProjection::Fields(vec![1])).unwrap();
        assert_eq!(out.field_count(), 1);
        assert_eq!(out.field_id("b"), Some(0));
        assert!(output_desc(&desc, &ScanProjection::Fields(vec![7])).is_err());
    }
}
