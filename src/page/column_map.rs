//! # Column-Map Main Page
//!
//! A main page in columnar layout, built by GC from compacted records
//! and consumed by the scan kernels.
//!
//! ```text
//! | count u32 | pad u32 |
//! | key[count] u64          \
//! | valid_from[count] u64    | parallel header arrays
//! | valid_to[count] u64      | (one row per stored version)
//! | newest[count] u64 atomic/
//! | fixed column per fixed field  (count × field width, 8-aligned)
//! | null bitmap per field         (count bits, 8-aligned)
//! | (heap offset u32, len u32) per var field × count
//! | heap ...
//! ```
//!
//! Rows of one record are contiguous with strictly descending
//! `valid_from`; `valid_to` is the next newer version (`u64::MAX` on the
//! newest row). A tombstone is a row with `valid_from == valid_to`:
//! never visible to the interval test, but it caps the previous row's
//! `valid_to`. Row visibility for snapshot `S` is
//! `S.in_read_set(valid_from) && !S.in_read_set(valid_to)`.
//!
//! The hash table points at a record's first row through the address of
//! its key cell; the owning page is recovered by masking the address.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::Guard;

use crate::config::{align8, MAX_COLUMN_RECORDS, PAGE_SIZE};
use crate::record::{newest, ChainIter, Lookup, RecordPtr, TupleData, VisibleVersion};
use crate::tuple::{encode_tuple, FieldType, TupleDesc, TupleView, Value};
use crate::txn::SnapshotDescriptor;

const HEADER: usize = 8;

/// Byte offsets of every region for a page holding `count` rows.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub count: usize,
    pub key_off: usize,
    pub valid_from_off: usize,
    pub valid_to_off: usize,
    pub newest_off: usize,
    fixed_offs: Vec<Option<usize>>,
    null_offs: Vec<usize>,
    var_offs: Vec<Option<usize>>,
    pub heap_off: usize,
}

impl ColumnLayout {
    pub fn compute(desc: &TupleDesc, count: usize) -> Self {
        let mut off = HEADER;
        let key_off = off;
        off += 8 * count;
        let valid_from_off = off;
        off += 8 * count;
        let valid_to_off = off;
        off += 8 * count;
        let newest_off = off;
        off += 8 * count;
        let mut fixed_offs = Vec::with_capacity(desc.field_count());
        for field in desc.schema().fields() {
            match field.field_type.fixed_size() {
                Some(width) => {
                    fixed_offs.push(Some(off));
                    off += align8(width * count);
                }
                None => fixed_offs.push(None),
            }
        }
        let mut null_offs = Vec::with_capacity(desc.field_count());
        for _ in 0..desc.field_count() {
            null_offs.push(off);
            off += align8(count.div_ceil(8));
        }
        let mut var_offs = Vec::with_capacity(desc.field_count());
        for field in desc.schema().fields() {
            if field.field_type.is_variable() {
                var_offs.push(Some(off));
                off += 8 * count;
            } else {
                var_offs.push(None);
            }
        }
        ColumnLayout {
            count,
            key_off,
            valid_from_off,
            valid_to_off,
            newest_off,
            fixed_offs,
            null_offs,
            var_offs,
            heap_off: off,
        }
    }
}

/// Non-owning typed view of a column-map page.
pub struct ColumnPageView<'g> {
    addr: usize,
    layout: ColumnLayout,
    desc: &'g TupleDesc,
}

impl<'g> ColumnPageView<'g> {
    /// # Safety
    /// `addr` must be the start of a live column-map page built for
    /// `desc`, and the caller must hold an epoch guard.
    pub unsafe fn from_addr(addr: usize, desc: &'g TupleDesc, _guard: &'g Guard) -> Self {
        debug_assert_eq!(addr % PAGE_SIZE, 0);
        let count = *(addr as *const u32) as usize;
        ColumnPageView {
            addr,
            layout: ColumnLayout::compute(desc, count),
            desc,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn row_count(&self) -> usize {
        self.layout.count
    }

    pub fn desc(&self) -> &'g TupleDesc {
        self.desc
    }

    pub fn keys(&self) -> &'g [u64] {
        unsafe {
            std::slice::from_raw_parts(
                (self.addr + self.layout.key_off) as *const u64,
                self.layout.count,
            )
        }
    }

    pub fn valid_from(&self) -> &'g [u64] {
        unsafe {
            std::slice::from_raw_parts(
                (self.addr + self.layout.valid_from_off) as *const u64,
                self.layout.count,
            )
        }
    }

    pub fn valid_to(&self) -> &'g [u64] {
        unsafe {
            std::slice::from_raw_parts(
                (self.addr + self.layout.valid_to_off) as *const u64,
                self.layout.count,
            )
        }
    }

    pub fn newest_word(&self, row: usize) -> &'g AtomicU64 {
        debug_assert!(row < self.layout.count);
        unsafe { &*((self.addr + self.layout.newest_off + 8 * row) as *const AtomicU64) }
    }

    pub fn is_null(&self, field_id: usize, row: usize) -> bool {
        let base = self.addr + self.layout.null_offs[field_id];
        let byte = unsafe { *((base + row / 8) as *const u8) };
        byte & (1 << (row % 8)) != 0
    }

    fn fixed_base(&self, field_id: usize) -> usize {
        self.addr + self.layout.fixed_offs[field_id].expect("fixed column on var field")
    }

    pub fn col_int(&self, field_id: usize) -> &'g [i32] {
        unsafe {
            std::slice::from_raw_parts(self.fixed_base(field_id) as *const i32, self.layout.count)
        }
    }

    pub fn col_bigint(&self, field_id: usize) -> &'g [i64] {
        unsafe {
            std::slice::from_raw_parts(self.fixed_base(field_id) as *const i64, self.layout.count)
        }
    }

    pub fn col_float(&self, field_id: usize) -> &'g [f32] {
        unsafe {
            std::slice::from_raw_parts(self.fixed_base(field_id) as *const f32, self.layout.count)
        }
    }

    pub fn col_double(&self, field_id: usize) -> &'g [f64] {
        unsafe {
            std::slice::from_raw_parts(self.fixed_base(field_id) as *const f64, self.layout.count)
        }
    }

    pub fn var_bytes(&self, field_id: usize, row: usize) -> &'g [u8] {
        let slot =
            self.addr + self.layout.var_offs[field_id].expect("var column on fixed field") + 8 * row;
        let (offset, len) = unsafe { (*(slot as *const u32), *((slot + 4) as *const u32)) };
        unsafe {
            std::slice::from_raw_parts((self.addr + offset as usize) as *const u8, len as usize)
        }
    }

    pub fn value(&self, field_id: usize, row: usize) -> Value<'g> {
        if self.is_null(field_id, row) {
            return Value::Null;
        }
        match self.desc.field(field_id).unwrap().field_type {
            FieldType::Int => Value::Int(self.col_int(field_id)[row]),
            FieldType::BigInt => Value::BigInt(self.col_bigint(field_id)[row]),
            FieldType::Float => Value::Float(self.col_float(field_id)[row]),
            FieldType::Double => Value::Double(self.col_double(field_id)[row]),
            FieldType::Text => Value::Text(
                std::str::from_utf8(self.var_bytes(field_id, row)).expect("corrupt text column"),
            ),
            FieldType::Blob => Value::Blob(self.var_bytes(field_id, row)),
        }
    }

    /// Rebuilds the packed tuple image of one row.
    pub fn materialize(&self, row: usize) -> Vec<u8> {
        let values: Vec<Value<'_>> = (0..self.desc.field_count())
            .map(|f| self.value(f, row))
            .collect();
        let size = self.desc.tuple_size(&values).expect("row matches schema");
        let mut buf = vec![0u8; size];
        encode_tuple(self.desc, &values, &mut buf).expect("row matches schema");
        buf
    }

    /// The contiguous row slice `[first_row, end)` of the record
    /// starting at `first_row`.
    pub fn record_rows(&self, first_row: usize) -> std::ops::Range<usize> {
        let keys = self.keys();
        let key = keys[first_row];
        let mut end = first_row + 1;
        while end < self.layout.count && keys[end] == key {
            end += 1;
        }
        first_row..end
    }

    /// First rows of every record on the page, with their keys.
    pub fn record_heads(&self) -> Vec<(u64, usize)> {
        let keys = self.keys();
        let mut heads = Vec::new();
        let mut row = 0;
        while row < self.layout.count {
            heads.push((keys[row], row));
            row = self.record_rows(row).end;
        }
        heads
    }
}

/// Address of a record's entry cell (its first row's key slot).
pub fn entry_addr(page: usize, first_row: usize) -> usize {
    page + HEADER + 8 * first_row
}

/// A record head living in a column-map page.
#[derive(Debug, Clone, Copy)]
pub struct ColumnEntryRef {
    pub page: usize,
    pub first_row: usize,
}

impl ColumnEntryRef {
    pub fn from_addr(addr: usize) -> Self {
        let page = addr & !(PAGE_SIZE - 1);
        ColumnEntryRef {
            page,
            first_row: (addr - page - HEADER) / 8,
        }
    }

    pub fn addr(&self) -> usize {
        entry_addr(self.page, self.first_row)
    }

    pub fn load_newest<'g>(&self, desc: &'g TupleDesc, guard: &'g Guard) -> u64 {
        let view = unsafe { ColumnPageView::from_addr(self.page, desc, guard) };
        view.newest_word(self.first_row).load(Ordering::Acquire)
    }

    pub fn cas_newest(
        &self,
        desc: &TupleDesc,
        expected: u64,
        new: u64,
        guard: &Guard,
    ) -> Result<(), u64> {
        let view = unsafe { ColumnPageView::from_addr(self.page, desc, guard) };
        view.newest_word(self.first_row)
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }

    /// Version resolution against a snapshot, mirroring
    /// [`crate::record::RecordView::get_version`].
    pub fn get_version<'g>(
        &self,
        desc: &'g TupleDesc,
        snapshot: &SnapshotDescriptor,
        guard: &'g Guard,
    ) -> Lookup<'g> {
        let view = unsafe { ColumnPageView::from_addr(self.page, desc, guard) };
        let word = view.newest_word(self.first_row).load(Ordering::Acquire);
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

        let valid_from = view.valid_from();
        let valid_to = view.valid_to();
        for row in view.record_rows(self.first_row) {
            let version = valid_from[row];
            latest.get_or_insert(version);
            if snapshot.in_read_set(version) {
                let data = if valid_from[row] == valid_to[row] {
                    None
                } else {
                    Some(TupleData::Owned(view.materialize(row)))
                };
                return Lookup::Done(Some(VisibleVersion {
                    data,
                    version,
                    is_newest: latest == Some(version),
                }));
            }
        }
        Lookup::Done(None)
    }

    /// The record's versions materialized for re-compaction, newest
    /// first, tombstones as `None`.
    pub fn own_versions(
        &self,
        desc: &TupleDesc,
        guard: &Guard,
    ) -> Vec<(u64, Option<Vec<u8>>)> {
        let view = unsafe { ColumnPageView::from_addr(self.page, desc, guard) };
        let valid_from = view.valid_from();
        let valid_to = view.valid_to();
        view.record_rows(self.first_row)
            .map(|row| {
                let data = if valid_from[row] == valid_to[row] {
                    None
                } else {
                    Some(view.materialize(row))
                };
                (valid_from[row], data)
            })
            .collect()
    }
}

/// One version-row waiting to be packed into a page.
struct PendingRow {
    key: u64,
    valid_from: u64,
    valid_to: u64,
    newest: u64,
    tuple: Option<Vec<u8>>,
}

/// Packs compacted records into column-map pages.
///
/// `try_add_record` refuses a record that would overflow the page or
/// the row budget; the caller flushes and retries with a fresh builder.
pub struct ColumnPageBuilder<'a> {
    desc: &'a TupleDesc,
    rows: Vec<PendingRow>,
    heap_bytes: usize,
}

impl<'a> ColumnPageBuilder<'a> {
    pub fn new(desc: &'a TupleDesc) -> Self {
        ColumnPageBuilder {
            desc,
            rows: Vec::new(),
            heap_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn heap_contribution(&self, tuple: &[u8]) -> usize {
        tuple.len() - self.desc.header_size() - self.desc.total_fixed_size()
    }

    /// Adds a record's version rows. Returns the record's first row
    /// index, or `None` when the page would overflow.
    pub fn try_add_record(
        &mut self,
        key: u64,
        versions: &[(u64, Option<&[u8]>)],
        kept_chain: u64,
    ) -> Option<usize> {
        debug_assert!(!versions.is_empty());
        let new_rows = versions.len();
        let new_heap: usize = versions
            .iter()
            .filter_map(|&(_, d)| d.map(|t| self.heap_contribution(t)))
            .sum();
        let layout = ColumnLayout::compute(self.desc, self.rows.len() + new_rows);
        if self.rows.len() + new_rows > MAX_COLUMN_RECORDS
            || layout.heap_off + self.heap_bytes + new_heap > PAGE_SIZE
        {
            return None;
        }

        let first_row = self.rows.len();
        let mut valid_to = u64::MAX;
        for (i, &(version, data)) in versions.iter().enumerate() {
            let row_valid_to = if data.is_none() { version } else { valid_to };
            self.rows.push(PendingRow {
                key,
                valid_from: version,
                valid_to: row_valid_to,
                newest: if i == 0 { kept_chain } else { 0 },
                tuple: data.map(<[u8]>::to_vec),
            });
            valid_to = version;
        }
        self.heap_bytes += new_heap;
        Some(first_row)
    }

    /// Writes the collected rows into a fresh page. The page manager
    /// guarantees the page is zeroed, so untouched null bitmaps and the
    /// alignment gaps read as zero.
    pub fn flush(self, page: crate::memory::PagePtr) -> usize {
        let count = self.rows.len();
        let layout = ColumnLayout::compute(self.desc, count);
        let data = unsafe { page.as_mut_slice() };
        data[0..4].copy_from_slice(&(count as u32).to_le_bytes());

        let mut heap_cursor = layout.heap_off;
        for (row, pending) in self.rows.iter().enumerate() {
            data[layout.key_off + 8 * row..layout.key_off + 8 * row + 8]
                .copy_from_slice(&pending.key.to_le_bytes());
            data[layout.valid_from_off + 8 * row..layout.valid_from_off + 8 * row + 8]
                .copy_from_slice(&pending.valid_from.to_le_bytes());
            data[layout.valid_to_off + 8 * row..layout.valid_to_off + 8 * row + 8]
                .copy_from_slice(&pending.valid_to.to_le_bytes());
            data[layout.newest_off + 8 * row..layout.newest_off + 8 * row + 8]
                .copy_from_slice(&pending.newest.to_le_bytes());

            match &pending.tuple {
                None => {
                    // Tombstone row: every field null.
                    for field_id in 0..self.desc.field_count() {
                        data[layout.null_offs[field_id] + row / 8] |= 1 << (row % 8);
                    }
                }
                Some(tuple) => {
                    let view = TupleView::new(tuple, self.desc);
                    for (field_id, field) in self.desc.schema().fields().iter().enumerate() {
                        if view.is_null(field_id) {
                            data[layout.null_offs[field_id] + row / 8] |= 1 << (row % 8);
                            continue;
                        }
                        match field.field_type.fixed_size() {
                            Some(width) => {
                                let src = self.desc.header_size()
                                    + self.desc.fixed_offset(field_id);
                                let dst = layout.fixed_offs[field_id].unwrap() + width * row;
                                data[dst..dst + width]
                                    .copy_from_slice(&tuple[src..src + width]);
                            }
                            None => {
                                let bytes = match field.field_type {
                                    FieldType::Text => view.get_text(field_id).unwrap().as_bytes(),
                                    FieldType::Blob => view.get_blob(field_id),
                                    _ => unreachable!(),
                                };
                                let slot = layout.var_offs[field_id].unwrap() + 8 * row;
                                data[slot..slot + 4]
                                    .copy_from_slice(&(heap_cursor as u32).to_le_bytes());
                                data[slot + 4..slot + 8]
                                    .copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                                data[heap_cursor..heap_cursor + bytes.len()]
                                    .copy_from_slice(bytes);
                                heap_cursor += bytes.len();
                            }
                        }
                    }
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{pin, PageManager};
    use crate::tuple::{Field, Schema};

    fn desc() -> TupleDesc {
        TupleDesc::new(
            Schema::new(vec![
                Field::new("number", FieldType::Int),
                Field::new("text1", FieldType::Text),
                Field::new("largenumber", FieldType::BigInt),
                Field::nullable("text2", FieldType::Text),
            ])
            .unwrap(),
        )
    }

    fn tuple(desc: &TupleDesc, n: i32, t1: &str, big: i64, t2: Option<&str>) -> Vec<u8> {
        let values = [
            Value::Int(n),
            Value::Text(t1),
            Value::BigInt(big),
            t2.map_or(Value::Null, Value::Text),
        ];
        crate::tuple::builder::encode_tuple_vec(desc, &values).unwrap()
    }

    #[test]
    fn parallel_header_arrays_share_length() {
        let desc = desc();
        let pm = PageManager::new(1);
        let page = pm.alloc().unwrap();
        let mut builder = ColumnPageBuilder::new(&desc);
        let a = tuple(&desc, 1, "one", 10, Some("x"));
        let b = tuple(&desc, 2, "two", 20, None);
        builder
            .try_add_record(100, &[(9, Some(&a)), (5, None), (3, Some(&b))], 0)
            .unwrap();
        builder.try_add_record(200, &[(4, Some(&b))], 0).unwrap();
        let count = builder.flush(page);
        assert_eq!(count, 4);

        let guard = pin();
        let view = unsafe { ColumnPageView::from_addr(page.addr(), &desc, &guard) };
        assert_eq!(view.row_count(), 4);
        assert_eq!(view.keys(), &[100, 100, 100, 200]);
        assert_eq!(view.valid_from(), &[9, 5, 3, 4]);
        assert_eq!(view.valid_to(), &[u64::MAX, 5, 5, u64::MAX]);
        assert_eq!(view.record_rows(0), 0..3);
        assert_eq!(view.record_heads(), vec![(100, 0), (200, 3)]);
    }

    #[test]
    fn columns_round_trip_values() {
        let desc = desc();
        let pm = PageManager::new(1);
        let page = pm.alloc().unwrap();
        let mut builder = ColumnPageBuilder::new(&desc);
        let img = tuple(&desc, 7, "hello", 0x7FFF_FFFF_0000_0001, Some("tail"));
        builder.try_add_record(1, &[(3, Some(&img))], 0).unwrap();
        builder.flush(page);

        let guard = pin();
        let view = unsafe { ColumnPageView::from_addr(page.addr(), &desc, &guard) };
        assert_eq!(view.col_int(0)[0], 7);
        assert_eq!(view.col_bigint(2)[0], 0x7FFF_FFFF_0000_0001);
        assert_eq!(view.value(1, 0), Value::Text("hello"));
        assert_eq!(view.value(3, 0), Value::Text("tail"));
        assert_eq!(view.materialize(0), img, "bit-equal round trip");
    }

    #[test]
    fn tombstone_rows_are_never_interval_visible() {
        let desc = desc();
        let pm = PageManager::new(1);
        let page = pm.alloc().unwrap();
        let mut builder = ColumnPageBuilder::new(&desc);
        let img = tuple(&desc, 1, "x", 2, None);
        builder
            .try_add_record(5, &[(8, None), (4, Some(&img))], 0)
            .unwrap();
        builder.flush(page);

        let guard = pin();
        let entry = ColumnEntryRef::from_addr(entry_addr(page.addr(), 0));
        // Base 6 sees version 4 live.
        match entry.get_version(&desc, &crate::txn::SnapshotDescriptor::at_base(6), &guard) {
            Lookup::Done(Some(v)) => {
                assert_eq!(v.version, 4);
                assert!(v.data.is_some());
                assert!(!v.is_newest);
            }
            other => panic!("expected visible version, got {other:?}"),
        }
        // Base 9 sees the tombstone.
        match entry.get_version(&desc, &crate::txn::SnapshotDescriptor::at_base(9), &guard) {
            Lookup::Done(Some(v)) => {
                assert_eq!(v.version, 8);
                assert!(v.data.is_none(), "tombstone");
                assert!(v.is_newest);
            }
            other => panic!("expected tombstone, got {other:?}"),
        }
    }

    #[test]
    fn builder_refuses_overflow() {
        let desc = desc();
        let mut builder = ColumnPageBuilder::new(&desc);
        let big_text = "x".repeat(1 << 20);
        let img = tuple(&desc, 1, &big_text, 2, None);
        assert!(builder.try_add_record(1, &[(3, Some(&img))], 0).is_some());
        assert!(
            builder.try_add_record(2, &[(3, Some(&img))], 0).is_none(),
            "second megabyte tuple cannot fit"
        );
    }

    #[test]
    fn entry_ref_round_trips_through_addr() {
        let entry = ColumnEntryRef::from_addr(entry_addr(PAGE_SIZE * 3, 17));
        assert_eq!(entry.page, PAGE_SIZE * 3);
        assert_eq!(entry.first_row, 17);
    }
}
