//! # Scan Kernels
//!
//! The scan processor drives per-page kernels through a fixed calling
//! convention `(page, start_idx, end_idx, snapshot, output)`. Kernels
//! are normally produced by an external code generator and consumed
//! here as opaque function pointers ([`RawKernelFn`] via
//! [`ExternColumnScan`]); [`InterpretedScan`] is the engine's built-in
//! implementation of the same contract, evaluating the parsed query
//! directly over column arrays.
//!
//! A scan kernel writes one match bit per row. Row visibility combines
//! the MVCC interval test with the inflight filter:
//!
//! ```text
//! visible(row) = in_read_set(valid_from[row]) && !in_read_set(valid_to[row])
//! ```
//!
//! `valid_to` comes from the processor's scratch array: the fix-up pass
//! resolves chains, relocations, and inflight anomalies ahead of time,
//! so the interval test is exact for the scan's snapshot.

use crate::page::ColumnPageView;
use crate::scan::query::ScanQuery;
use crate::tuple::OwnedValue;
use crate::tuple::{FieldType, Value};
use crate::txn::SnapshotDescriptor;

/// Packed per-row match bits.
pub struct BitMask {
    words: Vec<u64>,
    len: usize,
}

impl BitMask {
    pub fn with_len(len: usize) -> Self {
        BitMask {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    pub fn get(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * 64 + bit)
            })
        })
    }
}

/// The column-scan contract: mark matching, visible rows of
/// `[start, end)` in `out`.
pub trait ColumnScanKernel: Send + Sync {
    fn scan(
        &self,
        page: &ColumnPageView<'_>,
        start: usize,
        end: usize,
        snapshot: &SnapshotDescriptor,
        valid_to: &[u64],
        out: &mut BitMask,
    );
}

/// Built-in kernel evaluating a parsed query over the column arrays.
pub struct InterpretedScan {
    pub query: ScanQuery,
}

impl ColumnScanKernel for InterpretedScan {
    fn scan(
        &self,
        page: &ColumnPageView<'_>,
        start: usize,
        end: usize,
        snapshot: &SnapshotDescriptor,
        valid_to: &[u64],
        out: &mut BitMask,
    ) {
        let valid_from = page.valid_from();
        'rows: for row in start..end {
            if !snapshot.in_read_set(valid_from[row]) || snapshot.in_read_set(valid_to[row]) {
                continue;
            }
            for conjunct in &self.query.conjuncts {
                let stored = page.value(conjunct.field_id, row);
                if stored.is_null() || !conjunct.matches(&stored) {
                    continue 'rows;
                }
            }
            out.set(row);
        }
    }
}

/// Snapshot image handed across the kernel ABI.
#[repr(C)]
pub struct KernelSnapshot {
    pub base_version: u64,
    pub own_version: u64,
    pub inflight_ptr: *const u64,
    pub inflight_len: u64,
}

/// The raw kernel calling convention of externally compiled kernels:
/// `(page_ptr, start_idx, end_idx, snapshot_ptr, output_ptr)`. A scan
/// kernel writes a `u8` match flag per row into `output_ptr`.
pub type RawKernelFn =
    unsafe extern "C" fn(*const u8, u64, u64, *const KernelSnapshot, *mut u8);

/// Adapter running an externally compiled scan kernel through the
/// [`ColumnScanKernel`] seam. The kernel bakes in its query; the engine
/// does not know how it was compiled.
pub struct ExternColumnScan {
    raw: RawKernelFn,
}

impl ExternColumnScan {
    /// # Safety
    /// `raw` must follow the kernel ABI and stay valid for the scan's
    /// lifetime.
    pub unsafe fn new(raw: RawKernelFn) -> Self {
        ExternColumnScan { raw }
    }
}

impl ColumnScanKernel for ExternColumnScan {
    fn scan(
        &self,
        page: &ColumnPageView<'_>,
        start: usize,
        end: usize,
        snapshot: &SnapshotDescriptor,
        valid_to: &[u64],
        out: &mut BitMask,
    ) {
        let abi = KernelSnapshot {
            base_version: snapshot.base_version(),
            own_version: snapshot.own_version(),
            inflight_ptr: snapshot.inflight().as_ptr(),
            inflight_len: snapshot.inflight().len() as u64,
        };
        let mut flags = vec![0u8; end - start];
        unsafe {
            (self.raw)(
                page.addr() as *const u8,
                start as u64,
                end as u64,
                &abi,
                flags.as_mut_ptr(),
            );
        }
        // The external kernel evaluates predicates only; visibility
        // fix-ups live in the scratch valid_to.
        let valid_from = page.valid_from();
        for (i, &flag) in flags.iter().enumerate() {
            let row = start + i;
            if flag != 0
                && snapshot.in_read_set(valid_from[row])
                && !snapshot.in_read_set(valid_to[row])
            {
                out.set(row);
            }
        }
    }
}

/// Aggregation functions of the materialization kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    Sum,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, Copy)]
pub struct AggSpec {
    pub func: AggFn,
    pub field_id: usize,
}

/// Per-processor aggregate accumulator. Integer sums wrap; the final
/// cross-processor reduction happens in [`AggState::merge`].
#[derive(Debug, Clone)]
pub enum AggState {
    Count(u64),
    SumInt(i64),
    SumFloat(f64),
    MinInt(Option<i64>),
    MaxInt(Option<i64>),
    MinFloat(Option<f64>),
    MaxFloat(Option<f64>),
    MinBytes(Option<Vec<u8>>),
    MaxBytes(Option<Vec<u8>>),
}

impl AggState {
    pub fn new(spec: &AggSpec, field_type: FieldType) -> AggState {
        use FieldType::*;
        match (spec.func, field_type) {
            (AggFn::Count, _) => AggState::Count(0),
            (AggFn::Sum, Int | BigInt) => AggState::SumInt(0),
            (AggFn::Sum, Float | Double) => AggState::SumFloat(0.0),
            (AggFn::Sum, Text | Blob) => AggState::Count(0),
            (AggFn::Min, Int | BigInt) => AggState::MinInt(None),
            (AggFn::Max, Int | BigInt) => AggState::MaxInt(None),
            (AggFn::Min, Float | Double) => AggState::MinFloat(None),
            (AggFn::Max, Float | Double) => AggState::MaxFloat(None),
            (AggFn::Min, Text | Blob) => AggState::MinBytes(None),
            (AggFn::Max, Text | Blob) => AggState::MaxBytes(None),
        }
    }

    pub fn update(&mut self, value: &Value<'_>) {
        if value.is_null() {
            return;
        }
        let as_int = match value {
            Value::Int(v) => Some(*v as i64),
            Value::BigInt(v) => Some(*v),
            _ => None,
        };
        let as_float = match value {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        };
        match self {
            AggState::Count(n) => *n += 1,
            AggState::SumInt(acc) => {
                if let Some(v) = as_int {
                    *acc = acc.wrapping_add(v);
                }
            }
            AggState::SumFloat(acc) => {
                if let Some(v) = as_float {
                    *acc += v;
                }
            }
            AggState::MinInt(acc) => {
                if let Some(v) = as_int {
                    *acc = Some(acc.map_or(v, |a| a.min(v)));
                }
            }
            AggState::MaxInt(acc) => {
                if let Some(v) = as_int {
                    *acc = Some(acc.map_or(v, |a| a.max(v)));
                }
            }
            AggState::MinFloat(acc) => {
                if let Some(v) = as_float {
                    *acc = Some(acc.map_or(v, |a| a.min(v)));
                }
            }
            AggState::MaxFloat(acc) => {
                if let Some(v) = as_float {
                    *acc = Some(acc.map_or(v, |a| a.max(v)));
                }
            }
            AggState::MinBytes(acc) => {
                let bytes = match value {
                    Value::Text(s) => s.as_bytes(),
                    Value::Blob(b) => b,
                    _ => return,
                };
                if acc.as_deref().map_or(true, |a| bytes < a) {
                    *acc = Some(bytes.to_vec());
                }
            }
            AggState::MaxBytes(acc) => {
                let bytes = match value {
                    Value::Text(s) => s.as_bytes(),
                    Value::Blob(b) => b,
                    _ => return,
                };
                if acc.as_deref().map_or(true, |a| bytes > a) {
                    *acc = Some(bytes.to_vec());
                }
            }
        }
    }

    pub fn merge(&mut self, other: AggState) {
        match (self, other) {
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (AggState::SumInt(a), AggState::SumInt(b)) => *a = a.wrapping_add(b),
            (AggState::SumFloat(a), AggState::SumFloat(b)) => *a += b,
            (AggState::MinInt(a), AggState::MinInt(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.min(y)),
                    (x, y) => x.or(y),
                }
            }
            (AggState::MaxInt(a), AggState::MaxInt(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    (x, y) => x.or(y),
                }
            }
            (AggState::MinFloat(a), AggState::MinFloat(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.min(y)),
                    (x, y) => x.or(y),
                }
            }
            (AggState::MaxFloat(a), AggState::MaxFloat(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    (x, y) => x.or(y),
                }
            }
            (AggState::MinBytes(a), AggState::MinBytes(b)) => {
                *a = match (a.take(), b) {
                    (Some(x), Some(y)) => Some(if y < x { y } else { x }),
                    (x, y) => x.or(y),
                }
            }
            (AggState::MaxBytes(a), AggState::MaxBytes(b)) => {
                *a = match (a.take(), b) {
                    (Some(x), Some(y)) => Some(if y > x { y } else { x }),
                    (x, y) => x.or(y),
                }
            }
            _ => unreachable!("merging mismatched aggregate states"),
        }
    }

    pub fn finish(self) -> OwnedValue {
        match self {
            AggState::Count(n) => OwnedValue::BigInt(n as i64),
            AggState::SumInt(v) => OwnedValue::BigInt(v),
            AggState::SumFloat(v) => OwnedValue::Double(v),
            AggState::MinInt(v) | AggState::MaxInt(v) => {
                v.map_or(OwnedValue::Null, OwnedValue::BigInt)
            }
            AggState::MinFloat(v) | AggState::MaxFloat(v) => {
                v.map_or(OwnedValue::Null, OwnedValue::Double)
            }
            AggState::MinBytes(v) | AggState::MaxBytes(v) => {
                v.map_or(OwnedValue::Null, OwnedValue::Blob)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{pin, PageManager};
    use crate::page::column_map::ColumnPageBuilder;
    use crate::tuple::{encode_tuple_vec, Field, Schema, TupleDesc};
    use crate::txn::SnapshotDescriptor;

    #[test]
    fn extern_kernel_drives_through_the_abi() {
        unsafe extern "C" fn match_all(
            _page: *const u8,
            start: u64,
            end: u64,
            snapshot: *const KernelSnapshot,
            out: *mut u8,
        ) {
            assert!(!snapshot.is_null());
            for i in 0..(end - start) as usize {
                *out.add(i) = 1;
            }
        }

        let desc = TupleDesc::new(
            Schema::new(vec![Field::new("n", FieldType::Int)]).unwrap(),
        );
        let pm = PageManager::new(1);
        let page = pm.alloc().unwrap();
        let mut builder = ColumnPageBuilder::new(&desc);
        for key in 0..3u64 {
            let img = encode_tuple_vec(&desc, &[Value::Int(key as i32)]).unwrap();
            builder.try_add_record(key, &[(key + 1, Some(&img))], 0).unwrap();
        }
        builder.flush(page);

        let guard = pin();
        let view = unsafe {
            crate::page::ColumnPageView::from_addr(page.addr(), &desc, &guard)
        };
        let kernel = unsafe { ExternColumnScan::new(match_all) };
        let snapshot = SnapshotDescriptor::at_base(10);
        let valid_to = vec![u64::MAX; 3];
        let mut out = BitMask::with_len(3);
        kernel.scan(&view, 0, 3, &snapshot, &valid_to, &mut out);
        assert_eq!(out.count(), 3);

        // Visibility still filters: a snapshot below the versions sees
        // nothing even though the kernel matched every row.
        let early = SnapshotDescriptor::at_base(0);
        let mut out = BitMask::with_len(3);
        kernel.scan(&view, 0, 3, &early, &valid_to, &mut out);
        assert_eq!(out.count(), 0);
    }

    #[test]
    fn bitmask_set_get_ones() {
        let mut mask = BitMask::with_len(130);
        mask.set(0);
        mask.set(64);
        mask.set(129);
        assert!(mask.get(64));
        assert!(!mask.get(1));
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.ones().collect::<Vec<_>>(), vec![0, 64, 129]);
    }

    #[test]
    fn sum_wraps_on_overflow() {
        let mut agg = AggState::SumInt(0);
        for _ in 0..1000 {
            agg.update(&Value::BigInt(0x7FFF_FFFF_0000_0001));
        }
        let expected = 0x7FFF_FFFF_0000_0001u64.wrapping_mul(1000) as i64;
        assert_eq!(agg.finish(), OwnedValue::BigInt(expected));
    }

    #[test]
    fn min_max_merge_across_processors() {
        let mut a = AggState::MinInt(None);
        a.update(&Value::Int(5));
        let mut b = AggState::MinInt(None);
        b.update(&Value::Int(-3));
        a.merge(b);
        assert_eq!(a.finish(), OwnedValue::BigInt(-3));
    }

    #[test]
    fn count_ignores_nulls() {
        let mut agg = AggState::Count(0);
        agg.update(&Value::Int(1));
        agg.update(&Value::Null);
        agg.update(&Value::Int(2));
        assert_eq!(agg.finish(), OwnedValue::BigInt(2));
    }
}
