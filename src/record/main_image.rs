//! Main record images, produced by garbage collection and stored in
//! row-store pages.
//!
//! ## Multi-version image
//!
//! ```text
//! Offset      Size      Field
//! ------      ----      ------------------------------------------
//! 0           1         type (MultiVersion)
//! 1           3         pad
//! 4           4         num_versions
//! 8           8         newest pointer (atomic, see super::newest)
//! 16          8         key
//! 24          4         total_size (8-aligned image footprint)
//! 28          4         data_offset (start of tuple bytes)
//! 32          8·n       versions, strictly descending
//! 32+8n       4·(n+1)   offsets, relative to the record start
//! data_offset ...         tuple bytes, packed in version order
//! ```
//!
//! A version whose two offsets are equal is a tombstone.
//!
//! ## Single-version image
//!
//! The common case after compaction (one live version, no chain) skips
//! both arrays:
//!
//! ```text
//! 0: type (SingleVersion) | pad[3] | tuple_len u32
//! 8: newest pointer (atomic)
//! 16: key
//! 24: version
//! 32: tuple bytes
//! ```

use std::marker::PhantomData;
use std::sync::atomic::AtomicU64;

use crate::config::align8;
use crate::record::RecordType;

pub const MAIN_RECORD_HEADER_SIZE: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct MultiVersionView<'g> {
    addr: usize,
    _guard: PhantomData<&'g ()>,
}

impl<'g> MultiVersionView<'g> {
    /// # Safety
    /// `addr` must point at a published multi-version image.
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert_eq!(addr % 8, 0);
        MultiVersionView {
            addr,
            _guard: PhantomData,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn num_versions(&self) -> usize {
        unsafe { *((self.addr + 4) as *const u32) as usize }
    }

    pub(crate) fn newest_word(&self) -> &'g AtomicU64 {
        unsafe { &*((self.addr + 8) as *const AtomicU64) }
    }

    pub fn key(&self) -> u64 {
        unsafe { *((self.addr + 16) as *const u64) }
    }

    pub fn size(&self) -> usize {
        unsafe { *((self.addr + 24) as *const u32) as usize }
    }

    pub fn versions(&self) -> &'g [u64] {
        unsafe {
            std::slice::from_raw_parts((self.addr + 32) as *const u64, self.num_versions())
        }
    }

    fn offsets(&self) -> &'g [u32] {
        let n = self.num_versions();
        unsafe { std::slice::from_raw_parts((self.addr + 32 + 8 * n) as *const u32, n + 1) }
    }

    /// Tuple bytes of version index `i`; `None` marks a tombstone.
    pub fn version_data(&self, i: usize) -> Option<&'g [u8]> {
        let offsets = self.offsets();
        let (start, end) = (offsets[i] as usize, offsets[i + 1] as usize);
        if start == end {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts((self.addr + start) as *const u8, end - start) })
    }

    pub fn as_bytes(&self) -> &'g [u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size()) }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SingleVersionView<'g> {
    addr: usize,
    _guard: PhantomData<&'g ()>,
}

impl<'g> SingleVersionView<'g> {
    /// # Safety
    /// `addr` must point at a published single-version image.
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert_eq!(addr % 8, 0);
        SingleVersionView {
            addr,
            _guard: PhantomData,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn tuple_len(&self) -> usize {
        unsafe { *((self.addr + 4) as *const u32) as usize }
    }

    pub(crate) fn newest_word(&self) -> &'g AtomicU64 {
        unsafe { &*((self.addr + 8) as *const AtomicU64) }
    }

    pub fn key(&self) -> u64 {
        unsafe { *((self.addr + 16) as *const u64) }
    }

    pub fn version(&self) -> u64 {
        unsafe { *((self.addr + 24) as *const u64) }
    }

    pub fn tuple(&self) -> &'g [u8] {
        unsafe {
            std::slice::from_raw_parts(
                (self.addr + MAIN_RECORD_HEADER_SIZE) as *const u8,
                self.tuple_len(),
            )
        }
    }

    pub fn size(&self) -> usize {
        align8(MAIN_RECORD_HEADER_SIZE + self.tuple_len())
    }
}

/// Exact footprint of a multi-version image holding the given tuple
/// payload lengths (tombstones count as zero).
pub fn multi_version_size(tuple_lens: &[usize]) -> usize {
    let n = tuple_lens.len();
    let arrays = 8 * n + 4 * (n + 1);
    let data_offset = align8(MAIN_RECORD_HEADER_SIZE + arrays);
    align8(data_offset + tuple_lens.iter().sum::<usize>())
}

pub fn single_version_size(tuple_len: usize) -> usize {
    align8(MAIN_RECORD_HEADER_SIZE + tuple_len)
}

/// Writes a multi-version image. `versions` are (version, tuple) pairs in
/// strictly descending version order; `None` tuples are tombstones.
/// `newest` seeds the newest pointer (0 or a retained chain head).
/// Returns the bytes written.
pub fn write_multi_version(
    dst: &mut [u8],
    key: u64,
    newest: u64,
    versions: &[(u64, Option<&[u8]>)],
) -> usize {
    let n = versions.len();
    debug_assert!(n > 0);
    debug_assert!(versions.windows(2).all(|w| w[0].0 > w[1].0));
    let lens: Vec<usize> = versions
        .iter()
        .map(|(_, d)| d.map_or(0, <[u8]>::len))
        .collect();
    let total = multi_version_size(&lens);
    debug_assert!(dst.len() >= total);
    let arrays = 8 * n + 4 * (n + 1);
    let data_offset = align8(MAIN_RECORD_HEADER_SIZE + arrays);

    dst[0] = RecordType::MultiVersion as u8;
    dst[1..4].fill(0);
    dst[4..8].copy_from_slice(&(n as u32).to_le_bytes());
    dst[8..16].copy_from_slice(&newest.to_le_bytes());
    dst[16..24].copy_from_slice(&key.to_le_bytes());
    dst[24..28].copy_from_slice(&(total as u32).to_le_bytes());
    dst[28..32].copy_from_slice(&(data_offset as u32).to_le_bytes());

    let mut cursor = data_offset;
    for (i, (version, data)) in versions.iter().enumerate() {
        dst[32 + 8 * i..40 + 8 * i].copy_from_slice(&version.to_le_bytes());
        let off_at = 32 + 8 * n + 4 * i;
        dst[off_at..off_at + 4].copy_from_slice(&(cursor as u32).to_le_bytes());
        if let Some(data) = data {
            dst[cursor..cursor + data.len()].copy_from_slice(data);
            cursor += data.len();
        }
    }
    let off_at = 32 + 8 * n + 4 * n;
    dst[off_at..off_at + 4].copy_from_slice(&(cursor as u32).to_le_bytes());
    // Zero the alignment tail so iteration over a page never reads junk.
    dst[cursor..total].fill(0);
    total
}

/// Writes a single-version image and returns the bytes written.
pub fn write_single_version(
    dst: &mut [u8],
    key: u64,
    newest: u64,
    version: u64,
    tuple: &[u8],
) -> usize {
    let total = single_version_size(tuple.len());
    debug_assert!(dst.len() >= total);
    dst[0] = RecordType::SingleVersion as u8;
    dst[1..4].fill(0);
    dst[4..8].copy_from_slice(&(tuple.len() as u32).to_le_bytes());
    dst[8..16].copy_from_slice(&newest.to_le_bytes());
    dst[16..24].copy_from_slice(&key.to_le_bytes());
    dst[24..32].copy_from_slice(&version.to_le_bytes());
    dst[32..32 + tuple.len()].copy_from_slice(tuple);
    dst[32 + tuple.len()..total].fill(0);
    total
}
