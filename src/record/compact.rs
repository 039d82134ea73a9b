//! Record compaction: the copy step of garbage collection.
//!
//! A compacted image holds, in one contiguous allocation, every version
//! a live or future snapshot can still observe:
//!
//! 1. All decided chain entries are inlined and the chain dissolved.
//! 2. Versions strictly older than the reclamation watermark are
//!    dropped, keeping the newest such version so the snapshot sitting
//!    exactly on the watermark still reads.
//! 3. A record reduced to a single stale tombstone is dropped outright;
//!    its key disappears from the hash table.
//!
//! Entries of undecided transactions are never inlined. When a chain
//! contains one, the whole observed chain is retained on the new image
//! (`kept_chain`) and the pages holding its entries are reported as
//! blocked, which prevents the log tail from advancing past them this
//! pass. Duplicated versions (inlined earlier but still reachable
//! through a retained chain) are deduplicated on the next pass.

use crossbeam_epoch::Guard;
use smallvec::SmallVec;

use crate::config::PAGE_SIZE;
use crate::record::{
    multi_version_size, newest, single_version_size, write_multi_version, write_single_version,
    ChainIter, RecordView,
};
use crate::txn::GcHorizon;

/// Everything needed to write and install a compacted record.
#[derive(Debug)]
pub struct CompactedRecord<'g> {
    pub key: u64,
    /// Surviving versions, strictly descending; `None` data = tombstone.
    pub versions: SmallVec<[(u64, Option<&'g [u8]>); 4]>,
    /// Newest word for the new image: the observed chain when undecided
    /// entries force the chain to stay, 0 otherwise.
    pub kept_chain: u64,
    /// Log pages still referenced through `kept_chain`.
    pub blocked_pages: SmallVec<[usize; 2]>,
    /// Newest word observed at gather time; CAS expected value when the
    /// old head is forwarded.
    pub observed: u64,
}

impl<'g> CompactedRecord<'g> {
    pub fn is_single(&self) -> bool {
        self.kept_chain == 0 && self.versions.len() == 1 && self.versions[0].1.is_some()
    }

    pub fn image_size(&self) -> usize {
        if self.is_single() {
            single_version_size(self.versions[0].1.unwrap().len())
        } else {
            let lens: Vec<usize> = self
                .versions
                .iter()
                .map(|(_, d)| d.map_or(0, <[u8]>::len))
                .collect();
            multi_version_size(&lens)
        }
    }

    /// Writes the image into `dst`, or returns `None` when it does not
    /// fit (the fill page is full).
    pub fn write(&self, dst: &mut [u8]) -> Option<usize> {
        if self.image_size() > dst.len() {
            return None;
        }
        let written = if self.is_single() {
            let (version, data) = self.versions[0];
            write_single_version(dst, self.key, self.kept_chain, version, data.unwrap())
        } else {
            write_multi_version(dst, self.key, self.kept_chain, &self.versions)
        };
        Some(written)
    }
}

#[derive(Debug)]
pub enum GatherOutcome<'g> {
    /// No observable version survives; drop the key.
    Dead { observed: u64 },
    /// Nothing useful can be done this pass (undecided insert head, or a
    /// chain that is entirely undecided with no decided base).
    Skip,
    Live(CompactedRecord<'g>),
}

/// Result of [`copy_and_compact`].
#[derive(Debug)]
pub enum CompactOutcome<'g> {
    Relocated {
        bytes: usize,
        record: CompactedRecord<'g>,
    },
    Dropped {
        observed: u64,
    },
    Skipped,
    /// `dst` cannot hold the image; the caller hands out a fresh fill
    /// page and retries.
    Full,
}

fn page_of(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Core gather: merges a head's own versions with its chain under the
/// horizon rules. `observed` is the head's newest word as loaded by the
/// caller (also the CAS expected value during installation).
pub fn gather_from_parts<'g>(
    key: u64,
    observed: u64,
    own: &[(u64, Option<&'g [u8]>)],
    horizon: &GcHorizon,
    guard: &'g Guard,
) -> GatherOutcome<'g> {
    let mut gathered: SmallVec<[(u64, Option<&'g [u8]>); 4]> = SmallVec::new();
    let mut chain_pages: SmallVec<[usize; 2]> = SmallVec::new();
    let mut undecided = false;

    for entry in ChainIter::from_word(observed, guard) {
        let page = page_of(entry.addr());
        if !chain_pages.contains(&page) {
            chain_pages.push(page);
        }
        if entry.aborted() {
            continue;
        }
        if !horizon.decided(entry.version()) {
            undecided = true;
            continue;
        }
        let data = if entry.is_tombstone() {
            None
        } else {
            Some(entry.tuple())
        };
        gathered.push((entry.version(), data));
    }
    gathered.extend_from_slice(own);

    // A retained chain can re-surface versions already inlined by an
    // earlier pass; keep one copy of each.
    gathered.sort_by(|a, b| b.0.cmp(&a.0));
    gathered.dedup_by_key(|(v, _)| *v);

    // Horizon cutoff: drop everything below the first version that is
    // still observable.
    if let Some(first_old) = gathered
        .iter()
        .position(|&(v, _)| v < horizon.lowest_active())
    {
        gathered.truncate(first_old + 1);
    }

    if !undecided {
        if gathered.is_empty() {
            return GatherOutcome::Dead { observed };
        }
        if gathered.len() == 1
            && gathered[0].1.is_none()
            && gathered[0].0 < horizon.lowest_active()
        {
            return GatherOutcome::Dead { observed };
        }
    } else if gathered.is_empty() {
        // Only undecided work exists; an image needs at least one version.
        return GatherOutcome::Skip;
    }

    GatherOutcome::Live(CompactedRecord {
        key,
        versions: gathered,
        kept_chain: if undecided { observed } else { 0 },
        blocked_pages: if undecided { chain_pages } else { SmallVec::new() },
        observed,
    })
}

/// Gathers a head record (main image or log-insert head) for compaction.
pub fn gather_record<'g>(
    view: &RecordView<'g>,
    horizon: &GcHorizon,
    guard: &'g Guard,
) -> GatherOutcome<'g> {
    if let RecordView::Insert(v) = view {
        if v.aborted() {
            // The insert never happened; anything chained through it is
            // from transactions that saw the slot and lost.
            let observed = view.load_newest();
            return gather_from_parts(view.key(), observed, &[], horizon, guard);
        }
        if !horizon.decided(v.version()) {
            return GatherOutcome::Skip;
        }
    }
    let observed = view.load_newest();
    match newest::decode(observed) {
        newest::Newest::ForwardMain(_) | newest::Newest::ForwardColumn(_) | newest::Newest::Gone => {
            // Already relocated by an earlier pass.
            GatherOutcome::Skip
        }
        _ => gather_from_parts(view.key(), observed, &view.own_versions(), horizon, guard),
    }
}

/// Writes a compacted copy of `view` into `dst`.
///
/// Mirrors the gather/write split for callers that do not need the
/// intermediate: drops stale versions, inlines decided chain entries,
/// reports `Full` when `dst` cannot hold the image.
pub fn copy_and_compact<'g>(
    view: &RecordView<'g>,
    horizon: &GcHorizon,
    dst: &mut [u8],
    guard: &'g Guard,
) -> CompactOutcome<'g> {
    match gather_record(view, horizon, guard) {
        GatherOutcome::Dead { observed } => CompactOutcome::Dropped { observed },
        GatherOutcome::Skip => CompactOutcome::Skipped,
        GatherOutcome::Live(record) => match record.write(dst) {
            Some(bytes) => CompactOutcome::Relocated { bytes, record },
            None => CompactOutcome::Full,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pin;
    use crate::record::{write_multi_version, MultiVersionView};

    #[repr(align(8))]
    struct Aligned([u8; 512]);

    fn horizon(lowest: u64) -> GcHorizon {
        GcHorizon::new(lowest, &[])
    }

    fn multi(buf: &mut Aligned, key: u64, versions: &[(u64, Option<&[u8]>)]) -> usize {
        write_multi_version(&mut buf.0, key, 0, versions);
        buf.0.as_ptr() as usize
    }

    #[test]
    fn stale_versions_are_dropped_keeping_one() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let addr = multi(
            &mut buf,
            1,
            &[
                (10, Some(b"ten".as_slice())),
                (6, Some(b"six".as_slice())),
                (4, Some(b"four".as_slice())),
                (2, Some(b"two".as_slice())),
            ],
        );
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        match gather_record(&view, &horizon(7), &guard) {
            GatherOutcome::Live(rec) => {
                // 10 (>= 7) survives, 6 is the watermark fallback, 4 and
                // 2 are unobservable.
                let kept: Vec<u64> = rec.versions.iter().map(|&(v, _)| v).collect();
                assert_eq!(kept, vec![10, 6]);
                assert_eq!(rec.kept_chain, 0);
            }
            other => panic!("expected live record, got {other:?}"),
        };
    }

    #[test]
    fn stale_tombstone_only_record_is_dead() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let addr = multi(&mut buf, 2, &[(5, None)]);
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        assert!(matches!(
            gather_record(&view, &horizon(9), &guard),
            GatherOutcome::Dead { .. }
        ));
    }

    #[test]
    fn fresh_tombstone_survives() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let addr = multi(&mut buf, 3, &[(12, None), (8, Some(b"x".as_slice()))]);
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        match gather_record(&view, &horizon(9), &guard) {
            GatherOutcome::Live(rec) => {
                let kept: Vec<u64> = rec.versions.iter().map(|&(v, _)| v).collect();
                assert_eq!(kept, vec![12, 8]);
            }
            other => panic!("expected live record, got {other:?}"),
        };
    }

    #[test]
    fn compacted_single_version_uses_compact_layout() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let addr = multi(
            &mut buf,
            4,
            &[(9, Some(b"live".as_slice())), (3, Some(b"old".as_slice()))],
        );
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        let mut dst = Aligned([0u8; 512]);
        match copy_and_compact(&view, &horizon(20), &mut dst.0, &guard) {
            CompactOutcome::Relocated { bytes, record } => {
                assert!(record.is_single());
                assert_eq!(bytes, single_version_size(4));
                let new = unsafe { RecordView::from_addr(dst.0.as_ptr() as usize, &guard) };
                assert_eq!(new.key(), 4);
                match new {
                    RecordView::Single(s) => {
                        assert_eq!(s.version(), 9);
                        assert_eq!(s.tuple(), b"live");
                    }
                    other => panic!("expected single-version image, got {other:?}"),
                }
            }
            other => panic!("expected relocation, got {other:?}"),
        };
    }

    #[test]
    fn undersized_destination_reports_full() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let addr = multi(&mut buf, 5, &[(9, Some(b"0123456789abcdef".as_slice()))]);
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        let mut tiny = [0u8; 16];
        assert!(matches!(
            copy_and_compact(&view, &horizon(1), &mut tiny, &guard),
            CompactOutcome::Full
        ));
    }

    #[test]
    fn exact_fit_destination_succeeds() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let addr = multi(&mut buf, 5, &[(9, Some(b"0123456789abcdef".as_slice()))]);
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        let need = single_version_size(16);
        let mut dst = Aligned([0u8; 512]);
        let exact = &mut dst.0[..need];
        match copy_and_compact(&view, &horizon(1), exact, &guard) {
            CompactOutcome::Relocated { bytes, .. } => assert_eq!(bytes, need),
            other => panic!("expected exact fit to relocate, got {other:?}"),
        };
    }

    #[test]
    fn clean_record_round_trips_through_compaction() {
        let guard = pin();
        let mut buf = Aligned([0u8; 512]);
        let versions: &[(u64, Option<&[u8]>)] =
            &[(9, Some(b"new".as_slice())), (7, Some(b"old".as_slice()))];
        let addr = multi(&mut buf, 6, versions);
        let view = unsafe { RecordView::from_addr(addr, &guard) };
        let mut dst = Aligned([0u8; 512]);
        match copy_and_compact(&view, &horizon(7), &mut dst.0, &guard) {
            CompactOutcome::Relocated { .. } => {
                let new = unsafe { MultiVersionView::from_addr(dst.0.as_ptr() as usize) };
                assert_eq!(new.versions(), &[9, 7]);
                assert_eq!(new.version_data(0), Some(b"new".as_slice()));
                assert_eq!(new.version_data(1), Some(b"old".as_slice()));
            }
            other => panic!("expected relocation, got {other:?}"),
        };
    }
}
