//! # Engine Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (2 MiB)
//!       │
//!       ├─> LOG_PAGE_HEADER_SIZE (16 bytes: next ptr + offset + pad)
//!       │
//!       ├─> MAX_LOG_ENTRY_SIZE (derived: largest payload one entry can
//!       │     carry; anything bigger can never be appended)
//!       │
//!       ├─> MAIN_PAGE_HEADER_SIZE (8 bytes: used length)
//!       │
//!       └─> MAX_COLUMN_RECORDS
//!             Upper bound on rows in one column-map page. The header
//!             arrays (key, valid-from, valid-to, newest) cost 32 bytes
//!             per row, so the bound also caps header growth.
//!
//! CUCKOO_HASH_FUNCTIONS (3) × CUCKOO_BUCKET_SLOTS (4)
//!       │
//!       └─> Each lookup probes at most 12 slots. Runtime inserts claim a
//!           free slot among those 12; displacement happens only in the
//!           GC-side modifier rebuild.
//!
//! MAX_ACTIVE_TRANSACTIONS (64)
//!       │
//!       └─> Fixed slot array in the commit manager. The lowest-active-
//!           version watermark is an O(64) sweep over these slots.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `PAGE_SIZE` is a power of two (interior pointers recover their page
//!    by masking the address).
//! 2. `LOG_PAGE_HEADER_SIZE` and `LOG_ENTRY_HEADER_SIZE` are multiples of
//!    `LOG_ENTRY_ALIGN`, so every reserved offset stays 8-aligned.
//! 3. The column-map header arrays leave room in a page for actual columns.

/// Size of every page handed out by the page manager, in bytes.
///
/// Pages are allocated with this alignment as well, so the owning page of
/// any interior pointer is `addr & !(PAGE_SIZE - 1)`.
pub const PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Log page header: next-page pointer (8) + used offset (4) + padding (4).
pub const LOG_PAGE_HEADER_SIZE: usize = 16;

/// Per-entry log header: offset word (4, LSB = unsealed) + size (4).
pub const LOG_ENTRY_HEADER_SIZE: usize = 8;

/// Alignment of every log entry. Record images start 8-aligned so their
/// u64 fields (key, version, pointers) can be accessed atomically.
pub const LOG_ENTRY_ALIGN: usize = 8;

/// Largest payload a single log append can carry.
pub const MAX_LOG_ENTRY_SIZE: usize = PAGE_SIZE - LOG_PAGE_HEADER_SIZE - LOG_ENTRY_HEADER_SIZE;

/// Main page header: used length (8 bytes, little-endian u64).
pub const MAIN_PAGE_HEADER_SIZE: usize = 8;

/// Upper bound on rows stored in one column-map page.
pub const MAX_COLUMN_RECORDS: usize = 8192;

/// Number of independent hash functions of the cuckoo table.
pub const CUCKOO_HASH_FUNCTIONS: usize = 3;

/// Slots per cuckoo bucket.
pub const CUCKOO_BUCKET_SLOTS: usize = 4;

/// Default cuckoo capacity in slots. Must be a power of two; bucket
/// selection masks the hash with `capacity / CUCKOO_BUCKET_SLOTS - 1`.
pub const CUCKOO_DEFAULT_CAPACITY: usize = 1 << 16;

/// Load factor (in percent) above which the modifier rebuild grows the
/// cuckoo table.
pub const CUCKOO_GROW_LOAD_PCT: usize = 70;

/// Maximum number of concurrently active transactions tracked by the
/// commit manager's slot array.
pub const MAX_ACTIVE_TRANSACTIONS: usize = 64;

/// Default number of worker threads for a parallel scan.
pub const SCAN_DEFAULT_THREADS: usize = 4;

/// Interval between passes of the background garbage collection driver,
/// in milliseconds.
pub const GC_INTERVAL_MS: u64 = 1_000;

const _: () = assert!(
    PAGE_SIZE.is_power_of_two(),
    "PAGE_SIZE must be a power of two so page starts can be recovered by masking"
);

const _: () = assert!(
    LOG_PAGE_HEADER_SIZE % LOG_ENTRY_ALIGN == 0 && LOG_ENTRY_HEADER_SIZE % LOG_ENTRY_ALIGN == 0,
    "log header sizes must keep entry offsets 8-aligned"
);

const _: () = assert!(
    CUCKOO_DEFAULT_CAPACITY.is_power_of_two(),
    "cuckoo capacity must be a power of two for mask-based bucket selection"
);

const _: () = assert!(
    MAX_COLUMN_RECORDS * 32 < PAGE_SIZE / 2,
    "column-map header arrays must leave at least half a page for columns"
);
