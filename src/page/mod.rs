//! Main-page formats. A table's main storage is a list of pages in one
//! of two physical layouts:
//!
//! - [`row_store`]: packed record images, cheap point access, the
//!   default GC target.
//! - [`column_map`]: per-attribute arrays with a shared heap, built for
//!   predicate-pushdown scans and aggregation.

pub mod column_map;
pub mod row_store;

pub use column_map::{ColumnEntryRef, ColumnPageBuilder, ColumnPageView};
pub use row_store::{FillWriter, GcPageState, RowStorePage};

/// Physical layout of a table's main pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainFormat {
    RowMajor,
    ColumnMajor,
}
