//! # deltastore: in-memory delta-main MVCC storage engine
//!
//! An embedded, multi-versioned key-value storage core for mixed
//! point-access / analytical workloads. Typed tuples keyed by 64-bit
//! integers, snapshot-isolated reads and writes, and high-throughput
//! parallel scans with predicate pushdown and aggregation.
//!
//! ## Architecture
//!
//! Writes never touch main storage directly. Every insert, update, and
//! delete appends a versioned record to a lock-free per-table **log**;
//! a cuckoo hash index maps each key to its record head, and per-record
//! newest-pointer chains order the versions. A copying **garbage
//! collector** periodically migrates cold data into **main pages**,
//! row-major or column-major, compacting away versions no live
//! snapshot can observe.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │           Storage / Transaction API           │
//! ├──────────────┬──────────────┬─────────────────┤
//! │  Cuckoo Hash │  Commit Mgr  │  Scan Processor │
//! ├──────────────┴──────┬───────┴─────────────────┤
//! │   Record views (log / row-main / column-main) │
//! ├──────────────┬──────┴───────┬─────────────────┤
//! │  Append Log  │  Main Pages  │    GC Driver    │
//! ├──────────────┴──────────────┴─────────────────┤
//! │      Page Manager (epoch-based reclaim)       │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use deltastore::{
//!     FieldType, Field, MainFormat, Schema, Storage, StorageConfig, Value,
//! };
//!
//! let storage = Storage::new(StorageConfig::default());
//! storage.create_table(
//!     "events",
//!     Schema::new(vec![
//!         Field::new("kind", FieldType::Int),
//!         Field::new("payload", FieldType::Text),
//!     ])?,
//!     MainFormat::ColumnMajor,
//! )?;
//!
//! let mut txn = storage.begin()?;
//! txn.insert("events", 1, &[Value::Int(7), Value::Text("hello")], true)?;
//! txn.commit();
//!
//! let txn = storage.begin()?;
//! let row = txn.get("events", 1)?;
//! ```
//!
//! ## Concurrency Model
//!
//! - Readers are lock-free end to end: hash lookups, version-chain
//!   walks, and scans run under epoch pins, never blocking on writers.
//! - Writers reserve log space with a fetch-add and publish with a
//!   single CAS on the record's newest pointer; first committer wins.
//! - GC runs per table, serialized by a per-table lock, and installs
//!   its results with forwards + an atomic page-list swap, so neither
//!   readers nor writers ever wait for it.
//!
//! ## Module Overview
//!
//! - [`memory`]: page pool with epoch-based reclamation
//! - [`log`]: lock-free append-only log with entry sealing
//! - [`index`]: cuckoo hash table and the GC-time insert map
//! - [`tuple`]: schema, typed values, packed tuple images
//! - [`record`]: polymorphic record views and compaction
//! - [`page`]: row-store and column-map main pages
//! - [`txn`]: snapshots and the commit manager
//! - [`gc`]: the compaction driver
//! - [`scan`]: predicate parsing, kernels, parallel scan processors
//! - [`store`]: tables, transactions, and the engine facade

pub mod config;
pub mod error;
pub mod gc;
pub mod index;
pub mod log;
pub mod memory;
pub mod page;
pub mod record;
pub mod scan;
pub mod store;
pub mod tuple;
pub mod txn;

pub use error::{Result, StorageError};
pub use page::MainFormat;
pub use scan::{
    AggFn, AggSpec, CmpOp, PredValue, ScanProjection, ScanQuery, ScanQueryBuilder, ScanRequest,
    ScanResult,
};
pub use store::{GetResult, Storage, StorageConfig, Table, Transaction};
pub use tuple::{Field, FieldType, OwnedValue, Schema, TupleDesc, TupleView, Value};
pub use txn::{SnapshotDescriptor, Version};
