//! # Storage Facade
//!
//! [`Storage`] owns the shared substrate (page pool, commit manager,
//! hash table, table registry) and hands out [`Transaction`]s, the only
//! way to read or write data.
//!
//! ## Transaction holder
//!
//! A transaction wraps a snapshot descriptor and tracks the log records
//! it published. Explicit `commit`/`abort` finish it; dropping an
//! unfinished transaction commits implicitly, so a holder can never
//! leak its commit-manager slot. Abort flags every published record
//! dead *before* releasing the slot: once a version stops being
//! inflight, its fate is already readable by everyone.

mod table;

pub use table::{GetResult, Table};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::config::GC_INTERVAL_MS;
use crate::error::{Result, StorageError};
use crate::gc;
use crate::index::CuckooHash;
use crate::memory::{pin, PageManager};
use crate::page::MainFormat;
use crate::record::LogRecordView;
use crate::scan::{ScanRequest, ScanResult};
use crate::tuple::{Schema, Value};
use crate::txn::{CommitManager, SnapshotDescriptor, Version};

pub struct StorageConfig {
    /// Page pool budget, in 2 MiB pages.
    pub pool_pages: usize,
    /// Initial cuckoo table capacity in slots.
    pub hash_capacity: usize,
    /// Background GC wakeup interval.
    pub gc_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            pool_pages: 64,
            hash_capacity: crate::config::CUCKOO_DEFAULT_CAPACITY,
            gc_interval: Duration::from_millis(GC_INTERVAL_MS),
        }
    }
}

struct StorageInner {
    page_manager: PageManager,
    commit_manager: CommitManager,
    hash: CuckooHash,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    next_table_id: AtomicU32,
    gc_interval: Duration,
    gc_thread: Mutex<Option<GcThread>>,
}

struct GcThread {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// The engine. Cloning shares the underlying storage.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Storage {
        Storage {
            inner: Arc::new(StorageInner {
                page_manager: PageManager::new(config.pool_pages),
                commit_manager: CommitManager::new(),
                hash: CuckooHash::with_capacity(config.hash_capacity),
                tables: RwLock::new(HashMap::new()),
                next_table_id: AtomicU32::new(1),
                gc_interval: config.gc_interval,
                gc_thread: Mutex::new(None),
            }),
        }
    }

    pub fn create_table(
        &self,
        name: impl Into<String>,
        schema: Schema,
        format: MainFormat,
    ) -> Result<Arc<Table>> {
        let name = name.into();
        let mut tables = self.inner.tables.write();
        if tables.contains_key(&name) {
            return Err(StorageError::InvalidArgument(format!(
                "table {name:?} already exists"
            )));
        }
        let id = self.inner.next_table_id.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(Table::new(
            id,
            name.clone(),
            schema,
            format,
            self.inner.page_manager.clone(),
        )?);
        info!(table = %name, id, ?format, "table created");
        tables.insert(name, Arc::clone(&table));
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.inner.tables.read().get(name).cloned()
    }

    fn require_table(&self, name: &str) -> Result<Arc<Table>> {
        self.table(name)
            .ok_or_else(|| StorageError::InvalidArgument(format!("unknown table {name:?}")))
    }

    /// Starts a transaction under a fresh snapshot.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let snapshot = self.inner.commit_manager.start_transaction()?;
        Ok(Transaction {
            storage: self,
            snapshot,
            writes: SmallVec::new(),
            finished: false,
        })
    }

    pub fn lowest_active_version(&self) -> Version {
        self.inner.commit_manager.lowest_active_version()
    }

    pub fn page_manager(&self) -> &PageManager {
        &self.inner.page_manager
    }

    /// One synchronous GC pass over every table.
    pub fn gc_once(&self) -> Result<()> {
        for table in self.inner.tables.read().values() {
            gc::collect_table(
                &self.inner.page_manager,
                &self.inner.hash,
                &self.inner.commit_manager,
                table,
            )?;
        }
        Ok(())
    }

    /// Spawns the background GC driver. Idempotent.
    pub fn start_gc(&self) {
        let mut slot = self.inner.gc_thread.lock();
        if slot.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&self.inner);
        let stop_flag = Arc::clone(&stop);
        let interval = self.inner.gc_interval;
        let handle = std::thread::Builder::new()
            .name("deltastore-gc".into())
            .spawn(move || {
                debug!("gc thread started");
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::park_timeout(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    for table in inner.tables.read().values() {
                        if let Err(err) = gc::collect_table(
                            &inner.page_manager,
                            &inner.hash,
                            &inner.commit_manager,
                            table,
                        ) {
                            warn!(table = table.id(), %err, "background gc pass failed");
                        }
                    }
                }
                debug!("gc thread stopped");
            })
            .expect("spawn gc thread");
        *slot = Some(GcThread { stop, handle });
    }

    /// Stops the background GC driver, blocking until it exits.
    pub fn stop_gc(&self) {
        let thread = self.inner.gc_thread.lock().take();
        if let Some(GcThread { stop, handle }) = thread {
            stop.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for StorageInner {
    fn drop(&mut self) {
        if let Some(GcThread { stop, handle }) = self.gc_thread.get_mut().take() {
            stop.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// A snapshot-scoped unit of work.
///
/// Destruction without an explicit `commit` or `abort` commits
/// implicitly.
pub struct Transaction<'a> {
    storage: &'a Storage,
    snapshot: SnapshotDescriptor,
    writes: SmallVec<[usize; 16]>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn snapshot(&self) -> &SnapshotDescriptor {
        &self.snapshot
    }

    /// Inserts `key`. With `fail_on_exists`, a live visible version is a
    /// `DuplicateKey`; without it, the insert upserts over whatever is
    /// there (conflict rules still apply).
    pub fn insert(
        &mut self,
        table: &str,
        key: u64,
        values: &[Value<'_>],
        fail_on_exists: bool,
    ) -> Result<()> {
        let table = self.storage.require_table(table)?;
        let guard = pin();
        let addr = table.insert(
            key,
            values,
            fail_on_exists,
            &self.storage.inner.hash,
            &self.snapshot,
            &guard,
        )?;
        self.writes.push(addr);
        Ok(())
    }

    pub fn update(&mut self, table: &str, key: u64, values: &[Value<'_>]) -> Result<()> {
        let table = self.storage.require_table(table)?;
        let guard = pin();
        let addr = table.update(key, values, &self.storage.inner.hash, &self.snapshot, &guard)?;
        self.writes.push(addr);
        Ok(())
    }

    /// Writes a tombstone. The key stays readable for older snapshots
    /// until GC reclaims it.
    pub fn remove(&mut self, table: &str, key: u64) -> Result<()> {
        let table = self.storage.require_table(table)?;
        let guard = pin();
        let addr = table.remove(key, &self.storage.inner.hash, &self.snapshot, &guard)?;
        self.writes.push(addr);
        Ok(())
    }

    /// Point lookup. `None` for absent or tombstoned keys.
    pub fn get(&self, table: &str, key: u64) -> Result<Option<GetResult>> {
        let table = self.storage.require_table(table)?;
        let guard = pin();
        Ok(table.get(key, &self.storage.inner.hash, &self.snapshot, &guard))
    }

    /// Parallel snapshot scan; see [`crate::scan`].
    pub fn scan(&self, table: &str, request: &ScanRequest) -> Result<ScanResult> {
        let table = self.storage.require_table(table)?;
        let guard = pin();
        table.scan(request, &self.snapshot, &guard)
    }

    pub fn commit(mut self) {
        self.finish_commit();
    }

    pub fn abort(mut self) {
        // Flag every published record dead, newest first, then release
        // the slot: once the version leaves the inflight sets its state
        // is already decided in storage.
        let _guard = pin();
        for &addr in self.writes.iter().rev() {
            let view = unsafe { LogRecordView::from_addr(addr) };
            view.set_aborted();
        }
        self.storage.inner.commit_manager.finish(&self.snapshot);
        self.finished = true;
    }

    fn finish_commit(&mut self) {
        if !self.finished {
            self.storage.inner.commit_manager.finish(&self.snapshot);
            self.finished = true;
        }
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        self.finish_commit();
    }
}
