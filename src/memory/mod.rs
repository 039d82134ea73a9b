//! # Page Manager
//!
//! Pre-sized pool of zeroed, page-aligned 2 MiB pages. Every page-backed
//! structure in the engine (log pages, row-store and column-map main
//! pages) draws from this pool and returns pages through epoch-based
//! reclamation.
//!
//! ## Pool Discipline
//!
//! The pool is created with a fixed budget and never grows. `alloc`
//! hands out a page that is guaranteed to be all zero bytes; both the log
//! (zero entry header terminates iteration) and main pages (zero used
//! length) rely on that. `free` does not recycle the page immediately:
//! the page is enqueued against the current epoch and re-zeroed and
//! returned to the free list only once every reader that could still
//! hold a pointer into it has left its critical section.
//!
//! ## Epoch Protocol
//!
//! Every public entry point into the storage pins an epoch guard
//! ([`crossbeam_epoch::pin`]) for the duration of the operation. Readers
//! therefore never observe a page being reused under them: reclamation of
//! a retired page is deferred until all guards pinned at or before its
//! retirement epoch have dropped.
//!
//! ## Alignment
//!
//! Pages are allocated with `PAGE_SIZE` alignment. Interior pointers
//! (column-map entries, log records) recover their owning page with
//! `addr & !(PAGE_SIZE - 1)`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_epoch::Guard;
use parking_lot::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{Result, StorageError};

pub use crossbeam_epoch::pin;

/// A raw, page-aligned, non-null pointer to a pool-owned page.
///
/// `PagePtr` does not own the page; ownership stays with the
/// [`PageManager`]. Holders access the page only inside an epoch-pinned
/// critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePtr(NonNull<u8>);

unsafe impl Send for PagePtr {}
unsafe impl Sync for PagePtr {}

impl PagePtr {
    /// # Safety
    /// `addr` must be the start address of a live pool page.
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr % PAGE_SIZE == 0);
        PagePtr(NonNull::new_unchecked(addr as *mut u8))
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Recovers the page containing an interior pointer.
    ///
    /// # Safety
    /// `addr` must point into a live pool page.
    pub unsafe fn containing(addr: usize) -> Self {
        Self::from_addr(addr & !(PAGE_SIZE - 1))
    }

    /// # Safety
    /// The caller must hold an epoch guard pinned before the page could
    /// have been retired, and must not alias a concurrent `&mut`.
    pub unsafe fn as_slice<'g>(self, _guard: &'g Guard) -> &'g [u8] {
        std::slice::from_raw_parts(self.0.as_ptr(), PAGE_SIZE)
    }

    /// # Safety
    /// The caller must have exclusive write access to the page (freshly
    /// allocated, not yet published).
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.0.as_ptr(), PAGE_SIZE)
    }
}

struct PoolInner {
    free: Mutex<Vec<usize>>,
    all: Vec<usize>,
}

impl PoolInner {
    fn release(&self, addr: usize) {
        // Re-zero before the page becomes allocatable again; alloc()
        // promises an all-zero page.
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, PAGE_SIZE);
        }
        self.free.lock().push(addr);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        for &addr in &self.all {
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Owner of all pages in the engine.
#[derive(Clone)]
pub struct PageManager {
    inner: Arc<PoolInner>,
}

impl PageManager {
    /// Pre-allocates `pages` zeroed pages.
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let mut all = Vec::with_capacity(pages);
        for _ in 0..pages {
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null(), "page pool allocation failed");
            all.push(ptr as usize);
        }
        let free = Mutex::new(all.clone());
        PageManager {
            inner: Arc::new(PoolInner { free, all }),
        }
    }

    /// Returns a zeroed page, or `OutOfMemory` when the pool is drained.
    pub fn alloc(&self) -> Result<PagePtr> {
        let addr = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or(StorageError::OutOfMemory("page pool exhausted"))?;
        Ok(unsafe { PagePtr::from_addr(addr) })
    }

    /// Retires a page that may still be visible to concurrent readers.
    ///
    /// The page returns to the free list only after all epochs pinned at
    /// or before the current one have drained.
    pub fn free(&self, page: PagePtr, guard: &Guard) {
        let inner = Arc::clone(&self.inner);
        let addr = page.addr();
        unsafe {
            guard.defer_unchecked(move || inner.release(addr));
        }
    }

    /// Returns a page that was never published to any reader.
    ///
    /// Used by GC when it abandons a fill page it just allocated.
    pub fn free_unpublished(&self, page: PagePtr) {
        self.inner.release(page.addr());
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.all.len()
    }
}
