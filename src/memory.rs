//! Host memory allocation for filter calls
//!
//! Filters allocate scratch memory through the `HostAllocator` installed in
//! their `InvokeContext`. `MemoryTracker` wraps another allocator and keeps
//! a ledger of live bytes and the high-water mark, for `--track_memory`.
//!
//! Filters may allocate from their own worker threads, so allocators are
//! `Send + Sync`; every ledger access goes through a single mutex.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Result, RunGenError};

/// Alignment of every block handed to a filter.
pub const HOST_ALIGNMENT: usize = 64;

/// Allocator used by filters for host memory.
pub trait HostAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `HOST_ALIGNMENT`.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Release a block previously returned by `allocate`.
    fn free(&self, ptr: NonNull<u8>) -> Result<()>;
}

/// Allocator backed by the global Rust allocator.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    // Layouts of live blocks, keyed by address; dealloc needs them back.
    live: Mutex<HashMap<usize, Layout>>,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), HOST_ALIGNMENT)
            .map_err(|_| RunGenError::Shape(format!("allocation of {} bytes is too large", size)))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let layout = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| {
                RunGenError::TrackingInvariant(format!(
                    "free of pointer {:p} not allocated by this allocator",
                    ptr
                ))
            })?;

        // SAFETY: ptr came from alloc::alloc with exactly this layout and
        // has just been removed from the live set, so it is freed once.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ledger {
    allocated: u64,
    highwater: u64,
    sizes: HashMap<usize, usize>,
}

/// Allocator wrapper that records live bytes and the high-water mark.
pub struct MemoryTracker {
    inner: Arc<dyn HostAllocator>,
    ledger: Mutex<Ledger>,
}

impl MemoryTracker {
    /// Track allocations made through `inner`.
    pub fn new(inner: Arc<dyn HostAllocator>) -> Self {
        Self {
            inner,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> u64 {
        self.ledger().allocated
    }

    /// Largest value `allocated()` has reached since creation or the last
    /// `highwater_reset()`.
    pub fn highwater(&self) -> u64 {
        self.ledger().highwater
    }

    /// Restart the high-water mark from the current allocation total, so
    /// earlier peaks (e.g. a warm-up call) are not counted.
    pub fn highwater_reset(&self) {
        let mut ledger = self.ledger();
        ledger.highwater = ledger.allocated;
    }

    /// Number of blocks allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.ledger().sizes.len()
    }
}

impl HostAllocator for MemoryTracker {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let mut ledger = self.ledger();
        let ptr = self.inner.allocate(size)?;

        let key = ptr.as_ptr() as usize;
        if ledger.sizes.contains_key(&key) {
            return Err(RunGenError::TrackingInvariant(format!(
                "allocator returned pointer {:p} that is already live",
                ptr
            )));
        }
        ledger.sizes.insert(key, size);
        ledger.allocated += size as u64;
        if ledger.highwater < ledger.allocated {
            ledger.highwater = ledger.allocated;
        }
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut ledger = self.ledger();
        let size = ledger.sizes.remove(&(ptr.as_ptr() as usize)).ok_or_else(|| {
            RunGenError::TrackingInvariant(format!("free of untracked pointer {:p}", ptr))
        })?;
        ledger.allocated -= size as u64;
        self.inner.free(ptr)
    }
}

impl Drop for MemoryTracker {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            log::warn!(
                "Memory tracker dropped with {} outstanding allocation(s) ({} bytes)",
                outstanding,
                self.allocated()
            );
        }
    }
}
