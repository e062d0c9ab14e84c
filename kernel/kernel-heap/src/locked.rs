//! The shared heap handle: one spin lock around the arena.

use crate::heap::{Heap, HeapStats};
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::SpinLock;
use kernel_vmem::{LockedPageManager, PagingControl, PhysMapper};
use log::debug;

/// Failure while bringing the heap up.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum HeapInitError {
    /// The page manager could not supply the backing region.
    #[error("out of memory while reserving the heap region")]
    OutOfMemory,
    /// The backing region starts at virtual address zero.
    #[error("heap region must not start at address zero")]
    NullRegion,
    /// The region is too small for the sentinel layout.
    #[error("heap region too small")]
    RegionTooSmall,
    /// `init` was called on a live heap.
    #[error("heap is already initialized")]
    AlreadyInitialized,
}

/// A [`Heap`] behind a spin lock, usable from anywhere in the kernel.
///
/// Starts out empty; [`init`](Self::init) maps a fresh virtual region
/// through the page manager and hands it to the arena. Allocation before
/// init simply fails with `None`.
pub struct LockedHeap {
    inner: SpinLock<Option<Heap>>,
}

impl LockedHeap {
    /// An uninitialized heap. Usable as a `static` initializer.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Reserve `size` bytes (rounded up by the page manager's allocation
    /// granularity) and initialize the arena in them.
    ///
    /// # Errors
    /// See [`HeapInitError`]. On error the heap stays uninitialized.
    pub fn init<M: PhysMapper, P: PagingControl>(
        &self,
        pages: &LockedPageManager<M, P>,
        size: u32,
    ) -> Result<(), HeapInitError> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(HeapInitError::AlreadyInitialized);
        }

        let va = pages.allocate_pages(size).ok_or(HeapInitError::OutOfMemory)?;
        // The page manager maps size / PAGE_SIZE + 1 pages; use all of them.
        let mapped = (size / PAGE_SIZE + 1) * PAGE_SIZE;
        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(va.as_u32() as usize);
        let Some(base) = NonNull::new(ptr) else {
            pages.free_pages(va, size);
            return Err(HeapInitError::NullRegion);
        };

        match unsafe { Heap::from_region(base, mapped) } {
            Some(heap) => {
                debug!("heap initialized: {mapped} bytes at {va}");
                *guard = Some(heap);
                Ok(())
            }
            None => {
                pages.free_pages(va, size);
                Err(HeapInitError::RegionTooSmall)
            }
        }
    }

    /// Initialize the arena directly in `[base, base + size)`, bypassing the
    /// page manager. Intended for early boot and tests.
    ///
    /// # Errors
    /// See [`HeapInitError`].
    ///
    /// # Safety
    /// Same contract as [`Heap::from_region`].
    pub unsafe fn init_in_region(&self, base: NonNull<u8>, size: u32) -> Result<(), HeapInitError> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(HeapInitError::AlreadyInitialized);
        }
        let heap = unsafe { Heap::from_region(base, size) }.ok_or(HeapInitError::RegionTooSmall)?;
        *guard = Some(heap);
        Ok(())
    }

    /// Allocate `size` bytes. `None` before init or when the arena is full.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.with_lock(|heap| heap.as_mut()?.allocate(size))
    }

    /// Free a pointer returned by [`allocate`](Self::allocate).
    ///
    /// # Panics
    /// On double frees, foreign pointers, or when the heap was never
    /// initialized.
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        self.inner.with_lock(|heap| {
            let Some(heap) = heap.as_mut() else {
                panic!("deallocate on uninitialized heap");
            };
            heap.deallocate(ptr);
        });
    }

    /// Accounting snapshot; `None` before init.
    pub fn stats(&self) -> Option<HeapStats> {
        self.inner.with_lock(|heap| heap.as_ref().map(Heap::stats))
    }

    /// Run the consistency walk. No-op before init.
    pub fn check(&self) {
        self.inner.with_lock(|heap| {
            if let Some(heap) = heap.as_ref() {
                heap.check();
            }
        });
    }
}
