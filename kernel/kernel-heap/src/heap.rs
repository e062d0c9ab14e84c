//! The heap arena: chunk headers, the address-ordered all list and the
//! size-class free lists. See the crate docs for the memory layout.

use core::ptr::{self, NonNull};
use kernel_addresses::{align_down, align_up};

/// Payload alignment; every pointer handed out is a multiple of this.
pub const ALIGNMENT: u32 = 16;

/// Smallest payload ever allocated. Requests below this are rounded up.
pub const MIN_PAYLOAD: u32 = 16;

/// Number of power-of-two size classes.
pub const NUM_BUCKETS: usize = 32;

/// Offset value meaning "no chunk".
const NONE: u32 = u32::MAX;

/// Byte pattern written over fresh allocations.
const FILL_ALLOC: u8 = 0xAA;

/// Byte pattern written over headers of chunks absorbed by coalescing.
const FILL_DEAD: u8 = 0xDD;

/// Header at the start of every chunk. All links are byte offsets into the
/// arena.
///
/// A chunk's payload length is **derived**, never stored: it is the distance
/// to the address-order successor minus the header size.
#[repr(C, align(16))]
pub struct ChunkHeader {
    /// Address-order circular list over every chunk.
    all_next: u32,
    all_prev: u32,
    /// Bucket circular list; meaningful only while the chunk is free.
    free_next: u32,
    free_prev: u32,
    /// Non-zero while allocated (or for the sentinels).
    used: u32,
}

/// Header size in bytes (padded to alignment).
pub const HEADER_SIZE: u32 = size_of::<ChunkHeader>() as u32;

const _: () = {
    assert!(HEADER_SIZE == 32);
    assert!(align_of::<ChunkHeader>() as u32 == ALIGNMENT);
};

/// Current accounting snapshot.
///
/// The three counters always sum to the aligned arena size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapStats {
    /// Payload bytes sitting in free chunks.
    pub bytes_free: usize,
    /// Payload bytes handed out to callers.
    pub bytes_used: usize,
    /// Bytes consumed by chunk headers, sentinels included.
    pub bytes_metadata: usize,
}

/// The heap arena. Not synchronized; [`LockedHeap`](crate::LockedHeap) wraps
/// it for shared use.
pub struct Heap {
    base: NonNull<u8>,
    /// Aligned arena length; offset of the byte past the `last` sentinel.
    end: u32,
    /// Free-list head offsets by size class, [`NONE`] when empty.
    buckets: [u32; NUM_BUCKETS],
    /// Offset of the `first` sentinel (always 0).
    first: u32,
    /// Offset of the `last` sentinel.
    last: u32,
    bytes_free: usize,
    bytes_used: usize,
    bytes_metadata: usize,
}

// Safety: the arena is exclusively owned; shared access goes through
// LockedHeap, whose lock provides the mutual exclusion.
unsafe impl Send for Heap {}

/// Size class of a payload length: `floor(log2(len))`, clamped for the
/// degenerate zero-length chunks a split can leave behind.
#[inline]
const fn size_class(len: u32) -> usize {
    if len < 2 { 0 } else { len.ilog2() as usize }
}

impl Heap {
    /// Take ownership of `[base, base + size)` and carve the sentinel
    /// layout into it. Returns `None` when the aligned region cannot hold
    /// the sentinels plus one minimal chunk.
    ///
    /// # Safety
    /// - The region must be valid, writable and exclusive to the heap for
    ///   its whole lifetime.
    /// - `base` must be aligned to [`ALIGNMENT`].
    pub unsafe fn from_region(base: NonNull<u8>, size: u32) -> Option<Self> {
        let end = align_down(size, ALIGNMENT);
        if end < 3 * HEADER_SIZE + MIN_PAYLOAD {
            return None;
        }
        debug_assert_eq!(base.as_ptr() as usize % ALIGNMENT as usize, 0);

        let first = 0;
        let second = HEADER_SIZE;
        let last = end - HEADER_SIZE;

        let mut heap = Self {
            base,
            end,
            buckets: [NONE; NUM_BUCKETS],
            first,
            last,
            bytes_free: 0,
            bytes_used: 0,
            bytes_metadata: (3 * HEADER_SIZE) as usize,
        };

        unsafe {
            heap.write_header(first, ChunkHeader {
                all_next: second,
                all_prev: last,
                free_next: NONE,
                free_prev: NONE,
                used: 1,
            });
            heap.write_header(second, ChunkHeader {
                all_next: last,
                all_prev: first,
                free_next: NONE,
                free_prev: NONE,
                used: 0,
            });
            heap.write_header(last, ChunkHeader {
                all_next: first,
                all_prev: second,
                free_next: NONE,
                free_prev: NONE,
                used: 1,
            });
        }
        heap.push_free(second);
        Some(heap)
    }

    /// Allocate `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// The payload is filled with `0xAA`. Returns `None` when no free chunk
    /// is large enough; a failed call changes nothing.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let Ok(size) = u32::try_from(size) else {
            return None;
        };
        // No chunk can exceed the arena; also keeps align_up from overflowing.
        if size > self.end {
            return None;
        }
        let size = align_up(size.max(1), ALIGNMENT).max(MIN_PAYLOAD);

        // First bucket whose smallest possible member still fits.
        let min_class = size_class(size - 1) + 1;
        let chunk = (min_class..NUM_BUCKETS).find_map(|class| {
            let head = self.buckets[class];
            (head != NONE).then_some(head)
        })?;

        let len = self.chunk_len(chunk);
        debug_assert!(len >= size);
        self.remove_free(chunk);
        self.bytes_free -= len as usize;

        // Split off the remainder as a new free chunk when one fits behind
        // the allocation.
        if size + HEADER_SIZE <= len {
            let rest = chunk + HEADER_SIZE + size;
            unsafe {
                self.write_header(rest, ChunkHeader {
                    all_next: self.all_next(chunk),
                    all_prev: chunk,
                    free_next: NONE,
                    free_prev: NONE,
                    used: 0,
                });
                self.set_all_prev(self.all_next(chunk), rest);
                self.set_all_next(chunk, rest);
            }
            self.bytes_metadata += HEADER_SIZE as usize;
            let rest_len = self.chunk_len(rest);
            self.push_free(rest);
            self.bytes_free += rest_len as usize;
        }

        let payload_len = self.chunk_len(chunk);
        unsafe {
            self.set_used(chunk, 1);
        }
        self.bytes_used += payload_len as usize;

        let payload = unsafe { self.base.as_ptr().add((chunk + HEADER_SIZE) as usize) };
        // Poison fresh memory so use-before-init shows a pattern.
        unsafe {
            ptr::write_bytes(payload, FILL_ALLOC, size as usize);
        }
        NonNull::new(payload)
    }

    /// Return `ptr` (previously returned by [`allocate`](Self::allocate)) to
    /// the heap, coalescing with free address-order neighbors immediately.
    ///
    /// # Panics
    /// If `ptr` does not point at the payload of a live allocation (double
    /// free, foreign pointer).
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        assert!(
            addr > base + HEADER_SIZE as usize && addr < base + self.end as usize,
            "freed pointer outside the heap region"
        );
        let chunk = (addr - base) as u32 - HEADER_SIZE;
        assert!(
            unsafe { self.used(chunk) } != 0,
            "double free or pointer not allocated by this heap"
        );

        self.bytes_used -= self.chunk_len(chunk) as usize;
        unsafe {
            self.set_used(chunk, 0);
        }

        // Absorb the next chunk if it is free; the chunk's derived length
        // then covers it automatically.
        let next = unsafe { self.all_next(chunk) };
        if unsafe { self.used(next) } == 0 {
            self.bytes_free -= self.chunk_len(next) as usize;
            self.remove_free(next);
            unsafe {
                self.unlink_all(next);
                self.scrub_header(next);
            }
            self.bytes_metadata -= HEADER_SIZE as usize;
        }

        // Fold into a free predecessor, or enter a bucket on our own.
        let prev = unsafe { self.all_prev(chunk) };
        if unsafe { self.used(prev) } == 0 {
            self.bytes_free -= self.chunk_len(prev) as usize;
            self.remove_free(prev);
            unsafe {
                self.unlink_all(chunk);
                self.scrub_header(chunk);
            }
            self.bytes_metadata -= HEADER_SIZE as usize;
            let merged = self.chunk_len(prev);
            self.push_free(prev);
            self.bytes_free += merged as usize;
        } else {
            let len = self.chunk_len(chunk);
            self.push_free(chunk);
            self.bytes_free += len as usize;
        }
    }

    /// Accounting snapshot.
    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_free: self.bytes_free,
            bytes_used: self.bytes_used,
            bytes_metadata: self.bytes_metadata,
        }
    }

    /// Walk every list and assert the heap is internally consistent.
    ///
    /// Verifies address ordering and link symmetry of the all list, bucket
    /// membership and link symmetry of every free list, and that the three
    /// byte counters sum to the arena size. Debug/diagnostic aid; panics on
    /// the first inconsistency.
    pub fn check(&self) {
        // All list: ascending offsets, symmetric links, counters add up.
        let mut free_sum = 0usize;
        let mut used_sum = 0usize;
        let mut headers = 0usize;
        let mut chunk = self.first;
        loop {
            let next = unsafe { self.all_next(chunk) };
            assert_eq!(unsafe { self.all_prev(next) }, chunk, "asymmetric all link");
            headers += HEADER_SIZE as usize;
            if chunk != self.last {
                assert!(next > chunk, "all list not in address order");
                let len = self.chunk_len(chunk);
                if unsafe { self.used(chunk) } == 0 {
                    free_sum += len as usize;
                } else if chunk != self.first {
                    used_sum += len as usize;
                }
            }
            if chunk == self.last {
                assert_eq!(next, self.first, "last sentinel must close the cycle");
                break;
            }
            chunk = next;
        }
        assert_eq!(free_sum, self.bytes_free, "free counter out of sync");
        assert_eq!(used_sum, self.bytes_used, "used counter out of sync");
        assert_eq!(headers, self.bytes_metadata, "metadata counter out of sync");
        assert_eq!(
            free_sum + used_sum + headers,
            self.end as usize,
            "counters must cover the arena"
        );

        // Free lists: members are free, sized for their bucket, linked
        // symmetrically.
        for (class, &head) in self.buckets.iter().enumerate() {
            if head == NONE {
                continue;
            }
            let mut chunk = head;
            loop {
                assert_eq!(unsafe { self.used(chunk) }, 0, "used chunk on a free list");
                assert_eq!(
                    size_class(self.chunk_len(chunk)),
                    class,
                    "chunk in the wrong bucket"
                );
                let next = unsafe { self.free_next(chunk) };
                assert_eq!(unsafe { self.free_prev(next) }, chunk, "asymmetric free link");
                chunk = next;
                if chunk == head {
                    break;
                }
            }
        }
    }

    /// Derived payload length: distance to the address-order successor.
    fn chunk_len(&self, chunk: u32) -> u32 {
        if chunk == self.last {
            return 0;
        }
        (unsafe { self.all_next(chunk) }) - chunk - HEADER_SIZE
    }

    fn header_ptr(&self, chunk: u32) -> *mut ChunkHeader {
        debug_assert!(chunk + HEADER_SIZE <= self.end);
        debug_assert_eq!(chunk % ALIGNMENT, 0);
        unsafe { self.base.as_ptr().add(chunk as usize).cast() }
    }

    unsafe fn write_header(&mut self, chunk: u32, header: ChunkHeader) {
        unsafe { ptr::write(self.header_ptr(chunk), header) }
    }

    unsafe fn scrub_header(&mut self, chunk: u32) {
        unsafe {
            ptr::write_bytes(self.header_ptr(chunk).cast::<u8>(), FILL_DEAD, HEADER_SIZE as usize);
        }
    }

    unsafe fn all_next(&self, chunk: u32) -> u32 {
        unsafe { (*self.header_ptr(chunk)).all_next }
    }

    unsafe fn all_prev(&self, chunk: u32) -> u32 {
        unsafe { (*self.header_ptr(chunk)).all_prev }
    }

    unsafe fn free_next(&self, chunk: u32) -> u32 {
        unsafe { (*self.header_ptr(chunk)).free_next }
    }

    unsafe fn free_prev(&self, chunk: u32) -> u32 {
        unsafe { (*self.header_ptr(chunk)).free_prev }
    }

    unsafe fn used(&self, chunk: u32) -> u32 {
        unsafe { (*self.header_ptr(chunk)).used }
    }

    unsafe fn set_all_next(&mut self, chunk: u32, value: u32) {
        unsafe { (*self.header_ptr(chunk)).all_next = value }
    }

    unsafe fn set_all_prev(&mut self, chunk: u32, value: u32) {
        unsafe { (*self.header_ptr(chunk)).all_prev = value }
    }

    unsafe fn set_used(&mut self, chunk: u32, value: u32) {
        unsafe { (*self.header_ptr(chunk)).used = value }
    }

    /// Remove `chunk` from the all list (its neighbors become adjacent).
    unsafe fn unlink_all(&mut self, chunk: u32) {
        unsafe {
            let next = self.all_next(chunk);
            let prev = self.all_prev(chunk);
            self.set_all_next(prev, next);
            self.set_all_prev(next, prev);
        }
    }

    /// Insert `chunk` at the head of its size-class bucket.
    fn push_free(&mut self, chunk: u32) {
        let class = size_class(self.chunk_len(chunk));
        let head = self.buckets[class];
        unsafe {
            if head == NONE {
                (*self.header_ptr(chunk)).free_next = chunk;
                (*self.header_ptr(chunk)).free_prev = chunk;
            } else {
                let prev = self.free_prev(head);
                (*self.header_ptr(chunk)).free_next = head;
                (*self.header_ptr(chunk)).free_prev = prev;
                (*self.header_ptr(prev)).free_next = chunk;
                (*self.header_ptr(head)).free_prev = chunk;
            }
        }
        self.buckets[class] = chunk;
    }

    /// Unlink `chunk` from its bucket.
    fn remove_free(&mut self, chunk: u32) {
        let class = size_class(self.chunk_len(chunk));
        unsafe {
            let next = self.free_next(chunk);
            let prev = self.free_prev(chunk);
            if next == chunk {
                // sole member
                self.buckets[class] = NONE;
            } else {
                (*self.header_ptr(prev)).free_next = next;
                (*self.header_ptr(next)).free_prev = prev;
                if self.buckets[class] == chunk {
                    self.buckets[class] = next;
                }
            }
        }
    }
}
