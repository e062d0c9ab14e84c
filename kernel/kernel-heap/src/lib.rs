//! # Kernel Heap
//!
//! A boundary-tag heap with segregated free lists over one virtually
//! contiguous region.
//!
//! ## Layout
//!
//! Every chunk starts with a 32-byte [`heap::ChunkHeader`] followed by its
//! payload. Chunk sizes are never stored: a chunk ends where the next chunk
//! in address order begins, so growing or shrinking a chunk is a matter of
//! relinking. Three bookkeeping chunks frame the region:
//!
//! ```text
//! +-------+--------+------------------------------+------+
//! | first | second |  second's payload (all free) | last |
//! +-------+--------+------------------------------+------+
//! 0       32       64                        end-32      end
//! ```
//!
//! `first` and `last` are permanently used zero-payload sentinels, so real
//! chunks always have an address-order neighbor on both sides and the
//! coalescing code needs no boundary cases.
//!
//! All chunk links are **byte offsets** into the region, not pointers: the
//! arena owns exactly one `NonNull<u8>` base and every list operation indexes
//! off it.
//!
//! ## Lists
//!
//! - The *all* list links every chunk in address order (circular).
//! - 32 *free* lists bucket free chunks by `floor(log2(payload))` (circular,
//!   one head offset per bucket).
//!
//! Allocation scans the first bucket whose smallest member is guaranteed to
//! fit, pops a chunk, splits off the remainder, and fills the payload with
//! `0xAA`. Freeing coalesces with both address-order neighbors immediately
//! and scrubs absorbed headers with `0xDD`.
//!
//! [`LockedHeap`] is the shared handle: one spin lock around the arena, with
//! an init path that takes its region from the page manager.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod heap;
mod locked;

pub use heap::{Heap, HeapStats};
pub use locked::{HeapInitError, LockedHeap};
