//! # Physical Memory Management
//!
//! A bitmap allocator for 4 KiB physical frames.
//!
//! The [`Bitmap`] covers the entire 32-bit physical space: one bit per frame,
//! 2^20 bits, 128 KiB of storage. A set bit means *consumed* (allocated or
//! reserved). Everything starts out consumed; the boot memory map then frees
//! exactly the frames that lie inside `Available` regions
//! ([`FrameBitmap::seed`]).
//!
//! Unknown address space is never handed out: holes in the memory map simply
//! keep their initial consumed state.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod bitmap;
mod frame_bitmap;

pub use bitmap::{BITS, Bitmap};
pub use frame_bitmap::FrameBitmap;
