//! Frame accounting on top of the raw [`Bitmap`].

use crate::bitmap::{BITS, Bitmap};
use kernel_addresses::{PhysicalPage, Size4K};
use kernel_info::boot::{MemoryRegion, RegionKind};
use kernel_info::memory::PAGE_SIZE;
use log::debug;

const PAGE_SIZE64: u64 = PAGE_SIZE as u64;
const ADDRESS_SPACE_END: u64 = 1 << 32;

/// Physical frame allocator. One bit per frame, set means consumed.
///
/// Starts out fully consumed; [`seed`](Self::seed) frees what the boot map
/// reports as usable. `free_frames` tracks clear bits exactly, which the
/// marking primitives maintain by only counting actual transitions.
pub struct FrameBitmap {
    frames: Bitmap,
    free_frames: usize,
}

impl FrameBitmap {
    /// Everything consumed, nothing free.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: Bitmap::new_all_set(),
            free_frames: 0,
        }
    }

    /// Consume the boot memory map, in order: `Available` regions free their
    /// frames, every other kind re-consumes them. Later entries win on
    /// overlap.
    ///
    /// Frees only frames that lie entirely inside an available region;
    /// consumes every frame an unavailable region touches.
    pub fn seed(&mut self, map: &[MemoryRegion]) {
        let mut available: u64 = 0;
        let mut reserved: u64 = 0;
        for region in map {
            if region.kind == RegionKind::Available {
                available += region.length;
                self.mark_free_region(region.base, region.length);
            } else {
                reserved += region.length;
                self.mark_used_region(region.base, region.length);
            }
        }
        debug!(
            "physical memory: {} MiB available, {} MiB reserved, {} MiB total",
            available >> 20,
            reserved >> 20,
            (available + reserved) >> 20
        );
    }

    /// Consume every frame touched by `[base, base + length)`. Bounds round
    /// outward to frame boundaries.
    pub fn mark_used_region(&mut self, base: u64, length: u64) {
        if length == 0 || base >= ADDRESS_SPACE_END {
            return;
        }
        let end = (base + length).min(ADDRESS_SPACE_END);
        let first = (base / PAGE_SIZE64) as usize;
        let last = (end.div_ceil(PAGE_SIZE64) as usize).min(BITS);
        for frame in first..last {
            self.set_used(frame);
        }
    }

    /// Free every frame fully contained in `[base, base + length)`. Bounds
    /// round inward so partial frames at the edges stay consumed.
    pub fn mark_free_region(&mut self, base: u64, length: u64) {
        if length == 0 || base >= ADDRESS_SPACE_END {
            return;
        }
        let end = (base + length).min(ADDRESS_SPACE_END);
        let first = base.div_ceil(PAGE_SIZE64) as usize;
        let last = ((end / PAGE_SIZE64) as usize).min(BITS);
        for frame in first..last {
            self.set_free(frame);
        }
    }

    /// Consume a single frame.
    #[inline]
    pub fn mark_frame_used(&mut self, frame: PhysicalPage<Size4K>) {
        self.set_used(frame.index() as usize);
    }

    /// Free a single frame.
    #[inline]
    pub fn mark_frame_free(&mut self, frame: PhysicalPage<Size4K>) {
        self.set_free(frame.index() as usize);
    }

    #[inline]
    #[must_use]
    pub fn is_frame_used(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.frames.is_set(frame.index() as usize)
    }

    /// Lowest free frame, if any. Does **not** consume it; the caller marks
    /// it used once the frame has actually been claimed.
    #[must_use]
    pub fn find_free_frame(&self) -> Option<PhysicalPage<Size4K>> {
        self.frames
            .find_first_clear()
            .map(|index| PhysicalPage::from_index(index as u32))
    }

    /// Number of currently free frames.
    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    fn set_used(&mut self, frame: usize) {
        if !self.frames.is_set(frame) {
            self.frames.set(frame);
            self.free_frames -= 1;
        }
    }

    fn set_free(&mut self, frame: usize) {
        if self.frames.is_set(frame) {
            self.frames.clear(frame);
            self.free_frames += 1;
        }
    }
}

impl Default for FrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}
