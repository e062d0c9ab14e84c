//! Fixed-size bitmap over all 2^20 pages of the 32-bit address space.

use kernel_info::memory::PAGE_COUNT;

/// Number of bits in the map, one per 4 KiB page.
pub const BITS: usize = PAGE_COUNT;

const WORD_BITS: usize = u32::BITS as usize;
const WORDS: usize = BITS / WORD_BITS;

/// One bit per page. Set means consumed.
///
/// 128 KiB of storage; both the frame allocator and the page manager's
/// virtual-page map embed one of these.
pub struct Bitmap {
    words: [u32; WORDS],
}

impl Bitmap {
    /// All bits set (everything consumed).
    #[must_use]
    pub const fn new_all_set() -> Self {
        Self {
            words: [u32::MAX; WORDS],
        }
    }

    /// All bits clear (everything free).
    #[must_use]
    pub const fn new_all_clear() -> Self {
        Self { words: [0; WORDS] }
    }

    #[inline]
    const fn split(bit: usize) -> (usize, u32) {
        (bit / WORD_BITS, 1 << (bit % WORD_BITS))
    }

    /// Mark `bit` consumed. Idempotent.
    #[inline]
    pub const fn set(&mut self, bit: usize) {
        let (word, mask) = Self::split(bit);
        self.words[word] |= mask;
    }

    /// Mark `bit` free. Idempotent.
    #[inline]
    pub const fn clear(&mut self, bit: usize) {
        let (word, mask) = Self::split(bit);
        self.words[word] &= !mask;
    }

    /// Whether `bit` is consumed.
    #[inline]
    #[must_use]
    pub const fn is_set(&self, bit: usize) -> bool {
        let (word, mask) = Self::split(bit);
        self.words[word] & mask != 0
    }

    /// Mark `count` bits starting at `start` consumed.
    pub const fn set_range(&mut self, start: usize, count: usize) {
        let mut bit = start;
        while bit < start + count {
            self.set(bit);
            bit += 1;
        }
    }

    /// Lowest clear bit, if any.
    #[must_use]
    pub fn find_first_clear(&self) -> Option<usize> {
        for (i, &word) in self.words.iter().enumerate() {
            if word != u32::MAX {
                return Some(i * WORD_BITS + word.trailing_ones() as usize);
            }
        }
        None
    }

    /// Start of the lowest run of `count` consecutive clear bits, if any.
    ///
    /// The run may be arbitrarily long; there is no word-size cap.
    #[must_use]
    pub fn find_clear_run(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut bit = 0;
        while bit < BITS {
            // Whole-word skip while no run is in progress.
            if run_len == 0 && bit % WORD_BITS == 0 && self.words[bit / WORD_BITS] == u32::MAX {
                bit += WORD_BITS;
                continue;
            }
            if self.is_set(bit) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = bit;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            bit += 1;
        }
        None
    }
}
