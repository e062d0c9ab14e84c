//! # Memory Layout
//!
//! Fixed constants of the i386 two-level paging layout. The geometry here is
//! dictated by hardware: 32-bit virtual addresses split into a 10-bit
//! directory index, a 10-bit table index and a 12-bit page offset.

/// Size of one page / frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Entries per page table (and per page directory).
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Entries in the page directory.
pub const PAGE_DIR_ENTRIES: usize = 1024;

/// Total number of 4 KiB pages in the 32-bit address space.
pub const PAGE_COUNT: usize = 1 << 20;

/// Where the kernel executes (VMA), matches the linker script.
///
/// Physical load address is `va - KERNEL_BASE` for everything in the kernel
/// image.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// End of the identity-mapped low window set up at paging init. Covers BIOS
/// structures, the VGA buffer and everything else below 1 MiB.
pub const EARLY_IDENTITY_END: u32 = 0x0010_0000;

/// Directory slot that maps the page directory onto itself. The top 4 MiB of
/// virtual space (`0xFFC0_0000..`) become a window onto the paging structures
/// and are never handed out by the page manager.
pub const RECURSIVE_SLOT: usize = 1023;

/// First virtual address of the recursive-mapping window.
pub const RECURSIVE_WINDOW_BASE: u32 = (RECURSIVE_SLOT as u32) << 22;

/// Translate a higher-half kernel virtual address to its physical load
/// address.
#[inline]
#[must_use]
pub const fn kernel_to_phys(va: u32) -> u32 {
    va - KERNEL_BASE
}

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(PAGE_COUNT == PAGE_TABLE_ENTRIES * PAGE_DIR_ENTRIES);
    assert!((PAGE_COUNT as u64) * (PAGE_SIZE as u64) == 1 << 32);
    assert!(KERNEL_BASE % PAGE_SIZE == 0);
    assert!(EARLY_IDENTITY_END % PAGE_SIZE == 0);
    assert!(RECURSIVE_WINDOW_BASE == 0xFFC0_0000);
};
