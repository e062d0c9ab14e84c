//! # Virtual Memory Support
//!
//! Two-level i386 paging for the kernel.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! The CPU uses the two index fields to walk two levels of tables, each with
//! 1024 entries of 4 bytes:
//!
//! ```text
//!  Page Directory  →  Page Table  →  Physical Frame
//!       │                 │
//!       │                 └───► PTE (Page Table Entry) → maps 4 KiB page
//!       └─────────────────────► PDE (Page Directory Entry)
//! ```
//!
//! CR3 holds the physical address of the page directory. Directory slot 1023
//! maps the directory's own frame, so once paging is on the top 4 MiB of
//! virtual space (`0xFFC0_0000..`) is a window onto every paging structure.
//!
//! ## What you get
//!
//! - Hardware-shaped [`DirectoryEntry`]/[`TableEntry`] bitfields and the
//!   4 KiB [`PageDirectory`]/[`PageTable`] arrays ([`entry`]).
//! - The [`PhysMapper`] seam: how a physical table frame becomes a usable
//!   `&mut` reference ([`DirectOffsetMapper`] for identity/offset kernels,
//!   a simulated-RAM mapper in tests).
//! - The [`PagingControl`] seam over CR0/CR3/`invlpg`, so the table logic
//!   stays testable off-target.
//! - [`PageManager`]/[`LockedPageManager`]: mapping, virtual+physical
//!   allocation and the recursive directory setup ([`page_manager`]).
//! - Page-fault decoding and the fatal fault handler ([`fault`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod entry;
pub mod fault;
pub mod page_manager;

pub use entry::{DirectoryEntry, PageDirectory, PageTable, TableEntry};
pub use page_manager::{LockedPageManager, PageManager, SetupError};

use kernel_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Converts physical addresses to usable pointers in the current virtual
/// address space.
///
/// Before paging is enabled this is trivially the identity; afterwards the
/// kernel reaches its paging structures through the recursive window or a
/// fixed offset. Tests back it with simulated RAM.
///
/// # Safety
/// - `pa` must be mapped writable in the current address space for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must stay valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// A mapper that adds a constant offset to every physical address.
///
/// Offset 0 is the identity map used during early bring-up.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectOffsetMapper {
    offset: u32,
}

impl DirectOffsetMapper {
    #[must_use]
    pub const fn identity() -> Self {
        Self { offset: 0 }
    }

    #[must_use]
    pub const fn with_offset(offset: u32) -> Self {
        Self { offset }
    }
}

impl PhysMapper for DirectOffsetMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = pa.as_u32().wrapping_add(self.offset);
        // SAFETY: the caller guarantees the offset mapping is live and
        // writable and that T matches the bytes at the target.
        unsafe { &mut *(core::ptr::with_exposed_provenance_mut::<T>(va as usize)) }
    }
}

/// Control of the paging unit itself: directory root, the enable bit and TLB
/// invalidation.
///
/// [`HardwarePaging`] talks to the real registers; tests substitute a
/// recording stub so the table logic runs on the host.
pub trait PagingControl {
    /// Point CR3 at `directory`.
    ///
    /// # Safety
    /// The frame must hold a valid page directory; if paging is already on,
    /// the new directory must map the currently executing code.
    unsafe fn load_directory(&mut self, directory: PhysicalPage<Size4K>);

    /// Set CR0.PG.
    ///
    /// # Safety
    /// CR3 must already point at a directory that maps the executing code,
    /// or the next instruction fetch faults.
    unsafe fn enable_paging(&mut self);

    /// Drop the TLB entry for `va`.
    ///
    /// # Safety
    /// Always safe architecturally at CPL0; marked unsafe for symmetry with
    /// the mutation it accompanies.
    unsafe fn invalidate(&mut self, va: VirtualAddress);
}

/// [`PagingControl`] over the real CR0/CR3 registers.
#[cfg(target_arch = "x86")]
#[derive(Copy, Clone, Debug, Default)]
pub struct HardwarePaging;

#[cfg(target_arch = "x86")]
impl PagingControl for HardwarePaging {
    unsafe fn load_directory(&mut self, directory: PhysicalPage<Size4K>) {
        let cr3 = directory.base().as_u32();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    unsafe fn enable_paging(&mut self) {
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr0",
                "or {tmp}, 0x80000000",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                options(nostack)
            );
        }
    }

    unsafe fn invalidate(&mut self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) va.as_u32(),
                options(nostack, preserves_flags)
            );
        }
    }
}
