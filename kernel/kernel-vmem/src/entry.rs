//! Hardware-layout paging structures for the two-level i386 walk.
//!
//! Both levels use 32-bit entries whose top 20 bits hold a frame index and
//! whose low bits are flags. The [`bitfield_struct`](https://docs.rs/bitfield-struct/)
//! derive gives typed access without manual masking.

use bitfield_struct::bitfield;
use kernel_addresses::{PhysicalPage, Size4K};
use kernel_info::memory::{PAGE_DIR_ENTRIES, PAGE_TABLE_ENTRIES};

/// One page-directory entry (PDE).
///
/// Points at a page table, or (with `page_size` set) maps a 4 MiB page
/// directly. The page manager only ever uses the table form.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Valid entry if set |
/// | 1     | `RW` | Writable if set |
/// | 2     | `US` | User-mode accessible if set |
/// | 3     | `PWT`| Write-through caching |
/// | 4     | `PCD`| Disable caching |
/// | 5     | `A`  | Accessed |
/// | 6     | –    | Ignored |
/// | 7     | `PS` | 4 MiB page when set (requires CR4.PSE) |
/// | 8–11  | avail| Free for OS use |
/// | 12–31 | addr | Page-table frame index |
#[bitfield(u32)]
pub struct DirectoryEntry {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2). Clear restricts to supervisor.
    pub user_access: bool,
    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,
    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5). Set by the CPU on first use of the entry.
    pub accessed: bool,
    /// Ignored by hardware at this level.
    __: bool,
    /// Page Size (PS, bit 7). Set means a 4 MiB leaf; always clear here.
    pub page_size: bool,
    /// OS-available (bits 8..=11).
    #[bits(4)]
    pub os_available: u8,
    /// Frame index of the page table (bits 12..=31).
    #[bits(20)]
    pub table: u32,
}

impl DirectoryEntry {
    /// Present, writable, supervisor-only entry pointing at `table`.
    #[inline]
    #[must_use]
    pub const fn new_table(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_table(table.index())
    }

    /// Frame holding the referenced page table.
    #[inline]
    #[must_use]
    pub const fn table_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.table())
    }
}

/// One page-table entry (PTE), always a 4 KiB leaf.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Valid entry if set |
/// | 1     | `RW` | Writable if set |
/// | 2     | `US` | User-mode accessible if set |
/// | 3     | `PWT`| Write-through caching |
/// | 4     | `PCD`| Disable caching |
/// | 5     | `A`  | Accessed |
/// | 6     | `D`  | Dirty, set by the CPU on first write |
/// | 7     | `PAT`| Page attribute table index bit |
/// | 8     | `G`  | Global translation (survives CR3 reload) |
/// | 9–11  | avail| Free for OS use |
/// | 12–31 | addr | Mapped frame index |
#[bitfield(u32)]
pub struct TableEntry {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2). Clear restricts to supervisor.
    pub user_access: bool,
    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,
    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,
    /// Dirty (D, bit 6). Set by the CPU on first write.
    pub dirty: bool,
    /// Page Attribute Table (PAT, bit 7).
    pub page_attribute_table: bool,
    /// Global (G, bit 8). TLB entry survives CR3 reload when CR4.PGE is on.
    pub global: bool,
    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,
    /// Mapped frame index (bits 12..=31).
    #[bits(20)]
    pub frame: u32,
}

impl TableEntry {
    /// Present, writable, supervisor-only mapping of `frame`.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw(frame: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(frame.index())
    }

    /// The mapped frame.
    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.frame())
    }
}

/// A page table: 1024 [`TableEntry`]s, 4 KiB, page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [TableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [TableEntry::new(); PAGE_TABLE_ENTRIES],
        }
    }

    /// Clear all entries.
    pub fn zero(&mut self) {
        self.entries = [TableEntry::new(); PAGE_TABLE_ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn at(&self, index: usize) -> TableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: TableEntry) {
        self.entries[index] = entry;
    }
}

/// A page directory: 1024 [`DirectoryEntry`]s, 4 KiB, page-aligned.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [DirectoryEntry; PAGE_DIR_ENTRIES],
}

impl PageDirectory {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [DirectoryEntry::new(); PAGE_DIR_ENTRIES],
        }
    }

    /// Clear all entries.
    pub fn zero(&mut self) {
        self.entries = [DirectoryEntry::new(); PAGE_DIR_ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn at(&self, index: usize) -> DirectoryEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: DirectoryEntry) {
        self.entries[index] = entry;
    }
}

const _: () = {
    assert!(size_of::<DirectoryEntry>() == 4);
    assert!(size_of::<TableEntry>() == 4);
    assert!(size_of::<PageTable>() == 4096);
    assert!(size_of::<PageDirectory>() == 4096);
};

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addresses::PhysicalAddress;

    #[test]
    fn table_entry_encodes_frame_and_flags() {
        let frame = PhysicalAddress::new(0x0030_0000).page::<Size4K>();
        let e = TableEntry::new_kernel_rw(frame);
        assert!(e.present());
        assert!(e.writable());
        assert!(!e.user_access());
        assert_eq!(e.frame(), 0x300);
        assert_eq!(e.physical_page().base().as_u32(), 0x0030_0000);
        // present | rw | frame bits
        assert_eq!(e.into_bits(), 0x0030_0003);
    }

    #[test]
    fn directory_entry_encodes_table() {
        let table = PhysicalPage::<Size4K>::from_index(0xFFFFF);
        let e = DirectoryEntry::new_table(table);
        assert!(e.present());
        assert!(!e.page_size());
        assert_eq!(e.table_page(), table);
        assert_eq!(e.into_bits(), 0xFFFF_F003);
    }

    #[test]
    fn cleared_entries_are_not_present() {
        let t = PageTable::zeroed();
        assert!(!t.at(0).present());
        assert!(!t.at(1023).present());
        let d = PageDirectory::zeroed();
        assert!(!d.at(0).present());
        assert_eq!(d.at(512).into_bits(), 0);
    }
}
