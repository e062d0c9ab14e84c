//! # Kernel Boot Information
//!
//! Normalized data the kernel needs from its bootloader: the physical memory
//! map and the command line. Bootloader-specific tag parsing (Multiboot2,
//! Stivale2) happens upstream; by the time these types are built, the map is
//! plain records.

/// Classification of one physical memory region.
///
/// Only [`Available`](RegionKind::Available) regions may back allocations;
/// everything else is treated as off limits.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Usable RAM.
    Available = 0,
    /// Firmware/device reserved.
    Reserved = 1,
    /// ACPI tables; reclaimable after they have been parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Known-defective RAM.
    BadRam = 4,
    /// Anything the bootloader reported that fits none of the above.
    Other = 5,
}

/// One contiguous physical region from the boot memory map.
///
/// `base + length` may reach exactly `1 << 32`, so both fields are `u64` even
/// though the machine is 32-bit.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    /// Physical start address.
    pub base: u64,
    /// Region length in bytes.
    pub length: u64,
    /// What the region holds.
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end address of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Kernel argument that turns on per-mapping trace output.
pub const PARAM_MAPPING_OUTPUT: &str = "--enable-mapping-output";

/// Options parsed from the kernel command line.
#[derive(Copy, Clone, Debug, Default)]
pub struct BootConfig {
    /// Emit a debug line for every page mapping installed.
    pub trace_mappings: bool,
}

impl BootConfig {
    /// Scan the raw command line for known switches. Unknown words are
    /// ignored.
    #[must_use]
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        for word in cmdline.split_whitespace() {
            if word == PARAM_MAPPING_OUTPUT {
                config.trace_mappings = true;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_flag_detection() {
        assert!(!BootConfig::from_cmdline("").trace_mappings);
        assert!(!BootConfig::from_cmdline("quiet splash").trace_mappings);
        assert!(BootConfig::from_cmdline("--enable-mapping-output").trace_mappings);
        assert!(BootConfig::from_cmdline("quiet --enable-mapping-output splash").trace_mappings);
    }

    #[test]
    fn region_end() {
        let r = MemoryRegion::new(0xFFF0_0000, 0x0010_0000, RegionKind::Available);
        assert_eq!(r.end(), 0x1_0000_0000);
    }
}
