//! Page-fault decoding and the fatal fault handler.
//!
//! There is no demand paging or swap here: a page fault always means broken
//! kernel code or a wild pointer, so the handler dumps everything it knows
//! and panics.

use bitfield_struct::bitfield;
use kernel_addresses::VirtualAddress;
use log::error;

/// Register snapshot pushed by the interrupt stubs, low address first.
///
/// Layout: data segment, the `pusha` block, the stub-pushed vector and error
/// code, then the CPU-pushed frame.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct InterruptFrame {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub ss: u32,
}

/// Page-fault error code layout (i386).
///
/// Each bit describes the condition that caused the fault.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by a reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if self.instruction_fetch() {
            "Instruction fetch from protected page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Log the faulting address, the decoded error code and the full register
/// snapshot, then panic. Never returns; every page fault is fatal.
pub fn handle_page_fault(frame: &InterruptFrame, cr2: VirtualAddress) -> ! {
    let err = PageFaultError::from_bits(frame.error_code);
    error!("PAGE FAULT at {cr2}, err=0x{:08X}: {}", err.into_bits(), err.explain());
    error!(
        "  eax=0x{:08X} ebx=0x{:08X} ecx=0x{:08X} edx=0x{:08X}",
        frame.eax, frame.ebx, frame.ecx, frame.edx
    );
    error!(
        "  esi=0x{:08X} edi=0x{:08X} ebp=0x{:08X} esp=0x{:08X}",
        frame.esi, frame.edi, frame.ebp, frame.esp
    );
    error!(
        "  eip=0x{:08X} cs=0x{:04X} ds=0x{:04X} eflags=0x{:08X}",
        frame.eip, frame.cs, frame.ds, frame.eflags
    );
    panic!("unrecoverable page fault at {cr2}");
}
