//! The kernel page manager: owns the frame allocator, the virtual-page map
//! and the paging structures rooted in one page directory.

use crate::entry::{DirectoryEntry, PageDirectory, PageTable, TableEntry};
use crate::{PagingControl, PhysMapper};
use kernel_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage, VirtualRange,
};
use kernel_info::boot::{BootConfig, MemoryRegion};
use kernel_info::memory::{
    EARLY_IDENTITY_END, PAGE_DIR_ENTRIES, PAGE_SIZE, PAGE_TABLE_ENTRIES, RECURSIVE_SLOT,
    kernel_to_phys,
};
use kernel_pmem::{Bitmap, FrameBitmap};
use kernel_sync::SpinLock;
use log::debug;

/// Failure while building the paging structures.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum SetupError {
    /// The boot map did not provide enough usable frames for the directory
    /// and its page tables.
    #[error("out of physical frames while building paging structures")]
    OutOfFrames,
}

/// Manages one address space: a page directory with all 1023 regular page
/// tables pre-allocated and the directory mapped onto itself in slot 1023.
///
/// Two bitmaps back the allocation operations: the physical [`FrameBitmap`]
/// and a virtual-page [`Bitmap`] in which a set bit means the page is mapped
/// or otherwise spoken for (the recursive window is pre-marked and never
/// handed out).
///
/// Contract violations (misaligned or conflicting mappings, mapping into the
/// recursive window) are kernel bugs and panic. Resource exhaustion on the
/// allocation path is an `Option::None`, never a panic.
pub struct PageManager<M, P> {
    mapper: M,
    paging: P,
    frames: FrameBitmap,
    pages: Bitmap,
    directory: PhysicalPage<Size4K>,
    trace_mappings: bool,
}

impl<M: PhysMapper, P: PagingControl> PageManager<M, P> {
    /// Build the address space and switch the paging unit over to it.
    ///
    /// Seeds the frame allocator from `memory_map`, allocates the directory
    /// and one zeroed page table per regular directory slot, installs the
    /// recursive mapping in slot 1023, identity-maps the low window below
    /// 1 MiB and maps the kernel image span (higher half, offset
    /// [`KERNEL_BASE`](kernel_info::memory::KERNEL_BASE)). Finally loads the
    /// directory root and enables
    /// paging.
    ///
    /// # Errors
    /// [`SetupError::OutOfFrames`] if the memory map cannot supply the 1024
    /// frames the paging structures need.
    pub fn init(
        mapper: M,
        paging: P,
        memory_map: &[MemoryRegion],
        kernel_span: (VirtualAddress, VirtualAddress),
        config: BootConfig,
    ) -> Result<Self, SetupError> {
        let mut frames = FrameBitmap::new();
        frames.seed(memory_map);

        // The recursive window is never available for allocation.
        let mut pages = Bitmap::new_all_clear();
        pages.set_range(RECURSIVE_SLOT * PAGE_TABLE_ENTRIES, PAGE_TABLE_ENTRIES);

        let directory = Self::claim_frame(&mut frames)?;
        unsafe { mapper.phys_to_mut::<PageDirectory>(directory.base()) }.zero();

        // One zeroed page table per regular slot, then the directory itself
        // in the last slot.
        for slot in 0..RECURSIVE_SLOT {
            let table = Self::claim_frame(&mut frames)?;
            unsafe { mapper.phys_to_mut::<PageTable>(table.base()) }.zero();
            unsafe { mapper.phys_to_mut::<PageDirectory>(directory.base()) }
                .set(slot, DirectoryEntry::new_table(table));
        }
        unsafe { mapper.phys_to_mut::<PageDirectory>(directory.base()) }
            .set(RECURSIVE_SLOT, DirectoryEntry::new_table(directory));

        let mut manager = Self {
            mapper,
            paging,
            frames,
            pages,
            directory,
            trace_mappings: config.trace_mappings,
        };

        // Low identity window: BIOS structures, VGA, the early boot code.
        manager.map_range_virtual(VirtualAddress::zero(), VirtualAddress::new(EARLY_IDENTITY_END));
        // Kernel image at its higher-half address.
        manager.map_range_physical(kernel_span.0, kernel_span.1);

        debug!(
            "enabling paging, directory at {}, {} frames free",
            manager.directory.base(),
            manager.frames.free_frames()
        );

        unsafe {
            manager.paging.load_directory(manager.directory);
            manager.paging.enable_paging();
        }
        Ok(manager)
    }

    fn claim_frame(frames: &mut FrameBitmap) -> Result<PhysicalPage<Size4K>, SetupError> {
        let frame = frames.find_free_frame().ok_or(SetupError::OutOfFrames)?;
        frames.mark_frame_used(frame);
        Ok(frame)
    }

    fn directory_mut(&mut self) -> &mut PageDirectory {
        // SAFETY: `directory` was claimed exclusively at init and holds a
        // PageDirectory ever since.
        unsafe { self.mapper.phys_to_mut(self.directory.base()) }
    }

    fn table_mut(&mut self, slot: usize) -> &mut PageTable {
        let entry = self.directory_mut().at(slot);
        debug_assert!(entry.present());
        // SAFETY: every regular slot was filled with a page-table frame at
        // init; the frame stays claimed for the manager's lifetime.
        unsafe { self.mapper.phys_to_mut(entry.table_page().base()) }
    }

    /// Map the page containing `va` to the frame containing `pa`, present,
    /// writable, supervisor-only.
    ///
    /// Remapping a page to the frame it already maps is a no-op.
    ///
    /// # Panics
    /// - if `va` is not page aligned,
    /// - if the page is already mapped to a *different* frame,
    /// - if `va` lies in the recursive directory window.
    pub fn map_page(&mut self, va: VirtualAddress, pa: PhysicalAddress) {
        assert!(
            va.is_aligned::<Size4K>(),
            "attempted to map non-page-aligned virtual address {va}"
        );
        let slot = va.directory_index();
        assert!(
            slot != RECURSIVE_SLOT,
            "attempted to map {va} inside the recursive directory window"
        );

        let frame = pa.page::<Size4K>();
        let table_index = va.table_index();

        // Traced before the present check, so idempotent remaps show up too.
        if self.trace_mappings {
            debug!(
                "map {} to {va}, pde = 0x{slot:08X}, pte = 0x{table_index:08X}",
                frame.base()
            );
        }

        let existing = self.table_mut(slot).at(table_index);
        if existing.present() {
            if existing.frame() == frame.index() {
                // Same translation already installed; nothing to do.
                return;
            }
            panic!(
                "attempted to map already mapped page {va} (old {}, new {})",
                existing.physical_page().base(),
                frame.base()
            );
        }

        let entry = TableEntry::new_kernel_rw(frame);
        self.table_mut(slot).set(table_index, entry);
        self.frames.mark_frame_used(frame);
        self.pages.set(va.page::<Size4K>().index() as usize);
        unsafe { self.paging.invalidate(va) };
    }

    /// Identity-map every page in `[start, end)`.
    pub fn map_range_virtual(&mut self, start: VirtualAddress, end: VirtualAddress) {
        for page in VirtualRange::new(start.page::<Size4K>(), end.page::<Size4K>()) {
            self.map_page(page.base(), PhysicalAddress::new(page.base().as_u32()));
        }
    }

    /// Map every page in `[start, end)` to its kernel load address
    /// (`va - KERNEL_BASE`).
    pub fn map_range_physical(&mut self, start: VirtualAddress, end: VirtualAddress) {
        for page in VirtualRange::new(start.page::<Size4K>(), end.page::<Size4K>()) {
            let pa = PhysicalAddress::new(kernel_to_phys(page.base().as_u32()));
            self.map_page(page.base(), pa);
        }
    }

    /// Allocate and map a virtually contiguous region of `size / PAGE_SIZE
    /// + 1` pages (the historical rounding: callers always receive at least
    /// one page more than `size / PAGE_SIZE`).
    ///
    /// Returns `None` when no virtual run or not enough physical frames are
    /// available. On frame exhaustion every page mapped so far is unmapped
    /// and released again; a failed call changes nothing.
    pub fn allocate_pages(&mut self, size: u32) -> Option<VirtualAddress> {
        let count = (size / PAGE_SIZE + 1) as usize;
        let start = self.pages.find_clear_run(count)?;

        for offset in 0..count {
            let page = VirtualPage::<Size4K>::from_index((start + offset) as u32);
            let Some(frame) = self.frames.find_free_frame() else {
                self.release_run(start, offset);
                return None;
            };
            self.map_page(page.base(), frame.base());
        }
        Some(VirtualPage::<Size4K>::from_index(start as u32).base())
    }

    /// Unmap and release the `size / PAGE_SIZE + 1` pages starting at the
    /// page containing `addr`. Pages in the range that are not mapped are
    /// skipped.
    pub fn free_pages(&mut self, addr: VirtualAddress, size: u32) {
        let count = (size / PAGE_SIZE + 1) as usize;
        let start = addr.page::<Size4K>().index() as usize;
        self.release_run(start, count);
    }

    /// Unmap `count` pages beginning at flat page index `start`, returning
    /// their frames to the allocator.
    fn release_run(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            let page = VirtualPage::<Size4K>::from_index(index as u32);
            let slot = page.base().directory_index();
            let table_index = page.base().table_index();
            let entry = self.table_mut(slot).at(table_index);
            if !entry.present() {
                continue;
            }
            self.frames.mark_frame_free(entry.physical_page());
            self.table_mut(slot).set(table_index, TableEntry::new());
            self.pages.clear(index);
            unsafe { self.paging.invalidate(page.base()) };
        }
    }

    /// Whether the page containing `addr` is currently mapped (or reserved,
    /// like the recursive window).
    #[must_use]
    pub fn is_present(&self, addr: VirtualAddress) -> bool {
        self.pages.is_set(addr.page::<Size4K>().index() as usize)
    }

    /// Physical address of the page directory (the CR3 value).
    #[must_use]
    pub const fn directory_physical_address(&self) -> PhysicalAddress {
        self.directory.base()
    }

    /// Number of free physical frames.
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }
}

const _: () = {
    assert!(RECURSIVE_SLOT == PAGE_DIR_ENTRIES - 1);
};

/// The process-wide paging handle: a [`PageManager`] behind a spin lock.
///
/// All entry points serialize on the lock, including the compound
/// allocate-and-map paths, so bitmap state and table state can never be
/// observed half-updated.
pub struct LockedPageManager<M, P> {
    inner: SpinLock<PageManager<M, P>>,
}

impl<M: PhysMapper, P: PagingControl> LockedPageManager<M, P> {
    #[must_use]
    pub const fn new(manager: PageManager<M, P>) -> Self {
        Self {
            inner: SpinLock::new(manager),
        }
    }

    /// See [`PageManager::allocate_pages`].
    pub fn allocate_pages(&self, size: u32) -> Option<VirtualAddress> {
        self.inner.with_lock(|m| m.allocate_pages(size))
    }

    /// See [`PageManager::free_pages`].
    pub fn free_pages(&self, addr: VirtualAddress, size: u32) {
        self.inner.with_lock(|m| m.free_pages(addr, size));
    }

    /// See [`PageManager::is_present`].
    pub fn is_present(&self, addr: VirtualAddress) -> bool {
        self.inner.with_lock(|m| m.is_present(addr))
    }

    /// See [`PageManager::directory_physical_address`].
    pub fn directory_physical_address(&self) -> PhysicalAddress {
        self.inner.with_lock(|m| m.directory_physical_address())
    }

    /// Run `f` with the lock held, for compound operations.
    pub fn with_manager<R>(&self, f: impl FnOnce(&mut PageManager<M, P>) -> R) -> R {
        self.inner.with_lock(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::RegionKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A 4 KiB-aligned raw frame, the "physical RAM" backing store in tests.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated physical memory: a vector of aligned frames where physical
    /// addresses are plain byte offsets from 0. The mapper picks the frame
    /// `pa / 4096` and casts it to `&mut T` (the caller guarantees the type
    /// matches). Only for tests.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K([0u8; 4096]));
            }
            Self { frames }
        }

        fn frame_mut_ptr(&self, idx: usize) -> *mut u8 {
            (&raw const self.frames[idx]).cast::<u8>().cast_mut()
        }
    }

    impl PhysMapper for &TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            // Paging structures are always frame-aligned; catch misuse.
            debug_assert_eq!(pa.as_u32() & 0xFFF, 0);
            unsafe { &mut *self.frame_mut_ptr(idx).cast::<T>() }
        }
    }

    #[derive(Default)]
    struct StubState {
        loads: usize,
        enables: usize,
        invalidations: usize,
    }

    /// Records paging-unit calls instead of touching CR0/CR3.
    #[derive(Clone, Default)]
    struct PagingStub {
        state: Rc<RefCell<StubState>>,
    }

    impl PagingControl for PagingStub {
        unsafe fn load_directory(&mut self, _directory: PhysicalPage<Size4K>) {
            self.state.borrow_mut().loads += 1;
        }

        unsafe fn enable_paging(&mut self) {
            self.state.borrow_mut().enables += 1;
        }

        unsafe fn invalidate(&mut self, _va: VirtualAddress) {
            self.state.borrow_mut().invalidations += 1;
        }
    }

    /// 1024 frames of paging structures plus slack for allocations.
    const TEST_FRAMES: usize = 1100;

    const fn va(v: u32) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn setup(phys: &TestPhys) -> (PageManager<&TestPhys, PagingStub>, PagingStub) {
        setup_with_span(phys, (va(0), va(0)))
    }

    fn setup_with_span(
        phys: &TestPhys,
        kernel_span: (VirtualAddress, VirtualAddress),
    ) -> (PageManager<&TestPhys, PagingStub>, PagingStub) {
        let stub = PagingStub::default();
        let map = [MemoryRegion::new(
            0,
            (phys.frames.len() * 4096) as u64,
            RegionKind::Available,
        )];
        let manager = PageManager::init(
            phys,
            stub.clone(),
            &map,
            kernel_span,
            BootConfig::default(),
        )
        .expect("init");
        (manager, stub)
    }

    /// Walk the real tables through the simulated RAM.
    fn read_pte(phys: &TestPhys, manager: &PageManager<&TestPhys, PagingStub>, at: VirtualAddress) -> TableEntry {
        let phys_ref = &phys;
        let dir: &PageDirectory =
            unsafe { phys_ref.phys_to_mut(manager.directory_physical_address()) };
        let pde = dir.at(at.directory_index());
        assert!(pde.present());
        let table: &PageTable = unsafe { phys_ref.phys_to_mut(pde.table_page().base()) };
        table.at(at.table_index())
    }

    #[test]
    fn init_installs_recursive_slot() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (manager, _) = setup(&phys);

        let phys_ref = &&phys;
        let dir: &PageDirectory =
            unsafe { phys_ref.phys_to_mut(manager.directory_physical_address()) };
        // every regular slot got a table, the last one maps the directory
        for slot in 0..1023 {
            assert!(dir.at(slot).present(), "slot {slot} missing");
        }
        assert_eq!(
            dir.at(1023).table_page().base(),
            manager.directory_physical_address()
        );

        // the whole recursive window is reserved
        assert!(manager.is_present(va(0xFFC0_0000)));
        assert!(manager.is_present(va(0xFFFF_F000)));
    }

    #[test]
    fn init_identity_maps_low_window() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (manager, _) = setup(&phys);

        assert!(manager.is_present(va(0)));
        assert!(manager.is_present(va(0x000F_F000)));
        assert!(!manager.is_present(va(0x0010_0000)));

        // VGA text buffer identity-mapped
        let pte = read_pte(&phys, &manager, va(0x000B_8000));
        assert!(pte.present());
        assert_eq!(pte.frame(), 0xB8);
    }

    #[test]
    fn kernel_span_maps_to_load_address() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (manager, _) = setup_with_span(&phys, (va(0xC000_0000), va(0xC001_0000)));

        assert!(manager.is_present(va(0xC000_0000)));
        assert!(manager.is_present(va(0xC000_F000)));
        assert!(!manager.is_present(va(0xC001_0000)));

        let pte = read_pte(&phys, &manager, va(0xC000_1000));
        assert_eq!(pte.frame(), 1);
    }

    #[test]
    fn map_page_is_idempotent_for_same_frame() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        let free_before = manager.free_frames();

        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_5000));
        let free_after = manager.free_frames();
        assert_eq!(free_after, free_before - 1);

        // same translation again: silently accepted, nothing changes
        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_5000));
        assert_eq!(manager.free_frames(), free_after);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn conflicting_remap_panics() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_5000));
        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_6000));
    }

    #[test]
    #[should_panic(expected = "non-page-aligned")]
    fn misaligned_va_panics() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        manager.map_page(va(0x0040_0123), PhysicalAddress::new(0x0040_5000));
    }

    #[test]
    #[should_panic(expected = "recursive directory window")]
    fn recursive_window_map_panics() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        manager.map_page(va(0xFFD0_0000), PhysicalAddress::new(0x0040_5000));
    }

    #[test]
    fn allocate_rounds_up_one_extra_page() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        let free_before = manager.free_frames();

        // size of exactly one page still consumes two (historical rounding)
        let base = manager.allocate_pages(4096).expect("allocate");
        assert!(base.is_aligned::<Size4K>());
        assert_eq!(manager.free_frames(), free_before - 2);
        assert!(manager.is_present(base));
        assert!(manager.is_present(base + 4096));
        assert!(!manager.is_present(base + 2 * 4096));
    }

    #[test]
    fn allocate_zero_takes_one_page() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        let free_before = manager.free_frames();
        let base = manager.allocate_pages(0).expect("allocate");
        assert_eq!(manager.free_frames(), free_before - 1);
        assert!(manager.is_present(base));
        assert!(!manager.is_present(base + 4096));
    }

    #[test]
    fn exhaustion_rolls_back_partial_allocation() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        let free_before = manager.free_frames();
        assert!(free_before < 101, "test assumes a small frame pool");

        // needs 101 frames; only free_before are available
        assert_eq!(manager.allocate_pages(100 * 4096), None);

        // nothing leaked: frame count and virtual map are untouched
        assert_eq!(manager.free_frames(), free_before);
        assert!(!manager.is_present(va(0x0010_0000)));

        // a smaller allocation still succeeds afterwards
        assert!(manager.allocate_pages(4096).is_some());
    }

    #[test]
    fn free_pages_releases_and_reuses() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        let free_before = manager.free_frames();

        let base = manager.allocate_pages(3 * 4096).expect("allocate");
        assert_eq!(manager.free_frames(), free_before - 4);

        manager.free_pages(base, 3 * 4096);
        assert_eq!(manager.free_frames(), free_before);
        assert!(!manager.is_present(base));
        assert!(!read_pte(&phys, &manager, base).present());

        // the freed run is the lowest again
        let again = manager.allocate_pages(3 * 4096).expect("allocate");
        assert_eq!(again, base);
    }

    #[test]
    fn free_pages_skips_unmapped_holes() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, _) = setup(&phys);
        let free_before = manager.free_frames();

        // freeing a range that was never mapped is a no-op
        manager.free_pages(va(0x0100_0000), 4 * 4096);
        assert_eq!(manager.free_frames(), free_before);
    }

    #[test]
    fn paging_control_called_in_order() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (mut manager, stub) = setup(&phys);
        {
            let s = stub.state.borrow();
            assert_eq!(s.loads, 1);
            assert_eq!(s.enables, 1);
            // every identity-mapped page was invalidated
            assert!(s.invalidations >= 256);
        }

        let before = stub.state.borrow().invalidations;
        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_5000));
        assert_eq!(stub.state.borrow().invalidations, before + 1);
    }

    /// Collects every formatted log line for later inspection.
    struct CaptureLog {
        lines: std::sync::Mutex<Vec<String>>,
    }

    impl log::Log for CaptureLog {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            self.lines.lock().unwrap().push(record.args().to_string());
        }

        fn flush(&self) {}
    }

    static CAPTURE: CaptureLog = CaptureLog {
        lines: std::sync::Mutex::new(Vec::new()),
    };

    #[test]
    fn trace_flag_logs_directory_and_table_indices() {
        log::set_logger(&CAPTURE).expect("no other logger installed");
        log::set_max_level(log::LevelFilter::Debug);

        let phys = TestPhys::with_frames(TEST_FRAMES);
        let map = [MemoryRegion::new(
            0,
            (TEST_FRAMES * 4096) as u64,
            RegionKind::Available,
        )];
        let config = BootConfig::from_cmdline("--enable-mapping-output");
        let mut manager = PageManager::init(
            &phys,
            PagingStub::default(),
            &map,
            (va(0), va(0)),
            config,
        )
        .expect("init");

        // drop the identity-map lines emitted during init
        CAPTURE.lines.lock().unwrap().clear();

        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_5000));
        {
            let lines = CAPTURE.lines.lock().unwrap();
            let line = lines
                .iter()
                .find(|l| l.starts_with("map "))
                .expect("mapping trace line");
            assert_eq!(line, "map 0x00405000 to 0x00400000, pde = 0x00000001, pte = 0x00000000");
        }

        // an idempotent remap traces as well
        CAPTURE.lines.lock().unwrap().clear();
        manager.map_page(va(0x0040_0000), PhysicalAddress::new(0x0040_5000));
        assert!(
            CAPTURE
                .lines
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.starts_with("map ")),
            "remap must be traced too"
        );
    }

    #[test]
    fn locked_manager_serializes_the_surface() {
        let phys = TestPhys::with_frames(TEST_FRAMES);
        let (manager, _) = setup(&phys);
        let locked = LockedPageManager::new(manager);

        let base = locked.allocate_pages(4096).expect("allocate");
        assert!(locked.is_present(base));
        locked.free_pages(base, 4096);
        assert!(!locked.is_present(base));
        assert_eq!(locked.directory_physical_address().as_u32() & 0xFFF, 0);
        assert!(locked.with_manager(|m| m.free_frames()) > 0);
    }
}

