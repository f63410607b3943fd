//! Address-space construction and page-table walks
//!
//! An [`AddressSpace`] is a handle to a 4-level page hierarchy: the
//! physical address of its PML4 plus the direct-map view of it. Kernel
//! (upper-half) entries are shared between all address spaces by copying
//! the PML4 slots at creation; user (lower-half) entries are private and
//! torn down recursively on deletion.
//!
//! All table memory is reached exclusively through the higher-half direct
//! map (`phys_to_virt`), which the host test target configures as the
//! identity so walks run against ordinary heap-allocated tables.

use super::{
    page_table::{PageTable, PageTableEntry, PageTableIndices},
    phys_to_virt, PageFlags, PhysicalAddress, VirtualAddress, LARGE_PAGE_SIZE, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Number of PML4 slots covering the lower (user) half.
const USER_PML4_SLOTS: usize = 256;

/// Pages per 2 MiB large page.
const PAGES_PER_LARGE: usize = LARGE_PAGE_SIZE / PAGE_SIZE;

/// Where page-table frames come from. The global allocator backs the
/// real kernel; unit tests substitute a heap-backed source so walks can
/// be exercised without physical memory.
pub trait FrameSource {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress>;
    fn free_frame(&mut self, frame: PhysicalAddress);

    /// A physically contiguous run of frames (kernel stacks need one so
    /// the direct-map view is virtually contiguous too). Sources without
    /// contiguity support may decline.
    fn allocate_contiguous(&mut self, _count: usize) -> Option<PhysicalAddress> {
        None
    }
}

/// [`FrameSource`] backed by the global frame allocator.
pub struct GlobalFrameSource;

impl FrameSource for GlobalFrameSource {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        super::FRAME_ALLOCATOR.lock().allocate_frame()
    }

    fn free_frame(&mut self, frame: PhysicalAddress) {
        super::FRAME_ALLOCATOR.lock().free_frame(frame);
    }

    fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
        super::FRAME_ALLOCATOR.lock().allocate_frames(count)
    }
}

/// Direct-map view of a page-table frame.
fn table_at(phys: PhysicalAddress) -> &'static mut PageTable {
    // SAFETY: callers only pass addresses of live page-table frames; the
    // direct map covers all of physical memory, and table access is
    // serialized by the callers (interrupts disabled or task lock held).
    unsafe { &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

/// Drop the NX bit when the CPU does not support it; the flag would be
/// a reserved-bit violation on such hardware.
fn gate_nx(flags: PageFlags) -> PageFlags {
    if crate::arch::x86_64::cpu::nx_supported() {
        flags
    } else {
        flags - PageFlags::NO_EXECUTE
    }
}

/// Handle to one 4-level page hierarchy.
#[derive(Debug)]
pub struct AddressSpace {
    pml4: PhysicalAddress,
}

impl AddressSpace {
    /// Wrap an existing hierarchy root.
    pub const fn from_pml4(pml4: PhysicalAddress) -> Self {
        Self { pml4 }
    }

    /// Physical address of the top-level table (the value loaded into
    /// CR3 when this space is switched to).
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        self.pml4
    }

    /// The currently active address space, from CR3.
    #[cfg(target_os = "none")]
    pub fn current() -> Self {
        let (frame, _) = x86_64::registers::control::Cr3::read();
        Self::from_pml4(PhysicalAddress::new(frame.start_address().as_u64()))
    }

    /// Switch to this address space. Reloading CR3 flushes all
    /// non-global TLB entries implicitly.
    #[cfg(target_os = "none")]
    pub fn switch(&self) {
        use x86_64::{
            registers::control::{Cr3, Cr3Flags},
            structures::paging::PhysFrame,
            PhysAddr,
        };
        // SAFETY: the hierarchy shares the kernel's upper half, so the
        // mapping of the code performing this write is unchanged by it.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(PhysAddr::new(self.pml4.as_u64())),
                Cr3Flags::empty(),
            );
        }
    }

    /// Allocate a fresh hierarchy with an empty PML4.
    pub fn new_bare(source: &mut impl FrameSource) -> KernelResult<Self> {
        let frame = source.allocate_frame().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
            available: 0,
        })?;
        table_at(frame).zero();
        Ok(Self::from_pml4(frame))
    }

    /// Create a new address space sharing this one's kernel mappings:
    /// the upper-half PML4 entries are copied, the lower half starts
    /// empty.
    pub fn create_from(&self, source: &mut impl FrameSource) -> KernelResult<Self> {
        let new = Self::new_bare(source)?;
        let src = table_at(self.pml4);
        let dst = table_at(new.pml4);
        for slot in USER_PML4_SLOTS..512 {
            dst[slot] = src[slot];
        }
        Ok(new)
    }

    /// Create a new address space sharing the running kernel's mappings.
    #[cfg(target_os = "none")]
    pub fn create(source: &mut impl FrameSource) -> KernelResult<Self> {
        Self::current().create_from(source)
    }

    /// Walk to (or build) the child table behind `entry`.
    fn next_table_create(
        entry: &mut PageTableEntry,
        user: bool,
        source: &mut impl FrameSource,
    ) -> KernelResult<&'static mut PageTable> {
        if entry.is_huge() {
            return Err(KernelError::AlreadyMapped {
                addr: entry.addr().map(|a| a.as_u64()).unwrap_or(0),
            });
        }
        match entry.addr() {
            Some(phys) => Ok(table_at(phys)),
            None => {
                let frame = source.allocate_frame().ok_or(KernelError::OutOfMemory {
                    requested: PAGE_SIZE,
                    available: 0,
                })?;
                table_at(frame).zero();
                let mut flags = PageFlags::WRITABLE;
                if user {
                    flags |= PageFlags::USER;
                }
                entry.set(frame, flags);
                Ok(table_at(frame))
            }
        }
    }

    /// Map one 4 KiB page. Rejects the null page and unaligned
    /// addresses; mapping over a present entry is an error.
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        source: &mut impl FrameSource,
    ) -> KernelResult<()> {
        if virt.as_u64() < PAGE_SIZE as u64 {
            return Err(KernelError::InvalidAddress {
                addr: virt.as_u64(),
            });
        }
        if !virt.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: virt.as_u64(),
            });
        }
        if !phys.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: phys.as_u64(),
            });
        }

        let indices = PageTableIndices::of(virt);
        let user = virt.is_lower_half();

        let pml4 = table_at(self.pml4);
        let pdpt = Self::next_table_create(&mut pml4[indices.pml4], user, source)?;
        let pd = Self::next_table_create(&mut pdpt[indices.pdpt], user, source)?;
        let pt = Self::next_table_create(&mut pd[indices.pd], user, source)?;

        let entry = &mut pt[indices.pt];
        if entry.is_present() {
            return Err(KernelError::AlreadyMapped {
                addr: virt.as_u64(),
            });
        }
        entry.set(phys, gate_nx(flags));
        tlb::flush_address(virt);
        Ok(())
    }

    /// Map one 2 MiB large page at the PD level.
    fn map_large_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        source: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let indices = PageTableIndices::of(virt);
        let user = virt.is_lower_half();

        let pml4 = table_at(self.pml4);
        let pdpt = Self::next_table_create(&mut pml4[indices.pml4], user, source)?;
        let pd = Self::next_table_create(&mut pdpt[indices.pdpt], user, source)?;

        let entry = &mut pd[indices.pd];
        if entry.is_present() {
            return Err(KernelError::AlreadyMapped {
                addr: virt.as_u64(),
            });
        }
        entry.set(phys, gate_nx(flags) | PageFlags::HUGE);
        tlb::flush_address(virt);
        Ok(())
    }

    /// Map `count` pages starting at `virt` -> `phys`, promoting to
    /// 2 MiB large pages whenever both addresses are 2 MiB-aligned and
    /// at least 512 pages remain.
    pub fn map_pages(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        count: usize,
        flags: PageFlags,
        source: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let mut virt = virt;
        let mut phys = phys;
        let mut remaining = count;

        while remaining > 0 {
            let aligned = virt.as_u64() % LARGE_PAGE_SIZE as u64 == 0
                && phys.as_u64() % LARGE_PAGE_SIZE as u64 == 0;
            if aligned && remaining >= PAGES_PER_LARGE {
                self.map_large_page(virt, phys, flags, source)?;
                virt = virt.offset(LARGE_PAGE_SIZE as u64);
                phys = phys.offset(LARGE_PAGE_SIZE as u64);
                remaining -= PAGES_PER_LARGE;
            } else {
                self.map_page(virt, phys, flags, source)?;
                virt = virt.offset(PAGE_SIZE as u64);
                phys = phys.offset(PAGE_SIZE as u64);
                remaining -= 1;
            }
        }
        Ok(())
    }

    /// Unmap one 4 KiB page (or a whole 2 MiB mapping when `virt` is its
    /// aligned base), returning the physical address it pointed to.
    /// Interior tables are left in place.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        let indices = PageTableIndices::of(virt);

        let pml4 = table_at(self.pml4);
        let pdpt_phys = pml4[indices.pml4]
            .addr()
            .ok_or(KernelError::UnmappedMemory {
                addr: virt.as_u64(),
            })?;
        let pdpt = table_at(pdpt_phys);
        let pd_phys = pdpt[indices.pdpt]
            .addr()
            .ok_or(KernelError::UnmappedMemory {
                addr: virt.as_u64(),
            })?;
        let pd = table_at(pd_phys);

        let pd_entry = &mut pd[indices.pd];
        let pt_phys = pd_entry.addr().ok_or(KernelError::UnmappedMemory {
            addr: virt.as_u64(),
        })?;
        if pd_entry.is_huge() {
            if virt.as_u64() % LARGE_PAGE_SIZE as u64 != 0 {
                return Err(KernelError::Misaligned {
                    addr: virt.as_u64(),
                });
            }
            pd_entry.clear();
            tlb::flush_address(virt);
            return Ok(pt_phys);
        }

        let pt = table_at(pt_phys);
        let entry = &mut pt[indices.pt];
        let phys = entry.addr().ok_or(KernelError::UnmappedMemory {
            addr: virt.as_u64(),
        })?;
        entry.clear();
        tlb::flush_address(virt);
        Ok(phys)
    }

    /// Unmap `count` pages starting at `virt`, collapsing over large
    /// pages mapped by the `map_pages` promotion path.
    pub fn unmap_pages(&mut self, virt: VirtualAddress, count: usize) -> KernelResult<()> {
        let mut virt = virt;
        let mut remaining = count;
        while remaining > 0 {
            let large = virt.as_u64() % LARGE_PAGE_SIZE as u64 == 0
                && remaining >= PAGES_PER_LARGE
                && self.is_large_mapping(virt);
            self.unmap_page(virt)?;
            if large {
                virt = virt.offset(LARGE_PAGE_SIZE as u64);
                remaining -= PAGES_PER_LARGE;
            } else {
                virt = virt.offset(PAGE_SIZE as u64);
                remaining -= 1;
            }
        }
        Ok(())
    }

    /// Whether `virt` is covered by a present 2 MiB PD entry.
    fn is_large_mapping(&self, virt: VirtualAddress) -> bool {
        let indices = PageTableIndices::of(virt);
        let pml4 = table_at(self.pml4);
        let Some(pdpt_phys) = pml4[indices.pml4].addr() else {
            return false;
        };
        let pdpt = table_at(pdpt_phys);
        let Some(pd_phys) = pdpt[indices.pdpt].addr() else {
            return false;
        };
        if pdpt[indices.pdpt].is_huge() {
            return false;
        }
        let pd = table_at(pd_phys);
        pd[indices.pd].is_present() && pd[indices.pd].is_huge()
    }

    /// Translate a virtual address, honoring 1 GiB and 2 MiB leaves.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let indices = PageTableIndices::of(virt);

        let pml4 = table_at(self.pml4);
        let pdpt_phys = pml4[indices.pml4].addr()?;
        let pdpt = table_at(pdpt_phys);

        let pdpt_entry = &pdpt[indices.pdpt];
        let pd_phys = pdpt_entry.addr()?;
        if pdpt_entry.is_huge() {
            let offset = virt.as_u64() & (super::HUGE_PAGE_SIZE as u64 - 1);
            return Some(pd_phys.offset(offset));
        }

        let pd = table_at(pd_phys);
        let pd_entry = &pd[indices.pd];
        let pt_phys = pd_entry.addr()?;
        if pd_entry.is_huge() {
            let offset = virt.as_u64() & (LARGE_PAGE_SIZE as u64 - 1);
            return Some(pt_phys.offset(offset));
        }

        let pt = table_at(pt_phys);
        let phys = pt[indices.pt].addr()?;
        Some(phys.offset(indices.page_offset as u64))
    }

    /// Whether a translation exists for `virt`.
    pub fn is_mapped(&self, virt: VirtualAddress) -> bool {
        self.translate(virt).is_some()
    }

    /// Flags of the leaf entry covering `virt`, at whichever level the
    /// walk terminates. Used by protection-changing collaborators and to
    /// audit mappings.
    pub fn mapping_flags(&self, virt: VirtualAddress) -> Option<PageFlags> {
        let indices = PageTableIndices::of(virt);

        let pml4 = table_at(self.pml4);
        let pdpt = table_at(pml4[indices.pml4].addr()?);
        let pdpt_entry = &pdpt[indices.pdpt];
        pdpt_entry.addr()?;
        if pdpt_entry.is_huge() {
            return Some(pdpt_entry.flags());
        }

        let pd = table_at(pdpt_entry.addr()?);
        let pd_entry = &pd[indices.pd];
        pd_entry.addr()?;
        if pd_entry.is_huge() {
            return Some(pd_entry.flags());
        }

        let pt = table_at(pd_entry.addr()?);
        let entry = &pt[indices.pt];
        entry.addr()?;
        Some(entry.flags())
    }

    /// Map a physical range (MMIO) page by page with the caller's flags.
    /// No large-page promotion: device ranges keep 4 KiB granularity so
    /// attribute changes stay per-page.
    pub fn map_physical_range(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        flags: PageFlags,
        source: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let pages = size.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            self.map_page(
                virt.offset((page * PAGE_SIZE) as u64),
                phys.offset((page * PAGE_SIZE) as u64),
                flags,
                source,
            )?;
        }
        Ok(())
    }

    /// Free and clear every present 4 KiB leaf in the lower half. Used
    /// by task termination, where all user mappings (image segments,
    /// stack, arenas) are owned by the dying task. Large-page leaves are
    /// not expected in user spaces and are skipped with a warning.
    pub fn release_user_pages(&mut self, source: &mut impl FrameSource) {
        let pml4 = table_at(self.pml4);
        for slot4 in 0..USER_PML4_SLOTS {
            let Some(pdpt_phys) = pml4[slot4].addr() else {
                continue;
            };
            if pml4[slot4].is_huge() {
                continue;
            }
            let pdpt = table_at(pdpt_phys);
            for slot3 in 0..512 {
                let Some(pd_phys) = pdpt[slot3].addr() else {
                    continue;
                };
                if pdpt[slot3].is_huge() {
                    log::warn!("release_user_pages: skipping 1 GiB user leaf");
                    continue;
                }
                let pd = table_at(pd_phys);
                for slot2 in 0..512 {
                    let Some(pt_phys) = pd[slot2].addr() else {
                        continue;
                    };
                    if pd[slot2].is_huge() {
                        log::warn!("release_user_pages: skipping 2 MiB user leaf");
                        continue;
                    }
                    let pt = table_at(pt_phys);
                    for entry in pt.iter_mut() {
                        if let Some(frame) = entry.addr() {
                            source.free_frame(frame);
                            entry.clear();
                        }
                    }
                }
            }
        }
    }

    /// Tear down the hierarchy: every interior table reachable from the
    /// lower half is freed, then the PML4 itself. Upper-half tables are
    /// shared with every other address space and are never freed here.
    /// Leaf data frames are owned by whoever mapped them (ELF loader,
    /// stack allocation) and are released by those owners.
    pub fn destroy(self, source: &mut impl FrameSource) {
        let pml4 = table_at(self.pml4);
        for slot4 in 0..USER_PML4_SLOTS {
            let e4 = pml4[slot4];
            let Some(pdpt_phys) = e4.addr() else {
                continue;
            };
            if e4.is_huge() {
                continue;
            }
            let pdpt = table_at(pdpt_phys);
            for slot3 in 0..512 {
                let e3 = pdpt[slot3];
                let Some(pd_phys) = e3.addr() else {
                    continue;
                };
                if e3.is_huge() {
                    continue;
                }
                let pd = table_at(pd_phys);
                for slot2 in 0..512 {
                    let e2 = pd[slot2];
                    let Some(pt_phys) = e2.addr() else {
                        continue;
                    };
                    if e2.is_huge() {
                        continue;
                    }
                    source.free_frame(pt_phys);
                }
                source.free_frame(pd_phys);
            }
            source.free_frame(pdpt_phys);
        }
        source.free_frame(self.pml4);
    }
}

/// Populate every empty upper-half PML4 slot of the running kernel
/// space with a zeroed table. Address spaces created afterwards copy
/// these slots, so kernel mappings added at any later point become
/// visible in all of them without propagation.
#[cfg(target_os = "none")]
pub fn init_kernel_upper_half(source: &mut impl FrameSource) -> KernelResult<()> {
    let space = AddressSpace::current();
    let pml4 = table_at(space.pml4);
    for slot in USER_PML4_SLOTS..512 {
        if pml4[slot].is_unused() {
            let frame = source.allocate_frame().ok_or(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
                available: 0,
            })?;
            table_at(frame).zero();
            pml4[slot].set(frame, PageFlags::WRITABLE);
        }
    }
    Ok(())
}

/// TLB maintenance. Single-address invalidation after map/unmap; the
/// full flush is implicit in every CR3 reload.
pub mod tlb {
    use super::VirtualAddress;

    #[cfg(target_os = "none")]
    pub fn flush_address(addr: VirtualAddress) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(addr.as_u64()));
    }

    #[cfg(not(target_os = "none"))]
    pub fn flush_address(_addr: VirtualAddress) {}

    #[cfg(target_os = "none")]
    pub fn flush_all() {
        x86_64::instructions::tlb::flush_all();
    }

    #[cfg(not(target_os = "none"))]
    pub fn flush_all() {}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::boxed::Box;

    /// Heap-backed frame source: each "frame" is a leaked, page-aligned
    /// PageTable whose host address doubles as its physical address
    /// (the HHDM offset is zero on the host).
    struct TestFrameSource {
        allocated: usize,
        freed: usize,
    }

    impl TestFrameSource {
        fn new() -> Self {
            Self {
                allocated: 0,
                freed: 0,
            }
        }

        fn outstanding(&self) -> usize {
            self.allocated - self.freed
        }
    }

    impl FrameSource for TestFrameSource {
        fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
            self.allocated += 1;
            let table: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
            Some(PhysicalAddress::new(table as *mut PageTable as u64))
        }

        fn free_frame(&mut self, _frame: PhysicalAddress) {
            self.freed += 1;
        }
    }

    const USER_VA: VirtualAddress = VirtualAddress::new(0x40_0000);
    const DATA_PA: PhysicalAddress = PhysicalAddress::new(0x5000_0000);

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut source = TestFrameSource::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("bare space");

        space
            .map_page(USER_VA, DATA_PA, PageFlags::WRITABLE | PageFlags::USER, &mut source)
            .expect("mapping a free user page should succeed");
        assert_eq!(space.translate(USER_VA), Some(DATA_PA));
        assert_eq!(
            space.translate(USER_VA.offset(0x123)),
            Some(DATA_PA.offset(0x123))
        );
        assert!(space.is_mapped(USER_VA));

        let freed = space.unmap_page(USER_VA).expect("unmap mapped page");
        assert_eq!(freed, DATA_PA);
        assert!(!space.is_mapped(USER_VA));
    }

    #[test]
    fn null_page_mapping_is_rejected() {
        let mut source = TestFrameSource::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("bare space");
        let err = space
            .map_page(
                VirtualAddress::new(0),
                DATA_PA,
                PageFlags::WRITABLE,
                &mut source,
            )
            .expect_err("mapping the null page must fail");
        assert_eq!(err, KernelError::InvalidAddress { addr: 0 });
    }

    #[test]
    fn double_mapping_is_rejected() {
        let mut source = TestFrameSource::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("bare space");
        space
            .map_page(USER_VA, DATA_PA, PageFlags::USER, &mut source)
            .expect("first mapping");
        let err = space
            .map_page(USER_VA, DATA_PA.offset(0x1000), PageFlags::USER, &mut source)
            .expect_err("second mapping of the same page must fail");
        assert_eq!(
            err,
            KernelError::AlreadyMapped {
                addr: USER_VA.as_u64()
            }
        );
    }

    #[test]
    fn large_page_promotion_uses_one_pd_entry() {
        let mut source = TestFrameSource::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("bare space");
        let before = source.allocated;

        let virt = VirtualAddress::new(0x20_0000); // 2 MiB aligned
        let phys = PhysicalAddress::new(0x4000_0000); // 2 MiB aligned
        space
            .map_pages(virt, phys, 512, PageFlags::WRITABLE | PageFlags::USER, &mut source)
            .expect("2 MiB-aligned 512-page mapping");

        // PDPT + PD only; the promotion must not build a PT.
        assert_eq!(source.allocated - before, 2);
        assert_eq!(space.translate(virt), Some(phys));
        assert_eq!(
            space.translate(virt.offset(0x1000)),
            Some(phys.offset(0x1000))
        );
        assert_eq!(
            space.translate(virt.offset(0x1F_FFFF)),
            Some(phys.offset(0x1F_FFFF))
        );

        space
            .unmap_pages(virt, 512)
            .expect("unmapping the large run");
        assert!(!space.is_mapped(virt));
        assert!(!space.is_mapped(virt.offset(0x10_0000)));
    }

    #[test]
    fn unaligned_runs_fall_back_to_small_pages() {
        let mut source = TestFrameSource::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("bare space");

        // Virtually aligned but physically unaligned: no promotion.
        let virt = VirtualAddress::new(0x20_0000);
        let phys = PhysicalAddress::new(0x4000_1000);
        let before = source.allocated;
        space
            .map_pages(virt, phys, 512, PageFlags::USER, &mut source)
            .expect("unaligned 512-page mapping");
        // PDPT + PD + at least one PT.
        assert!(source.allocated - before >= 3);
        assert_eq!(space.translate(virt.offset(0x3000)), Some(phys.offset(0x3000)));
        space.unmap_pages(virt, 512).expect("unmap small run");
        assert!(!space.is_mapped(virt));
    }

    #[test]
    fn gigabyte_leaves_translate() {
        let mut source = TestFrameSource::new();
        let space = AddressSpace::new_bare(&mut source).expect("bare space");

        // Hand-build a 1 GiB leaf at PDPT slot 1.
        let pdpt_phys = source.allocate_frame().expect("pdpt frame");
        table_at(pdpt_phys).zero();
        let backing = PhysicalAddress::new(0x8000_0000);
        table_at(pdpt_phys)[1].set(backing, PageFlags::WRITABLE | PageFlags::HUGE);
        table_at(space.pml4_phys())[0].set(pdpt_phys, PageFlags::WRITABLE);

        let virt = VirtualAddress::new((1 << 30) + 0x1234);
        assert_eq!(space.translate(virt), Some(backing.offset(0x1234)));
    }

    #[test]
    fn create_and_destroy_leave_no_tables_behind() {
        let mut source = TestFrameSource::new();
        let parent = AddressSpace::new_bare(&mut source).expect("parent space");
        let mut child = parent.create_from(&mut source).expect("child space");

        child
            .map_page(USER_VA, DATA_PA, PageFlags::USER, &mut source)
            .expect("mapping in child");
        child
            .map_page(
                VirtualAddress::new(0x7FFF_0000),
                DATA_PA.offset(0x1000),
                PageFlags::USER | PageFlags::WRITABLE,
                &mut source,
            )
            .expect("second mapping in child");

        child.destroy(&mut source);
        // Everything the child owned (its PML4 plus lower-half interior
        // tables) is returned; only the parent's PML4 remains.
        assert_eq!(source.outstanding(), 1);
    }

    #[test]
    fn child_shares_kernel_half_but_not_user_half() {
        let mut source = TestFrameSource::new();
        let mut parent = AddressSpace::new_bare(&mut source).expect("parent space");

        let kernel_va = VirtualAddress::new(0xFFFF_8000_0010_0000);
        let kernel_pa = PhysicalAddress::new(0x10_0000);
        parent
            .map_page(kernel_va, kernel_pa, PageFlags::WRITABLE, &mut source)
            .expect("kernel mapping in parent");

        let mut child = parent.create_from(&mut source).expect("child space");
        // Upper half: shared through the copied PML4 slot.
        assert_eq!(child.translate(kernel_va), Some(kernel_pa));

        // Lower half: private.
        child
            .map_page(USER_VA, DATA_PA, PageFlags::USER, &mut source)
            .expect("user mapping in child");
        assert!(child.is_mapped(USER_VA));
        assert!(!parent.is_mapped(USER_VA));

        child.destroy(&mut source);
        // The parent's kernel mapping is untouched by child teardown.
        assert_eq!(parent.translate(kernel_va), Some(kernel_pa));
    }

    #[test]
    fn interior_tables_get_user_bit_only_in_lower_half() {
        let mut source = TestFrameSource::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("bare space");

        space
            .map_page(USER_VA, DATA_PA, PageFlags::USER, &mut source)
            .expect("user mapping");
        let kernel_va = VirtualAddress::new(0xFFFF_8000_0020_0000);
        space
            .map_page(kernel_va, DATA_PA, PageFlags::WRITABLE, &mut source)
            .expect("kernel mapping");

        let pml4 = table_at(space.pml4_phys());
        let user_slot = PageTableIndices::of(USER_VA).pml4;
        let kernel_slot = PageTableIndices::of(kernel_va).pml4;
        assert!(pml4[user_slot].flags().contains(PageFlags::USER));
        assert!(!pml4[kernel_slot].flags().contains(PageFlags::USER));
    }
}
