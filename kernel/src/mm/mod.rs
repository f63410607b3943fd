//! Memory management
//!
//! Physical frame allocation, address-space construction, the virtual
//! arena allocator, and the kernel heap. The bootloader's higher-half
//! direct map (HHDM) is the only window the kernel uses to touch physical
//! memory; `phys_to_virt` is defined solely in terms of it.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

pub mod address_space;
pub mod boot_info;
pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vmm;

pub use address_space::AddressSpace;
pub use frame_allocator::{BitmapFrameAllocator, FRAME_ALLOCATOR, FRAME_SIZE};

/// Size of a virtual page (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Size of a 2 MiB large page.
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Size of a 1 GiB huge page.
pub const HUGE_PAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Whether this address is in the user (lower) half of the canonical
    /// address space.
    pub const fn is_lower_half(&self) -> bool {
        self.0 < 0x8000_0000_0000_0000
    }
}

bitflags! {
    /// Page table entry flags. Only meaningful on present entries: a
    /// non-present entry carries no other bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Virtual offset of the higher-half direct map, delivered by the
/// bootloader and captured once during `init`. Zero means "not yet set";
/// the host test target leaves it at zero so `phys_to_virt` degenerates
/// to the identity and page-table walks operate on ordinary test memory.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Kernel-visible pointer to a physical frame through the direct map.
/// Defined only for addresses reachable via the HHDM, i.e. all of RAM.
#[inline]
pub fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(hhdm_offset() + phys.as_u64())
}

/// Initialize memory management from the boot protocol data: capture the
/// HHDM offset, ingest the memory map into the frame allocator, and bring
/// up the kernel heap.
#[cfg(target_os = "none")]
pub fn init(boot_info: &bootloader_api::BootInfo) {
    let Some(offset) = boot_info.physical_memory_offset.into_option() else {
        crate::critical!("bootloader did not map physical memory; cannot continue");
        crate::arch::halt();
    };
    set_hhdm_offset(offset);

    let map = boot_info::ingest(&boot_info.memory_regions);
    log::info!(
        "memory map: {} regions, {} MiB total, {} MiB usable",
        map.len(),
        map.total_bytes() / (1024 * 1024),
        map.usable_bytes() / (1024 * 1024)
    );

    FRAME_ALLOCATOR.lock().init(&map);
    {
        let allocator = FRAME_ALLOCATOR.lock();
        log::info!(
            "frame allocator: {} KiB managed, {} KiB free",
            allocator.total_bytes() / 1024,
            allocator.free_bytes() / 1024
        );
    }

    {
        let mut source = address_space::GlobalFrameSource;
        if let Err(err) = address_space::init_kernel_upper_half(&mut source) {
            crate::critical!("failed to populate kernel PML4 slots: {}", err);
            crate::arch::halt();
        }
    }

    heap::init();
}
