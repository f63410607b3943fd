//! Virtual arena allocator
//!
//! A stop-gap sub-allocator for kernel and user virtual space: a small
//! static table of fixed arenas, each handed out whole. `vmm_allocate`
//! never splits an arena, so two collaborators (e.g. the mmap and brk
//! layers) can never receive aliasing ranges. Successful allocation
//! returns a page-aligned region of at least the requested size, backed
//! by freshly allocated, zeroed frames; freeing a base that was never
//! allocated is a logged no-op.

use bitflags::bitflags;
use spin::Mutex;

use super::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Which pool an arena belongs to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArenaFlags: u32 {
        const KERNEL = 1 << 0;
        const USER = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct VirtualArena {
    base: u64,
    size: u64,
    flags: ArenaFlags,
    in_use: bool,
}

impl VirtualArena {
    const fn new(base: u64, size: u64, flags: ArenaFlags) -> Self {
        Self {
            base,
            size,
            flags,
            in_use: false,
        }
    }
}

const ARENA_COUNT: usize = 8;

/// The fixed arena table. Kernel arenas live in an otherwise unused
/// upper-half window; user arenas sit below the user stack region.
static ARENAS: Mutex<[VirtualArena; ARENA_COUNT]> = Mutex::new([
    VirtualArena::new(0xFFFF_9000_0000_0000, 16 * 1024 * 1024, ArenaFlags::KERNEL),
    VirtualArena::new(0xFFFF_9000_0100_0000, 4 * 1024 * 1024, ArenaFlags::KERNEL),
    VirtualArena::new(0xFFFF_9000_0140_0000, 4 * 1024 * 1024, ArenaFlags::KERNEL),
    VirtualArena::new(0xFFFF_9000_0180_0000, 1024 * 1024, ArenaFlags::KERNEL),
    VirtualArena::new(0x1000_0000, 16 * 1024 * 1024, ArenaFlags::USER),
    VirtualArena::new(0x2000_0000, 16 * 1024 * 1024, ArenaFlags::USER),
    VirtualArena::new(0x3000_0000, 4 * 1024 * 1024, ArenaFlags::USER),
    VirtualArena::new(0x4000_0000, 4 * 1024 * 1024, ArenaFlags::USER),
]);

/// First fit over the arena table: unused, matching pool, big enough.
fn take_arena(arenas: &mut [VirtualArena], size: u64, flags: ArenaFlags) -> Option<usize> {
    for (index, arena) in arenas.iter_mut().enumerate() {
        if !arena.in_use && arena.flags == flags && arena.size >= size {
            arena.in_use = true;
            return Some(index);
        }
    }
    None
}

/// Allocate a virtual region of at least `size` bytes (rounded up to
/// whole pages) from the requested pool, backed by fresh zeroed frames
/// mapped into the current address space.
pub fn vmm_allocate(size: usize, flags: ArenaFlags) -> KernelResult<VirtualAddress> {
    if size == 0 {
        return Err(KernelError::InvalidArgument { name: "size" });
    }
    let rounded = size.next_multiple_of(PAGE_SIZE);

    let base = {
        let mut arenas = ARENAS.lock();
        let index = take_arena(&mut *arenas, rounded as u64, flags).ok_or(
            KernelError::ResourceExhausted {
                resource: "virtual arena",
            },
        )?;
        arenas[index].base
    };

    #[cfg(target_os = "none")]
    if let Err(err) = back_with_frames(VirtualAddress::new(base), rounded, flags) {
        release_arena(base);
        return Err(err);
    }

    Ok(VirtualAddress::new(base))
}

/// Return a region to the pool, unmapping and freeing its frames.
/// Freeing a base that is not an allocated arena is a logged no-op.
pub fn vmm_free(base: VirtualAddress) {
    let (known, size) = {
        let arenas = ARENAS.lock();
        match arenas
            .iter()
            .find(|a| a.base == base.as_u64() && a.in_use)
        {
            Some(arena) => (true, arena.size),
            None => (false, 0),
        }
    };
    if !known {
        log::warn!("vmm_free: {:#x} is not an allocated arena", base.as_u64());
        return;
    }

    #[cfg(target_os = "none")]
    drop_backing_frames(base, size as usize);
    #[cfg(not(target_os = "none"))]
    let _ = size;

    release_arena(base.as_u64());
}

fn release_arena(base: u64) {
    let mut arenas = ARENAS.lock();
    if let Some(arena) = arenas.iter_mut().find(|a| a.base == base) {
        arena.in_use = false;
    }
}

/// Map a physical range (MMIO registers, framebuffers) into a kernel
/// arena with explicit uncached mappings and return its virtual base.
/// The caller's view is never the raw direct-map pointer: device ranges
/// get their own entries so the attributes are what the caller asked
/// for.
pub fn map_physical(phys: PhysicalAddress, size: usize) -> KernelResult<VirtualAddress> {
    if size == 0 {
        return Err(KernelError::InvalidArgument { name: "size" });
    }
    let rounded = size.next_multiple_of(PAGE_SIZE);

    let base = {
        let mut arenas = ARENAS.lock();
        let index = take_arena(&mut *arenas, rounded as u64, ArenaFlags::KERNEL).ok_or(
            KernelError::ResourceExhausted {
                resource: "virtual arena",
            },
        )?;
        arenas[index].base
    };

    #[cfg(target_os = "none")]
    {
        use super::address_space::{AddressSpace, GlobalFrameSource};
        use super::PageFlags;

        let mut source = GlobalFrameSource;
        let mut space = AddressSpace::current();
        if let Err(err) = space.map_physical_range(
            VirtualAddress::new(base),
            phys.align_down(PAGE_SIZE as u64),
            rounded,
            PageFlags::WRITABLE | PageFlags::NO_CACHE | PageFlags::NO_EXECUTE,
            &mut source,
        ) {
            release_arena(base);
            return Err(err);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = phys;

    Ok(VirtualAddress::new(base))
}

/// Undo a [`map_physical`]: unmap the range and return the arena. The
/// device frames themselves are not RAM and are never handed to the
/// frame allocator.
pub fn unmap_physical(base: VirtualAddress, size: usize) {
    let known = {
        let arenas = ARENAS.lock();
        arenas.iter().any(|a| a.base == base.as_u64() && a.in_use)
    };
    if !known {
        log::warn!(
            "unmap_physical: {:#x} is not a mapped device range",
            base.as_u64()
        );
        return;
    }

    #[cfg(target_os = "none")]
    {
        use super::address_space::AddressSpace;

        let mut space = AddressSpace::current();
        let rounded = size.next_multiple_of(PAGE_SIZE);
        for page in 0..rounded / PAGE_SIZE {
            let virt = base.offset((page * PAGE_SIZE) as u64);
            if space.unmap_page(virt).is_err() {
                log::warn!("unmap_physical: {:#x} was not mapped", virt.as_u64());
            }
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = size;

    release_arena(base.as_u64());
}

/// Allocate, zero, and map one frame per page of the region. On frame
/// exhaustion everything mapped so far is undone before the error
/// propagates.
#[cfg(target_os = "none")]
fn back_with_frames(base: VirtualAddress, size: usize, flags: ArenaFlags) -> KernelResult<()> {
    use super::address_space::{AddressSpace, FrameSource, GlobalFrameSource};
    use super::PageFlags;

    let mut source = GlobalFrameSource;
    let mut space = AddressSpace::current();
    let mut page_flags = PageFlags::WRITABLE | PageFlags::NO_EXECUTE;
    if flags.contains(ArenaFlags::USER) {
        page_flags |= PageFlags::USER;
    }

    let pages = size / PAGE_SIZE;
    for page in 0..pages {
        let virt = base.offset((page * PAGE_SIZE) as u64);
        let frame = match source.allocate_frame() {
            Some(frame) => frame,
            None => {
                drop_backing_frames(base, page * PAGE_SIZE);
                return Err(KernelError::OutOfMemory {
                    requested: size,
                    available: page * PAGE_SIZE,
                });
            }
        };
        zero_frame(frame);
        if let Err(err) = space.map_page(virt, frame, page_flags, &mut source) {
            source.free_frame(frame);
            drop_backing_frames(base, page * PAGE_SIZE);
            return Err(err);
        }
    }
    Ok(())
}

/// Unmap `size` bytes from `base` in the current address space and free
/// the backing frames.
#[cfg(target_os = "none")]
fn drop_backing_frames(base: VirtualAddress, size: usize) {
    use super::address_space::{AddressSpace, FrameSource, GlobalFrameSource};

    let mut source = GlobalFrameSource;
    let mut space = AddressSpace::current();
    for page in 0..size / PAGE_SIZE {
        let virt = base.offset((page * PAGE_SIZE) as u64);
        match space.unmap_page(virt) {
            Ok(frame) => source.free_frame(frame),
            Err(_) => log::warn!("vmm: {:#x} was not mapped during teardown", virt.as_u64()),
        }
    }
}

/// Zero a frame through the direct map.
#[cfg(target_os = "none")]
fn zero_frame(frame: PhysicalAddress) {
    // SAFETY: the frame was just handed out by the allocator and is not
    // yet mapped anywhere else; the direct map covers it.
    unsafe {
        core::ptr::write_bytes(
            super::phys_to_virt(frame).as_mut_ptr::<u8>(),
            0,
            PAGE_SIZE,
        );
    }
}

#[cfg(not(target_os = "none"))]
#[allow(dead_code)]
fn zero_frame(_frame: PhysicalAddress) {}
