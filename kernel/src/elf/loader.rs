//! ELF segment loading into an address space
//!
//! Populates a target address space with an image's LOAD segments: fresh
//! zeroed frames, file bytes copied through the direct map, page flags
//! derived from the segment's R/W/X bits (NX subject to the CPU gate).
//! Partial failures unwind everything mapped so far before propagating.

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use super::{ElfFile, PF_W, PF_X, PT_LOAD};
use crate::{
    error::{KernelError, KernelResult},
    mm::{
        address_space::{AddressSpace, FrameSource},
        phys_to_virt, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE,
    },
};

/// Result of a successful load.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Effective entry point (`e_entry`, biased by the base for shared
    /// objects).
    pub entry: VirtualAddress,
    /// Highest `p_vaddr + p_memsz` across the LOAD segments, biased.
    pub image_top: VirtualAddress,
}

/// Filesystem collaborator interface consumed by [`load_file`]. The
/// on-disk layout and caching live entirely behind it.
pub trait FileSystem {
    fn open(&mut self, path: &str, flags: u32) -> KernelResult<i32>;
    fn read(&mut self, fd: i32, buf: &mut [u8]) -> KernelResult<usize>;
    fn close(&mut self, fd: i32);
}

/// Exclusive upper bound of the user (lower-half) address range.
const USER_SPACE_TOP: u64 = 0x0000_8000_0000_0000;

fn segment_page_flags(p_flags: u32) -> PageFlags {
    let mut flags = PageFlags::USER;
    if p_flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if p_flags & PF_X == 0 {
        flags |= PageFlags::NO_EXECUTE;
    }
    flags
}

/// Load a parsed image's LOAD segments into `space`.
///
/// `base` biases every virtual address (and the entry point) when the
/// image is a shared object; executables load at their linked addresses
/// and ignore it.
#[cfg(feature = "alloc")]
pub fn load(
    data: &[u8],
    space: &mut AddressSpace,
    base: u64,
    source: &mut impl FrameSource,
) -> KernelResult<LoadedImage> {
    let file = ElfFile::parse(data)?;
    let bias = if file.is_shared_object() { base } else { 0 };

    let mut mapped: Vec<(VirtualAddress, PhysicalAddress)> = Vec::new();
    let mut image_top = 0u64;

    let result = (|| -> KernelResult<()> {
        for header in file.program_headers() {
            if header.p_type != PT_LOAD {
                continue;
            }
            if header.p_filesz > header.p_memsz {
                return Err(KernelError::InvalidElf {
                    reason: "segment file size exceeds memory size",
                });
            }
            let file_end = header.p_offset.checked_add(header.p_filesz);
            if !matches!(file_end, Some(end) if end <= data.len() as u64) {
                return Err(KernelError::InvalidElf {
                    reason: "segment data out of bounds",
                });
            }

            let vaddr = header.p_vaddr.wrapping_add(bias);
            let segment_end = vaddr.checked_add(header.p_memsz);
            if vaddr < header.p_vaddr || !matches!(segment_end, Some(end) if end <= USER_SPACE_TOP)
            {
                return Err(KernelError::InvalidElf {
                    reason: "segment outside the user address range",
                });
            }
            let page_start = vaddr & !(PAGE_SIZE as u64 - 1);
            let page_end = (vaddr + header.p_memsz).next_multiple_of(PAGE_SIZE as u64);
            let flags = segment_page_flags(header.p_flags);

            let mut page = page_start;
            while page < page_end {
                let frame = source.allocate_frame().ok_or(KernelError::OutOfMemory {
                    requested: (page_end - page_start) as usize,
                    available: (page - page_start) as usize,
                })?;
                // Fresh backing memory: zero first, then copy the file
                // bytes that land in this page.
                let frame_virt = phys_to_virt(frame);
                // SAFETY: the frame was just allocated and is only
                // reachable through the direct map until mapped below.
                unsafe {
                    core::ptr::write_bytes(frame_virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
                }

                let copy_start = page.max(vaddr);
                let copy_end = (page + PAGE_SIZE as u64).min(vaddr + header.p_filesz);
                if copy_start < copy_end {
                    let len = (copy_end - copy_start) as usize;
                    let src = header.p_offset + (copy_start - vaddr);
                    let dst_offset = (copy_start - page) as usize;
                    // SAFETY: src..src+len is within `data` (checked
                    // above) and dst_offset+len fits the 4 KiB frame.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            data.as_ptr().add(src as usize),
                            frame_virt.as_mut_ptr::<u8>().add(dst_offset),
                            len,
                        );
                    }
                }

                let virt = VirtualAddress::new(page);
                if let Err(err) = space.map_page(virt, frame, flags, source) {
                    source.free_frame(frame);
                    return Err(err);
                }
                mapped.push((virt, frame));
                page += PAGE_SIZE as u64;
            }

            image_top = image_top.max(vaddr + header.p_memsz);
        }
        Ok(())
    })();

    if let Err(err) = result {
        // Undo every page this call mapped before reporting failure.
        for (virt, frame) in mapped {
            if space.unmap_page(virt).is_ok() {
                source.free_frame(frame);
            }
        }
        return Err(err);
    }

    Ok(LoadedImage {
        entry: VirtualAddress::new(file.entry() + bias),
        image_top: VirtualAddress::new(image_top),
    })
}

/// Unmap every LOAD segment of `data` from `space` and free the backing
/// frames. Pages that are no longer mapped are skipped with a warning.
#[cfg(feature = "alloc")]
pub fn unload(
    data: &[u8],
    space: &mut AddressSpace,
    base: u64,
    source: &mut impl FrameSource,
) -> KernelResult<()> {
    let file = ElfFile::parse(data)?;
    let bias = if file.is_shared_object() { base } else { 0 };

    for header in file.program_headers() {
        if header.p_type != PT_LOAD {
            continue;
        }
        let vaddr = header.p_vaddr + bias;
        let page_start = vaddr & !(PAGE_SIZE as u64 - 1);
        let page_end = (vaddr + header.p_memsz).next_multiple_of(PAGE_SIZE as u64);

        let mut page = page_start;
        while page < page_end {
            match space.unmap_page(VirtualAddress::new(page)) {
                Ok(frame) => source.free_frame(frame),
                Err(_) => log::warn!("unload: {:#x} was not mapped", page),
            }
            page += PAGE_SIZE as u64;
        }
    }
    Ok(())
}

/// Slurp `path` through the filesystem collaborator and load it.
#[cfg(feature = "alloc")]
pub fn load_file(
    fs: &mut dyn FileSystem,
    path: &str,
    space: &mut AddressSpace,
    base: u64,
    source: &mut impl FrameSource,
) -> KernelResult<LoadedImage> {
    let fd = fs.open(path, 0)?;
    let mut image = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match fs.read(fd, &mut chunk) {
            Ok(0) => break,
            Ok(n) => image.extend_from_slice(&chunk[..n]),
            Err(err) => {
                fs.close(fd);
                return Err(err);
            }
        }
    }
    fs.close(fd);
    load(&image, space, base, source)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::elf::test_image::{build, SegmentSpec};
    use crate::elf::{ET_DYN, ET_EXEC, PF_R};
    use crate::mm::page_table::PageTable;
    use std::{boxed::Box, vec, vec::Vec};

    // The NX gate is process-global; tests that touch it serialize here
    // and restore "supported" on the way out.
    static NX_GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// Heap-backed frames: page-aligned, writable host memory whose
    /// address doubles as the physical address (HHDM offset is zero).
    struct HeapFrames {
        allocated: usize,
        freed: usize,
    }

    impl HeapFrames {
        fn new() -> Self {
            crate::arch::x86_64::cpu::override_nx(true);
            Self {
                allocated: 0,
                freed: 0,
            }
        }

        fn outstanding(&self) -> usize {
            self.allocated - self.freed
        }
    }

    impl FrameSource for HeapFrames {
        fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
            self.allocated += 1;
            let frame: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
            Some(PhysicalAddress::new(frame as *mut PageTable as u64))
        }

        fn free_frame(&mut self, _frame: PhysicalAddress) {
            self.freed += 1;
        }
    }

    fn read_mapped(space: &AddressSpace, virt: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let phys = space
                .translate(VirtualAddress::new(virt + i as u64))
                .expect("address should be mapped");
            // Host identity mapping: the physical address is readable.
            out.push(unsafe { *(phys.as_u64() as *const u8) });
        }
        out
    }

    #[test]
    fn load_copies_and_zero_fills() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");

        let image = build(
            ET_EXEC,
            0x40_0000,
            &[SegmentSpec {
                vaddr: 0x40_0000,
                data: vec![0x90; 64],
                memsz: 128,
                flags: PF_R | PF_X,
            }],
        );
        let loaded = load(&image, &mut space, 0, &mut source).expect("load should succeed");
        assert_eq!(loaded.entry.as_u64(), 0x40_0000);
        assert_eq!(loaded.image_top.as_u64(), 0x40_0000 + 128);

        let bytes = read_mapped(&space, 0x40_0000, 128);
        assert!(bytes[..64].iter().all(|&b| b == 0x90));
        assert!(bytes[64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn segment_flags_become_page_flags() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");

        let image = build(
            ET_EXEC,
            0x40_0000,
            &[
                SegmentSpec {
                    vaddr: 0x40_0000,
                    data: vec![0xC3; 16],
                    memsz: 16,
                    flags: PF_R | PF_X,
                },
                SegmentSpec {
                    vaddr: 0x40_1000,
                    data: vec![0xAA; 16],
                    memsz: 16,
                    flags: PF_R | PF_W,
                },
            ],
        );
        load(&image, &mut space, 0, &mut source).expect("load");

        let code = space
            .mapping_flags(VirtualAddress::new(0x40_0000))
            .expect("code page mapped");
        assert!(code.contains(PageFlags::USER));
        assert!(!code.contains(PageFlags::WRITABLE));
        assert!(!code.contains(PageFlags::NO_EXECUTE));

        let data = space
            .mapping_flags(VirtualAddress::new(0x40_1000))
            .expect("data page mapped");
        assert!(data.contains(PageFlags::WRITABLE));
        assert!(data.contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn nx_is_dropped_when_unsupported() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");

        crate::arch::x86_64::cpu::override_nx(false);
        let image = build(
            ET_EXEC,
            0x40_0000,
            &[SegmentSpec {
                vaddr: 0x40_0000,
                data: vec![0xAA; 16],
                memsz: 16,
                flags: PF_R | PF_W,
            }],
        );
        load(&image, &mut space, 0, &mut source).expect("load");
        let flags = space
            .mapping_flags(VirtualAddress::new(0x40_0000))
            .expect("page mapped");
        assert!(!flags.contains(PageFlags::NO_EXECUTE));
        crate::arch::x86_64::cpu::override_nx(true);
    }

    #[test]
    fn shared_objects_are_biased_by_base() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");

        let image = build(
            ET_DYN,
            0x1000,
            &[SegmentSpec {
                vaddr: 0x1000,
                data: vec![0x55; 32],
                memsz: 32,
                flags: PF_R | PF_X,
            }],
        );
        let loaded = load(&image, &mut space, 0x7000_0000, &mut source).expect("load");
        assert_eq!(loaded.entry.as_u64(), 0x7000_1000);
        assert!(space.is_mapped(VirtualAddress::new(0x7000_1000)));
        assert!(!space.is_mapped(VirtualAddress::new(0x1000)));
        let bytes = read_mapped(&space, 0x7000_1000, 32);
        assert!(bytes.iter().all(|&b| b == 0x55));
    }

    #[test]
    fn invalid_class_maps_nothing() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");
        let outstanding_before = source.outstanding();

        let mut image = build(
            ET_EXEC,
            0x40_0000,
            &[SegmentSpec {
                vaddr: 0x40_0000,
                data: vec![0x90; 64],
                memsz: 64,
                flags: PF_R | PF_X,
            }],
        );
        image[4] = 1; // EI_CLASS: 32-bit
        assert!(load(&image, &mut space, 0, &mut source).is_err());
        assert!(!space.is_mapped(VirtualAddress::new(0x40_0000)));
        assert_eq!(source.outstanding(), outstanding_before);
    }

    #[test]
    fn truncated_segment_unwinds_earlier_mappings() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");

        let mut image = build(
            ET_EXEC,
            0x40_0000,
            &[
                SegmentSpec {
                    vaddr: 0x40_0000,
                    data: vec![0x90; 32],
                    memsz: 32,
                    flags: PF_R | PF_X,
                },
                SegmentSpec {
                    vaddr: 0x40_1000,
                    data: vec![0xAA; 64],
                    memsz: 64,
                    flags: PF_R,
                },
            ],
        );
        // Chop the tail so the second segment's bytes fall outside.
        image.truncate(image.len() - 48);

        let err = load(&image, &mut space, 0, &mut source)
            .expect_err("truncated segment data must fail");
        assert_eq!(
            err,
            KernelError::InvalidElf {
                reason: "segment data out of bounds"
            }
        );
        // The first segment's page was unwound.
        assert!(!space.is_mapped(VirtualAddress::new(0x40_0000)));
    }

    #[test]
    fn unload_returns_every_segment_frame() {
        let _nx = NX_GATE.lock().unwrap();
        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");

        let image = build(
            ET_EXEC,
            0x40_0000,
            &[SegmentSpec {
                vaddr: 0x40_0000,
                data: vec![0x90; 64],
                memsz: 2 * PAGE_SIZE as u64, // two backing pages
                flags: PF_R | PF_X,
            }],
        );
        let freed_before = source.freed;
        load(&image, &mut space, 0, &mut source).expect("load");
        unload(&image, &mut space, 0, &mut source).expect("unload");
        assert_eq!(source.freed - freed_before, 2);
        assert!(!space.is_mapped(VirtualAddress::new(0x40_0000)));
        assert!(!space.is_mapped(VirtualAddress::new(0x40_1000)));
    }

    #[test]
    fn load_file_reads_through_the_collaborator() {
        let _nx = NX_GATE.lock().unwrap();

        struct OneFileFs {
            image: Vec<u8>,
            cursor: usize,
            open_fds: usize,
        }

        impl FileSystem for OneFileFs {
            fn open(&mut self, path: &str, _flags: u32) -> KernelResult<i32> {
                if path == "/bin/init" {
                    self.open_fds += 1;
                    Ok(3)
                } else {
                    Err(KernelError::InvalidArgument { name: "path" })
                }
            }

            fn read(&mut self, _fd: i32, buf: &mut [u8]) -> KernelResult<usize> {
                let n = buf.len().min(self.image.len() - self.cursor);
                buf[..n].copy_from_slice(&self.image[self.cursor..self.cursor + n]);
                self.cursor += n;
                Ok(n)
            }

            fn close(&mut self, _fd: i32) {
                self.open_fds -= 1;
            }
        }

        let mut source = HeapFrames::new();
        let mut space = AddressSpace::new_bare(&mut source).expect("space");
        let mut fs = OneFileFs {
            image: build(
                ET_EXEC,
                0x40_0000,
                &[SegmentSpec {
                    vaddr: 0x40_0000,
                    data: vec![0x90; 16],
                    memsz: 16,
                    flags: PF_R | PF_X,
                }],
            ),
            cursor: 0,
            open_fds: 0,
        };

        let loaded =
            load_file(&mut fs, "/bin/init", &mut space, 0, &mut source).expect("load_file");
        assert_eq!(loaded.entry.as_u64(), 0x40_0000);
        assert_eq!(fs.open_fds, 0);
        assert!(space.is_mapped(VirtualAddress::new(0x40_0000)));
    }
}
