//! ELF64 image parsing and validation

use core::mem;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

pub mod loader;

#[cfg(feature = "alloc")]
pub use loader::{load, load_file, unload};
pub use loader::{FileSystem, LoadedImage};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ELF_VERSION_CURRENT: u8 = 1;
const EM_X86_64: u16 = 0x3E;

/// Statically linked executable.
pub const ET_EXEC: u16 = 2;
/// Position-independent (shared object) image, loaded at a caller base.
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

/// Canonical entry sizes for ELF64 header tables.
const PHENTSIZE: u16 = 56;
const SHENTSIZE: u16 = 64;

/// A validated view over an ELF64 byte buffer.
#[derive(Debug)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

impl<'a> ElfFile<'a> {
    /// Validate the buffer and wrap it. Rejects anything that is not a
    /// little-endian x86_64 ELF64 executable or shared object with
    /// canonical table entry sizes and in-bounds header tables.
    pub fn parse(data: &'a [u8]) -> KernelResult<Self> {
        if data.len() < mem::size_of::<Elf64Header>() {
            return Err(KernelError::InvalidElf {
                reason: "buffer smaller than the ELF header",
            });
        }

        // SAFETY: the length check above guarantees the read stays in
        // bounds; read_unaligned puts no alignment requirement on `data`.
        let header =
            unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

        if header.magic != ELF_MAGIC {
            return Err(KernelError::InvalidElf {
                reason: "bad magic",
            });
        }
        if header.class != ELF_CLASS_64 {
            return Err(KernelError::InvalidElf {
                reason: "not a 64-bit image",
            });
        }
        if header.data != ELF_DATA_2LSB {
            return Err(KernelError::InvalidElf {
                reason: "not little-endian",
            });
        }
        if header.version != ELF_VERSION_CURRENT {
            return Err(KernelError::InvalidElf {
                reason: "unknown ELF version",
            });
        }
        if header.machine != EM_X86_64 {
            return Err(KernelError::InvalidElf {
                reason: "not an x86_64 image",
            });
        }
        if header.elf_type != ET_EXEC && header.elf_type != ET_DYN {
            return Err(KernelError::InvalidElf {
                reason: "not an executable or shared object",
            });
        }
        if header.phnum > 0 && header.phentsize != PHENTSIZE {
            return Err(KernelError::InvalidElf {
                reason: "non-canonical program header entry size",
            });
        }
        if header.shnum > 0 && header.shentsize != SHENTSIZE {
            return Err(KernelError::InvalidElf {
                reason: "non-canonical section header entry size",
            });
        }

        let ph_end = header
            .phoff
            .checked_add(header.phnum as u64 * PHENTSIZE as u64);
        if !matches!(ph_end, Some(end) if end <= data.len() as u64) {
            return Err(KernelError::InvalidElf {
                reason: "program header table out of bounds",
            });
        }
        let sh_end = header
            .shoff
            .checked_add(header.shnum as u64 * SHENTSIZE as u64);
        if !matches!(sh_end, Some(end) if end <= data.len() as u64) {
            return Err(KernelError::InvalidElf {
                reason: "section header table out of bounds",
            });
        }

        Ok(Self { data, header })
    }

    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Raw entry point as stored in the header (before any base bias).
    pub fn entry(&self) -> u64 {
        self.header.entry
    }

    pub fn is_shared_object(&self) -> bool {
        self.header.elf_type == ET_DYN
    }

    /// Copy of the program header table. Bounds were validated at parse.
    #[cfg(feature = "alloc")]
    pub fn program_headers(&self) -> Vec<Elf64ProgramHeader> {
        let mut headers = Vec::with_capacity(self.header.phnum as usize);
        for index in 0..self.header.phnum as usize {
            let offset = self.header.phoff as usize + index * PHENTSIZE as usize;
            // SAFETY: parse() checked that the whole table lies within
            // the buffer; read_unaligned tolerates any offset.
            let ph = unsafe {
                core::ptr::read_unaligned(
                    self.data.as_ptr().add(offset) as *const Elf64ProgramHeader
                )
            };
            headers.push(ph);
        }
        headers
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_image {
    //! Builders for synthetic ELF images used across the loader and
    //! scheduler tests.

    use super::*;
    use std::vec::Vec;

    pub struct SegmentSpec {
        pub vaddr: u64,
        pub data: Vec<u8>,
        pub memsz: u64,
        pub flags: u32,
    }

    /// Assemble a minimal ELF64 image: header, program header table,
    /// then segment bytes.
    pub fn build(elf_type: u16, entry: u64, segments: &[SegmentSpec]) -> Vec<u8> {
        let phoff = 64u64;
        let mut image = Vec::new();
        let data_start = phoff as usize + segments.len() * 56;

        // ELF header
        image.extend_from_slice(&ELF_MAGIC);
        image.push(2); // class: 64-bit
        image.push(1); // data: little-endian
        image.push(1); // version
        image.push(0); // osabi
        image.push(0); // abiversion
        image.extend_from_slice(&[0; 7]);
        image.extend_from_slice(&elf_type.to_le_bytes());
        image.extend_from_slice(&0x3Eu16.to_le_bytes()); // machine
        image.extend_from_slice(&1u32.to_le_bytes()); // version2
        image.extend_from_slice(&entry.to_le_bytes());
        image.extend_from_slice(&phoff.to_le_bytes());
        image.extend_from_slice(&0u64.to_le_bytes()); // shoff
        image.extend_from_slice(&0u32.to_le_bytes()); // flags
        image.extend_from_slice(&64u16.to_le_bytes()); // ehsize
        image.extend_from_slice(&56u16.to_le_bytes()); // phentsize
        image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        image.extend_from_slice(&64u16.to_le_bytes()); // shentsize
        image.extend_from_slice(&0u16.to_le_bytes()); // shnum
        image.extend_from_slice(&0u16.to_le_bytes()); // shstrndx
        assert_eq!(image.len(), 64);

        // Program headers
        let mut offset = data_start as u64;
        for segment in segments {
            image.extend_from_slice(&PT_LOAD.to_le_bytes());
            image.extend_from_slice(&segment.flags.to_le_bytes());
            image.extend_from_slice(&offset.to_le_bytes());
            image.extend_from_slice(&segment.vaddr.to_le_bytes());
            image.extend_from_slice(&segment.vaddr.to_le_bytes()); // paddr
            image.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
            image.extend_from_slice(&segment.memsz.to_le_bytes());
            image.extend_from_slice(&0x1000u64.to_le_bytes()); // align
            offset += segment.data.len() as u64;
        }

        // Segment bytes
        for segment in segments {
            image.extend_from_slice(&segment.data);
        }
        image
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::test_image::{build, SegmentSpec};
    use super::*;
    use std::vec;

    fn one_segment_image() -> std::vec::Vec<u8> {
        build(
            ET_EXEC,
            0x40_0000,
            &[SegmentSpec {
                vaddr: 0x40_0000,
                data: vec![0x90; 64],
                memsz: 64,
                flags: PF_R | PF_X,
            }],
        )
    }

    #[test]
    fn valid_image_parses() {
        let image = one_segment_image();
        let file = ElfFile::parse(&image).expect("a well-formed image should parse");
        assert_eq!(file.entry(), 0x40_0000);
        assert!(!file.is_shared_object());
        let headers = file.program_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].p_type, PT_LOAD);
        assert_eq!(headers[0].p_vaddr, 0x40_0000);
        assert_eq!(headers[0].p_filesz, 64);
    }

    #[test]
    fn parsed_header_matches_image_bytes() {
        let image = one_segment_image();
        let file = ElfFile::parse(&image).expect("parse");
        // The header view must agree byte-for-byte with the buffer.
        assert_eq!(&image[..4], &file.header().magic);
        assert_eq!(
            u64::from_le_bytes(image[24..32].try_into().unwrap()),
            file.header().entry
        );
        assert_eq!(
            u16::from_le_bytes(image[56..58].try_into().unwrap()),
            file.header().phnum
        );
    }

    #[test]
    fn thirty_two_bit_class_is_rejected() {
        let mut image = one_segment_image();
        image[4] = 1; // EI_CLASS: 32-bit
        let err = ElfFile::parse(&image).expect_err("32-bit class must fail");
        assert_eq!(
            err,
            KernelError::InvalidElf {
                reason: "not a 64-bit image"
            }
        );
    }

    #[test]
    fn big_endian_is_rejected() {
        let mut image = one_segment_image();
        image[5] = 2; // EI_DATA: big-endian
        assert!(ElfFile::parse(&image).is_err());
    }

    #[test]
    fn wrong_machine_is_rejected() {
        let mut image = one_segment_image();
        image[18] = 0xB7; // EM_AARCH64
        image[19] = 0;
        assert!(ElfFile::parse(&image).is_err());
    }

    #[test]
    fn relocatable_object_is_rejected() {
        let mut image = one_segment_image();
        image[16] = 1; // ET_REL
        image[17] = 0;
        assert!(ElfFile::parse(&image).is_err());
    }

    #[test]
    fn non_canonical_phentsize_is_rejected() {
        let mut image = one_segment_image();
        image[54] = 48; // e_phentsize
        image[55] = 0;
        assert!(ElfFile::parse(&image).is_err());
    }

    #[test]
    fn truncated_header_table_is_rejected() {
        let mut image = one_segment_image();
        // Claim 100 program headers; the table would run past the end.
        image[56] = 100;
        image[57] = 0;
        let err = ElfFile::parse(&image).expect_err("oversized table must fail");
        assert_eq!(
            err,
            KernelError::InvalidElf {
                reason: "program header table out of bounds"
            }
        );
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        assert!(ElfFile::parse(&[0x7F, b'E', b'L', b'F']).is_err());
    }
}
