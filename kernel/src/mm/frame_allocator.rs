//! Physical frame allocator
//!
//! A single bitmap over one contiguous interval of physical memory,
//! chosen at init as the largest usable region above 1 MiB. Bit `i`
//! covers `base + i * 4096`; 0 = free, 1 = used. Allocation is first-fit
//! by design so the allocator stays O(total frames) with no auxiliary
//! structures.

use spin::Mutex;

use super::{
    boot_info::MemoryMap,
    PhysicalAddress,
};

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// Bitmap capacity: 2 Mi frames = 8 GiB of managed physical memory.
const BITMAP_WORDS: usize = 32768;
const MAX_FRAMES: usize = BITMAP_WORDS * 64;

/// Everything below 1 MiB is shielded from allocation: legacy BIOS
/// structures, the EBDA, and real-mode IVT live there.
const LOW_MEMORY_END: u64 = 0x10_0000;

/// Bitmap frame allocator over a fixed contiguous physical interval.
pub struct BitmapFrameAllocator {
    /// One bit per frame; 0 = free, 1 = used.
    bitmap: [u64; BITMAP_WORDS],
    /// Physical address corresponding to bit 0.
    base: u64,
    /// Number of frames managed.
    total_frames: usize,
    /// Number of frames currently marked used.
    used_frames: usize,
    initialized: bool,
}

impl BitmapFrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            base: 0,
            total_frames: 0,
            used_frames: 0,
            initialized: false,
        }
    }

    /// Initialize from the boot memory map.
    ///
    /// Picks the largest usable region above 1 MiB as the managed
    /// interval, shields low memory, and marks every non-usable map
    /// region overlapping the interval as used.
    pub fn init(&mut self, map: &MemoryMap) {
        let Some(region) = map.largest_usable_above(LOW_MEMORY_END) else {
            log::error!("no usable memory above 1 MiB; frame allocator disabled");
            return;
        };

        let base = region.start.max(LOW_MEMORY_END).next_multiple_of(FRAME_SIZE as u64);
        let frames = ((region.end() - base) as usize / FRAME_SIZE).min(MAX_FRAMES);

        self.bitmap = [0; BITMAP_WORDS];
        self.base = base;
        self.total_frames = frames;
        self.used_frames = 0;
        self.initialized = true;

        // Shield legacy BIOS memory. The interval starts above 1 MiB, so
        // this is a guard against a map whose largest region dips below.
        self.mark_range_used(0, LOW_MEMORY_END);

        // Every non-usable region overlapping the managed interval is
        // permanently used.
        for region in map.iter() {
            if !region.is_usable() {
                self.mark_range_used(region.start, region.end());
            }
        }
    }

    /// Mark every managed frame intersecting `[start, end)` as used.
    /// Addresses outside the managed interval are skipped silently; this
    /// runs during init where partial overlap is expected.
    fn mark_range_used(&mut self, start: u64, end: u64) {
        let mut addr = start & !(FRAME_SIZE as u64 - 1);
        while addr < end {
            if let Some(index) = self.frame_index(PhysicalAddress::new(addr)) {
                if !self.bit(index) {
                    self.set_bit(index);
                    self.used_frames += 1;
                }
            }
            addr += FRAME_SIZE as u64;
        }
    }

    /// Bit index for a managed physical address, or `None` when outside
    /// the interval.
    fn frame_index(&self, addr: PhysicalAddress) -> Option<usize> {
        let addr = addr.as_u64();
        if addr < self.base {
            return None;
        }
        let index = ((addr - self.base) / FRAME_SIZE as u64) as usize;
        if index >= self.total_frames {
            return None;
        }
        Some(index)
    }

    fn bit(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    fn clear_bit(&mut self, index: usize) {
        self.bitmap[index / 64] &= !(1 << (index % 64));
    }

    fn frame_address(&self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.base + (index * FRAME_SIZE) as u64)
    }

    /// Allocate a single 4 KiB frame. Returns `None` when exhausted.
    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        if !self.initialized {
            return None;
        }
        let full_words = self.total_frames / 64;
        for word_index in 0..=full_words.min(BITMAP_WORDS - 1) {
            let word = self.bitmap[word_index];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = word_index * 64 + bit;
            if index >= self.total_frames {
                break;
            }
            self.set_bit(index);
            self.used_frames += 1;
            return Some(self.frame_address(index));
        }
        None
    }

    /// Allocate `count` physically contiguous frames, first-fit.
    /// `count == 0` returns `None`.
    pub fn allocate_frames(&mut self, count: usize) -> Option<PhysicalAddress> {
        if !self.initialized || count == 0 || count > self.total_frames {
            return None;
        }
        if count == 1 {
            return self.allocate_frame();
        }

        let mut run = 0usize;
        for index in 0..self.total_frames {
            if self.bit(index) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = index + 1 - count;
                for i in first..=index {
                    self.set_bit(i);
                }
                self.used_frames += count;
                return Some(self.frame_address(first));
            }
        }
        None
    }

    /// Free one frame. Misaligned addresses, addresses outside the
    /// managed interval, and frames that are already free are rejected
    /// with a warning rather than a fault.
    pub fn free_frame(&mut self, addr: PhysicalAddress) {
        if !addr.is_page_aligned() {
            log::warn!("free_frame: {:#x} is not frame-aligned", addr.as_u64());
            return;
        }
        let Some(index) = self.frame_index(addr) else {
            log::warn!(
                "free_frame: {:#x} is outside the managed interval",
                addr.as_u64()
            );
            return;
        };
        if !self.bit(index) {
            log::warn!("free_frame: {:#x} is already free", addr.as_u64());
            return;
        }
        self.clear_bit(index);
        self.used_frames -= 1;
    }

    /// Free `count` contiguous frames starting at `addr`, applying the
    /// single-frame edge policy to each frame in the run.
    pub fn free_frames(&mut self, addr: PhysicalAddress, count: usize) {
        for i in 0..count {
            self.free_frame(addr.offset((i * FRAME_SIZE) as u64));
        }
    }

    /// Whether the frame containing `addr` is managed and currently free.
    pub fn is_frame_free(&self, addr: PhysicalAddress) -> bool {
        match self.frame_index(addr) {
            Some(index) => !self.bit(index),
            None => false,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_frames * FRAME_SIZE
    }

    pub fn free_bytes(&self) -> usize {
        (self.total_frames - self.used_frames) * FRAME_SIZE
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Base address of the managed interval.
    pub fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance. Not internally synchronized beyond
/// this lock; task-creation paths already hold the scheduler's task lock
/// and fault paths run with interrupts disabled.
pub static FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> = Mutex::new(BitmapFrameAllocator::new());
