//! Kernel heap
//!
//! Backs the global `linked_list_allocator` heap with a kernel virtual
//! arena. Core kernel state (task table, queues, bitmaps, arenas) is
//! static and does not depend on the heap; it serves `alloc` consumers
//! such as the ELF loader's header vectors and collaborator layers.

/// Kernel heap size (4 MiB).
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
pub fn init() {
    use super::vmm::{vmm_allocate, ArenaFlags};

    match vmm_allocate(HEAP_SIZE, ArenaFlags::KERNEL) {
        Ok(base) => {
            // SAFETY: the arena is freshly mapped, zeroed, writable
            // kernel memory of exactly HEAP_SIZE bytes and is handed to
            // the allocator exclusively.
            unsafe {
                crate::allocator()
                    .lock()
                    .init(base.as_mut_ptr::<u8>(), HEAP_SIZE);
            }
            log::info!("kernel heap: {} KiB at {:#x}", HEAP_SIZE / 1024, base.as_u64());
        }
        Err(err) => {
            crate::critical!("kernel heap init failed: {}", err);
            crate::arch::halt();
        }
    }
}
