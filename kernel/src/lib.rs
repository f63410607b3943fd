//! Helios kernel library
//!
//! Core execution substrate for the Helios kernel: physical frame
//! allocation, address-space construction, interrupt dispatch, preemptive
//! scheduling, and ELF program loading. Exported as a library so the
//! pure parts can be exercised by host-side unit tests.

#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// On bare metal the kernel heap backs the global allocator. On the host
// (x86_64-unknown-linux-gnu, used for unit tests) link std and delegate to
// the system allocator so test code using Vec/String compiles and runs.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global kernel heap allocator.
#[cfg(target_os = "none")]
pub fn allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod serial;

pub mod arch;
pub mod elf;
pub mod error;
pub mod logger;
pub mod mm;
pub mod sched;

// Re-exports for collaborator layers and tests
pub use error::{KernelError, KernelResult};
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use sched::{Priority, TaskId, TaskState};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
