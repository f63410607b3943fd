//! Page fault decoding
//!
//! There is no demand paging: every fault is fatal to the execution
//! context that raised it. The handler's job is to decode the error
//! bits, emit one structured record, and halt the offender — the whole
//! CPU for kernel-mode faults, just the current task for user-mode ones.

use bitflags::bitflags;

bitflags! {
    /// Error code pushed by the CPU for vector 14.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultBits: u64 {
        /// Set: protection violation on a present page. Clear: the page
        /// was not present.
        const PROTECTION_VIOLATION = 1 << 0;
        /// The access was a write.
        const CAUSED_BY_WRITE = 1 << 1;
        /// The access came from ring 3.
        const USER_MODE = 1 << 2;
        /// A reserved bit was set in a page-table entry.
        const MALFORMED_TABLE = 1 << 3;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Everything the trap handler knows about one fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// CR2 at the time of the fault.
    pub faulting_address: u64,
    pub error_code: PageFaultBits,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
}

impl PageFaultInfo {
    /// The faulted page was present (the fault is a rights violation).
    pub fn page_was_present(&self) -> bool {
        self.error_code.contains(PageFaultBits::PROTECTION_VIOLATION)
    }

    pub fn was_write(&self) -> bool {
        self.error_code.contains(PageFaultBits::CAUSED_BY_WRITE)
    }

    pub fn from_user_mode(&self) -> bool {
        self.error_code.contains(PageFaultBits::USER_MODE)
    }

    pub fn reserved_bit_set(&self) -> bool {
        self.error_code.contains(PageFaultBits::MALFORMED_TABLE)
    }

    pub fn was_instruction_fetch(&self) -> bool {
        self.error_code.contains(PageFaultBits::INSTRUCTION_FETCH)
    }
}

/// Exit code recorded for a task killed by an unhandled fault
/// (128 + SIGSEGV by POSIX convention).
pub const FAULT_EXIT_CODE: i32 = 139;

/// Decode, log, and halt the offending context.
pub fn handle(info: &PageFaultInfo) {
    crate::critical!(
        "page fault at {:#x}: present={} write={} user={} reserved={} fetch={} rip={:#x} rsp={:#x}",
        info.faulting_address,
        info.page_was_present() as u8,
        info.was_write() as u8,
        info.from_user_mode() as u8,
        info.reserved_bit_set() as u8,
        info.was_instruction_fetch() as u8,
        info.instruction_pointer,
        info.stack_pointer
    );

    if info.from_user_mode() {
        // Kill the faulting task and hand the CPU to the next one; the
        // rest of the system keeps running.
        crate::sched::terminate_current(FAULT_EXIT_CODE);
    }

    // Kernel-mode fault, or no scheduler to hand off to.
    crate::arch::halt();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn user_read_of_unmapped_address_decodes() {
        // A ring-3 read of an unmapped address: user bit set, present
        // bit clear.
        let info = PageFaultInfo {
            faulting_address: 0xdeadbeef,
            error_code: PageFaultBits::USER_MODE,
            instruction_pointer: 0x40_0000,
            stack_pointer: 0x7FFF_F000,
        };
        assert_eq!(info.faulting_address, 0xdeadbeef);
        assert!(!info.page_was_present());
        assert!(info.from_user_mode());
        assert!(!info.was_write());
        assert!(!info.was_instruction_fetch());
    }

    #[test]
    fn write_protection_fault_decodes() {
        let info = PageFaultInfo {
            faulting_address: 0x40_1000,
            error_code: PageFaultBits::PROTECTION_VIOLATION
                | PageFaultBits::CAUSED_BY_WRITE
                | PageFaultBits::USER_MODE,
            instruction_pointer: 0x40_0010,
            stack_pointer: 0x7FFF_F000,
        };
        assert!(info.page_was_present());
        assert!(info.was_write());
        assert!(info.from_user_mode());
        assert!(!info.reserved_bit_set());
    }
}
