//! x86_64 CPU context and context switching
//!
//! A [`CpuContext`] snapshots the register file, segment selectors, and
//! page-table base of a task. [`context_switch`] saves the current
//! execution state into one context and resumes another;
//! [`restore_context`] is the restore-only half used for a task's first
//! dispatch. Ring-3 contexts are entered through an `iretq` frame built
//! on the kernel stack; ring-0 continuations resume with a plain `ret`.

#[cfg(target_os = "none")]
use core::arch::naked_asm;

use super::gdt;

/// Saved CPU state for one task.
///
/// The layout is `repr(C)` and the switch assembly addresses fields by
/// byte offset; the `offset_of` assertions below pin the two in sync.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CpuContext {
    // General purpose registers
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    /// Stack pointer
    pub rsp: u64,
    /// Instruction pointer
    pub rip: u64,
    /// CPU flags
    pub rflags: u64,

    /// Segment selectors
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,

    /// Page table base
    pub cr3: u64,
}

const _: () = {
    assert!(core::mem::offset_of!(CpuContext, rsp) == 0x78);
    assert!(core::mem::offset_of!(CpuContext, rip) == 0x80);
    assert!(core::mem::offset_of!(CpuContext, rflags) == 0x88);
    assert!(core::mem::offset_of!(CpuContext, cs) == 0x90);
    assert!(core::mem::offset_of!(CpuContext, ss) == 0x92);
    assert!(core::mem::offset_of!(CpuContext, ds) == 0x94);
    assert!(core::mem::offset_of!(CpuContext, es) == 0x96);
    assert!(core::mem::offset_of!(CpuContext, cr3) == 0xA0);
};

/// RFLAGS with the interrupt-enable bit and the always-one reserved bit.
pub const RFLAGS_IF: u64 = 0x202;

impl CpuContext {
    /// Zeroed context with kernel selectors. Not runnable until `rip`,
    /// `rsp`, and `cr3` are filled in.
    pub fn zeroed() -> Self {
        let sel = gdt::selectors();
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rsp: 0,
            rip: 0,
            rflags: RFLAGS_IF,
            cs: sel.kernel_code.0,
            ss: sel.kernel_data.0,
            ds: sel.kernel_data.0,
            es: sel.kernel_data.0,
            fs: 0,
            gs: 0,
            cr3: 0,
        }
    }

    /// Initial ring-3 context: user selectors with RPL=3, interrupts
    /// enabled, entry point and stack supplied by the ELF loader and the
    /// task's address space.
    pub fn new_user(entry_point: u64, stack_top: u64, cr3: u64) -> Self {
        let sel = gdt::selectors();
        Self {
            rsp: stack_top,
            rip: entry_point,
            rflags: RFLAGS_IF,
            cs: sel.user_code.0,
            ss: sel.user_data.0,
            ds: sel.user_data.0,
            es: sel.user_data.0,
            cr3,
            ..Self::zeroed()
        }
    }

    /// Initial ring-0 context, used for the idle task's kernel thread.
    pub fn new_kernel(entry_point: u64, stack_top: u64, cr3: u64) -> Self {
        Self {
            rsp: stack_top,
            rip: entry_point,
            cr3,
            ..Self::zeroed()
        }
    }

    /// Whether restoring this context returns to ring 3.
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Save the current execution state into `prev` and resume `next`.
///
/// The saved resume point is the instruction after the `call` to this
/// function: when `prev` is later restored it returns to its caller as if
/// the call had completed normally. The restore half switches CR3 first,
/// then enters `next` via `iretq` (ring-3 context) or `ret` (saved kernel
/// continuation).
///
/// # Safety
///
/// Must be called with interrupts disabled. `prev` must be valid for
/// writes and `next` must contain a restorable context whose CR3 maps
/// both the kernel and (for ring-3 contexts) the target code and stack.
#[cfg(target_os = "none")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_prev: *mut CpuContext, _next: *const CpuContext) {
    naked_asm!(
        // rdi = prev, rsi = next
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rdi",
        "mov [rdi + 0x48], rsi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rbx",
        "mov [rdi + 0x60], rdx",
        "mov [rdi + 0x68], rcx",
        "mov [rdi + 0x70], rax",
        // Resume point: the return address of this call, with the stack
        // as it will be once the call has returned.
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x78], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "mov ax, cs",
        "mov [rdi + 0x90], ax",
        "mov ax, ss",
        "mov [rdi + 0x92], ax",
        "mov ax, ds",
        "mov [rdi + 0x94], ax",
        "mov ax, es",
        "mov [rdi + 0x96], ax",
        "mov rax, cr3",
        "mov [rdi + 0xA0], rax",
        // Fall through to the restore half.
        "mov rdi, rsi",
        "jmp {restore}",
        restore = sym restore_context,
    );
}

/// Restore-only half of the context switch, used for a task's first
/// dispatch (no previous context to save).
///
/// # Safety
///
/// Same requirements as [`context_switch`]; never returns.
#[cfg(target_os = "none")]
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(_context: *const CpuContext) -> ! {
    naked_asm!(
        // rdi = context. Switch the address space first so everything the
        // context points at is translated through the target hierarchy;
        // the CR3 load and the final iretq/ret form one uninterruptible
        // transition because IF stays clear throughout.
        "mov rax, [rdi + 0xA0]",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        "movzx eax, word ptr [rdi + 0x90]",
        "test al, 3",
        "jz 3f",

        // Ring-3 entry: build the iretq frame on the kernel stack.
        "movzx eax, word ptr [rdi + 0x92]",
        "push rax",
        "push qword ptr [rdi + 0x78]",
        "push qword ptr [rdi + 0x88]",
        "movzx eax, word ptr [rdi + 0x90]",
        "push rax",
        "push qword ptr [rdi + 0x80]",
        "mov ax, [rdi + 0x94]",
        "mov ds, ax",
        "mov ax, [rdi + 0x96]",
        "mov es, ax",
        "mov r15, [rdi + 0x00]",
        "mov r14, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r11, [rdi + 0x20]",
        "mov r10, [rdi + 0x28]",
        "mov r9,  [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov rsi, [rdi + 0x48]",
        "mov rbp, [rdi + 0x50]",
        "mov rbx, [rdi + 0x58]",
        "mov rdx, [rdi + 0x60]",
        "mov rcx, [rdi + 0x68]",
        "mov rax, [rdi + 0x70]",
        "mov rdi, [rdi + 0x40]",
        "iretq",

        // Ring-0 resume: switch stacks and return into the saved RIP.
        "3:",
        "mov ax, [rdi + 0x94]",
        "mov ds, ax",
        "mov ax, [rdi + 0x96]",
        "mov es, ax",
        "mov rsp, [rdi + 0x78]",
        "push qword ptr [rdi + 0x88]",
        "popfq",
        "push qword ptr [rdi + 0x80]",
        "mov r15, [rdi + 0x00]",
        "mov r14, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r11, [rdi + 0x20]",
        "mov r10, [rdi + 0x28]",
        "mov r9,  [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov rsi, [rdi + 0x48]",
        "mov rbp, [rdi + 0x50]",
        "mov rbx, [rdi + 0x58]",
        "mov rdx, [rdi + 0x60]",
        "mov rcx, [rdi + 0x68]",
        "mov rax, [rdi + 0x70]",
        "mov rdi, [rdi + 0x40]",
        "ret",
    );
}

// Host stubs so scheduler code paths link under unit tests; switching
// real CPU state is only possible on bare metal.
#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn context_switch(_prev: *mut CpuContext, _next: *const CpuContext) {}

#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn restore_context(_context: *const CpuContext) -> ! {
    unreachable!("restore_context is only meaningful on bare metal")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn user_context_uses_ring3_selectors() {
        let ctx = CpuContext::new_user(0x40_0000, 0x8000_0000, 0x1000);
        assert!(ctx.is_user());
        assert_eq!(ctx.cs & 3, 3);
        assert_eq!(ctx.ss & 3, 3);
        assert_eq!(ctx.rflags, RFLAGS_IF);
        assert_eq!(ctx.rip, 0x40_0000);
        assert_eq!(ctx.rsp, 0x8000_0000);
        assert_eq!(ctx.cr3, 0x1000);
    }

    #[test]
    fn kernel_context_uses_ring0_selectors() {
        let ctx = CpuContext::new_kernel(0xFFFF_8000_0000_1000, 0xFFFF_8000_0010_0000, 0x2000);
        assert!(!ctx.is_user());
        assert_eq!(ctx.cs & 3, 0);
    }
}
