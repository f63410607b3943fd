//! CPU feature detection
//!
//! The only feature the core gates on is NX (execute-disable): page
//! mappings drop the NO_EXECUTE flag silently when the CPU does not
//! support it.

use core::sync::atomic::{AtomicU8, Ordering};

// 0 = not probed, 1 = unsupported, 2 = supported
static NX_STATE: AtomicU8 = AtomicU8::new(0);

/// Whether the CPU honors the NX bit (CPUID leaf 0x8000_0001, EDX bit
/// 20). Probed once and cached.
pub fn nx_supported() -> bool {
    match NX_STATE.load(Ordering::Acquire) {
        1 => false,
        2 => true,
        _ => {
            let nx = probe_nx();
            NX_STATE.store(if nx { 2 } else { 1 }, Ordering::Release);
            nx
        }
    }
}

fn probe_nx() -> bool {
    let edx: u32;
    // SAFETY: CPUID with leaf 0x8000_0001 is valid on every x86_64 CPU.
    // RBX is pushed/popped because CPUID clobbers it and LLVM reserves it.
    unsafe {
        core::arch::asm!(
            "push rbx",
            "mov eax, 0x80000001",
            "cpuid",
            "pop rbx",
            out("eax") _,
            out("ecx") _,
            out("edx") edx,
        );
    }
    edx & (1 << 20) != 0
}

/// Force the cached NX answer. Host tests use this to make flag-gating
/// behavior deterministic regardless of the machine they run on.
#[cfg(not(target_os = "none"))]
pub fn override_nx(supported: bool) {
    NX_STATE.store(if supported { 2 } else { 1 }, Ordering::Release);
}
