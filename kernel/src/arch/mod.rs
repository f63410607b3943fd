// Architecture layer. This kernel targets x86_64 only; the module split
// keeps the architecture-specific surface (descriptor tables, context
// switch, tick source) behind one boundary.

pub mod x86_64;

pub mod interrupts;

/// Halt the CPU permanently with interrupts disabled.
///
/// Used by the panic handler and by fatal fault paths.
pub fn halt() -> ! {
    interrupts::disable();
    loop {
        idle();
    }
}

/// Wait for the next interrupt. On the host target this is a spin hint so
/// code paths that idle remain runnable under test.
#[inline]
pub fn idle() {
    #[cfg(target_os = "none")]
    x86_64::hlt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}
