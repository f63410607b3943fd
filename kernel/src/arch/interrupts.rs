//! Interrupt-enable state control
//!
//! Thin wrappers over the `x86_64` crate's interrupt instructions. The
//! bodies are gated to bare metal: `cli`/`sti` are privileged, and the
//! scheduler paths that toggle them also run under host unit tests.

/// Set the interrupt-enable flag.
#[inline]
pub fn enable() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

/// Clear the interrupt-enable flag.
#[inline]
pub fn disable() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}

/// Read the interrupt-enable flag.
#[inline]
pub fn are_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Run a closure with interrupts disabled, restoring the previous state
/// afterwards.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}
