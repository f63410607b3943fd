//! Kernel error types
//!
//! Structured error variants replace string literals throughout the
//! kernel. Every fallible operation returns [`KernelResult`] and
//! propagates with `?`; the variants carry enough context for the log
//! record at the failure site to be useful on its own.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical or virtual memory exhausted.
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    /// An address failed a validity or range check.
    InvalidAddress {
        addr: u64,
    },
    /// An address was expected to be page-aligned and was not.
    Misaligned {
        addr: u64,
    },
    /// A translation was requested for an unmapped virtual address.
    UnmappedMemory {
        addr: u64,
    },
    /// A mapping was requested where a present entry already exists.
    AlreadyMapped {
        addr: u64,
    },

    /// No task with the given identifier exists.
    TaskNotFound {
        id: u32,
    },
    /// A task was in the wrong lifecycle state for the operation.
    InvalidTaskState {
        expected: &'static str,
        actual: &'static str,
    },

    /// An ELF image failed validation or was truncated.
    InvalidElf {
        reason: &'static str,
    },

    /// A fixed-capacity resource pool ran dry.
    ResourceExhausted {
        resource: &'static str,
    },
    /// A caller-supplied argument was rejected.
    InvalidArgument {
        name: &'static str,
    },
    /// A subsystem was used before its `init()` ran.
    NotInitialized {
        subsystem: &'static str,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {:#x}", addr)
            }
            KernelError::Misaligned { addr } => {
                write!(f, "address {:#x} is not page-aligned", addr)
            }
            KernelError::UnmappedMemory { addr } => {
                write!(f, "address {:#x} is not mapped", addr)
            }
            KernelError::AlreadyMapped { addr } => {
                write!(f, "address {:#x} is already mapped", addr)
            }
            KernelError::TaskNotFound { id } => write!(f, "no task with id {}", id),
            KernelError::InvalidTaskState { expected, actual } => {
                write!(f, "task state is {}, expected {}", actual, expected)
            }
            KernelError::InvalidElf { reason } => write!(f, "invalid ELF image: {}", reason),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            KernelError::InvalidArgument { name } => {
                write!(f, "invalid argument: {}", name)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} used before initialization", subsystem)
            }
        }
    }
}

/// Convenience alias used across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = KernelError::OutOfMemory {
            requested: 8192,
            available: 4096,
        };
        let mut buf = std::string::String::new();
        use core::fmt::Write;
        write!(buf, "{}", err).expect("formatting a kernel error should not fail");
        assert!(buf.contains("8192"));
        assert!(buf.contains("4096"));
    }
}
