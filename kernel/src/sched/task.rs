//! Task control block

use core::fmt;

use crate::{
    arch::x86_64::context::CpuContext,
    mm::{PhysicalAddress, VirtualAddress},
};

/// Public task identifier: 32-bit, monotonically increasing, never 0.
pub type TaskId = u32;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Control block reserved, not yet runnable.
    New,
    /// On the ready queue, waiting for the CPU.
    Ready,
    /// The unique current task.
    Running,
    /// Waiting for an external wakeup.
    Blocked,
    /// Finished; slot retained until reaped.
    Terminated,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Terminated => "terminated",
        }
    }
}

/// Scheduling priority. Recorded on every task and carried through the
/// queues; the round-robin policy of this version does not consult it
/// yet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Realtime = 4,
}

/// Which queue a task currently sits on. Guards the invariant that a
/// task is in at most one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    None,
    Ready,
    Blocked,
}

/// Maximum stored length of a task's display name.
pub const TASK_NAME_LEN: usize = 32;

/// Fixed-capacity display name, truncating on overflow.
#[derive(Clone, Copy)]
pub struct TaskName {
    buf: [u8; TASK_NAME_LEN],
    len: u8,
}

impl TaskName {
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; TASK_NAME_LEN];
        let len = name.len().min(TASK_NAME_LEN);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // Construction only copies whole bytes from a &str prefix; a
        // multi-byte character split by truncation is replaced below.
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("<invalid>")
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Snapshot of one task's accounting, for ps-style collaborators.
#[derive(Debug, Clone, Copy)]
pub struct TaskStats {
    pub id: TaskId,
    pub state: TaskState,
    pub priority: Priority,
    pub cpu_time: u64,
    pub switches: u64,
}

/// One task control block. Ownership of every task resource lives here;
/// the queues reference tasks only by table slot.
pub struct Task {
    pub id: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    /// Priority the task was created with.
    pub base_priority: Priority,
    /// Dynamic priority a future policy may adjust.
    pub priority: Priority,
    /// Time quantum in ticks.
    pub quantum: u32,
    /// Accumulated CPU ticks.
    pub cpu_time: u64,
    /// `cpu_time` value at the last dispatch; the quantum window is
    /// measured against it.
    pub last_schedule: u64,
    /// Times this task has been dispatched.
    pub switches: u64,

    /// Saved CPU context (the kernel-side continuation once running).
    pub context: CpuContext,
    /// Ring-3 entry point, consumed by the first dispatch.
    pub user_entry: VirtualAddress,
    /// Initial ring-3 stack pointer (below the argv/envp/auxv block).
    pub user_stack_top: VirtualAddress,

    /// Owned top-level page table; zero after release.
    pub cr3: PhysicalAddress,
    /// Owned user stack mapping.
    pub user_stack_base: VirtualAddress,
    pub user_stack_pages: usize,
    /// Owned kernel stack (physically contiguous run).
    pub kernel_stack: PhysicalAddress,
    pub kernel_stack_pages: usize,

    pub exit_code: i32,

    /// Intrusive queue links: table slots, not ids.
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub queue: QueueKind,
}

impl Task {
    /// Fresh control block in the `New` state with no owned resources.
    pub fn new(id: TaskId, name: &str, priority: Priority, quantum: u32) -> Self {
        Self {
            id,
            name: TaskName::new(name),
            state: TaskState::New,
            base_priority: priority,
            priority,
            quantum,
            cpu_time: 0,
            last_schedule: 0,
            switches: 0,
            context: CpuContext::zeroed(),
            user_entry: VirtualAddress::new(0),
            user_stack_top: VirtualAddress::new(0),
            cr3: PhysicalAddress::new(0),
            user_stack_base: VirtualAddress::new(0),
            user_stack_pages: 0,
            kernel_stack: PhysicalAddress::new(0),
            kernel_stack_pages: 0,
            exit_code: 0,
            prev: None,
            next: None,
            queue: QueueKind::None,
        }
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            id: self.id,
            state: self.state,
            priority: self.priority,
            cpu_time: self.cpu_time,
            switches: self.switches,
        }
    }
}
