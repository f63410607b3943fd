//! Preemptive task scheduler
//!
//! Round-robin FIFO over a fixed 256-slot task table, driven by the
//! tick source. Priorities are recorded on every task and carried
//! through the queues; this version's selection policy does not consult
//! them yet.

pub mod queue;
pub mod scheduler;
pub mod task;

#[cfg(feature = "alloc")]
pub use scheduler::{create_task, tasks_snapshot};
#[cfg(target_os = "none")]
pub use scheduler::init;
pub use scheduler::{
    block_current, current_task_id, reap, run, task_stats, terminate_current, terminate_task,
    unblock, yield_now, DEFAULT_QUANTUM_TICKS, SCHED_HZ, TASK_TABLE_SIZE, USER_STACK_PAGES,
    USER_STACK_TOP,
};
pub use task::{Priority, TaskId, TaskState, TaskStats};
