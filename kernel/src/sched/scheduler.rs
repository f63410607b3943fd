//! Core scheduler: task table, creation, dispatch, preemption
//!
//! A fixed table of 256 control blocks with slot 0 permanently the idle
//! task (the boot-time kernel context). Selection is round-robin FIFO
//! over the ready queue; the idle task runs only when the queue is
//! empty. All mutation happens with the task lock held and interrupts
//! disabled; the lock is released on the resumed side of every context
//! switch — for a task's first dispatch that happens in the entry
//! trampoline, just before the iretq into ring 3.

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use spin::Mutex;

use super::{
    queue::{BlockedQueue, ReadyQueue},
    task::{Priority, Task, TaskId, TaskState, TaskStats},
};
use crate::{
    arch::x86_64::context::{context_switch, CpuContext},
    error::{KernelError, KernelResult},
    mm::{
        address_space::{AddressSpace, FrameSource, GlobalFrameSource},
        phys_to_virt, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE,
    },
};

/// Capacity of the task table.
pub const TASK_TABLE_SIZE: usize = 256;

/// Slot permanently owned by the idle task.
const IDLE_SLOT: usize = 0;

/// Default time quantum in ticks.
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;

/// Tick rate the scheduler configures the timer for.
pub const SCHED_HZ: u32 = 1000;

/// Top of every task's user stack, just below the 2 GiB mark.
pub const USER_STACK_TOP: u64 = 0x8000_0000;

/// User stack size in pages (64 KiB).
pub const USER_STACK_PAGES: usize = 16;

/// Load base applied to position-independent images.
const USER_IMAGE_BASE: u64 = 0x5500_0000;

/// Per-task kernel stack, as one physically contiguous run.
const KERNEL_STACK_PAGES: usize = 4;

/// Scheduler state: the task table, both queues, and dispatch counters.
pub struct Scheduler {
    slots: [Option<Task>; TASK_TABLE_SIZE],
    ready: ReadyQueue,
    blocked: BlockedQueue,
    /// Slot of the running task.
    current: usize,
    /// Next public id to hand out; wraps past u32::MAX skipping 0.
    next_id: TaskId,
    /// Quantum assigned to new tasks.
    quantum: u32,
    /// PML4 of the kernel address space; new spaces copy its upper half.
    kernel_pml4: PhysicalAddress,
    /// Dispatches recorded since boot.
    switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; TASK_TABLE_SIZE],
            ready: ReadyQueue::new(),
            blocked: BlockedQueue::new(),
            current: IDLE_SLOT,
            next_id: 1,
            quantum: DEFAULT_QUANTUM_TICKS,
            kernel_pml4: PhysicalAddress::new(0),
            switches: 0,
        }
    }

    /// Install the idle task in slot 0, wrapping the boot-time kernel
    /// context, and record the kernel address space new tasks will share.
    pub fn init_table(&mut self, kernel_pml4: PhysicalAddress, quantum: u32) {
        self.kernel_pml4 = kernel_pml4;
        self.quantum = quantum;

        let id = self.alloc_id();
        let mut idle = Task::new(id, "idle", Priority::Idle, u32::MAX);
        idle.state = TaskState::Running;
        idle.cr3 = kernel_pml4;
        idle.context.cr3 = kernel_pml4.as_u64();
        self.slots[IDLE_SLOT] = Some(idle);
        self.current = IDLE_SLOT;
    }

    /// Next task id: monotonically increasing, skipping 0 on wrap and
    /// any id still owned by a live slot. Terminates because the table
    /// holds at most 256 of the 2^32 - 1 candidates.
    fn alloc_id(&mut self) -> TaskId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if self.slot_by_id(id).is_none() {
                return id;
            }
        }
    }

    /// A slot for a new task: never slot 0, preferring empty slots over
    /// terminated-but-unreaped ones.
    fn find_free_slot(&self) -> Option<usize> {
        (1..TASK_TABLE_SIZE)
            .find(|&slot| self.slots[slot].is_none())
            .or_else(|| {
                (1..TASK_TABLE_SIZE).find(|&slot| {
                    matches!(
                        self.slots[slot].as_ref(),
                        Some(task) if task.state == TaskState::Terminated
                    )
                })
            })
    }

    fn slot_by_id(&self, id: TaskId) -> Option<usize> {
        (0..TASK_TABLE_SIZE).find(|&slot| {
            matches!(self.slots[slot].as_ref(), Some(task) if task.id == id)
        })
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.slots[self.current].as_ref()
    }

    pub fn task_by_id(&self, id: TaskId) -> Option<&Task> {
        self.slot_by_id(id).and_then(|slot| self.slots[slot].as_ref())
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Create a task from an ELF buffer: new address space, user stack
    /// with guard page, loaded image, argv/envp/auxv block, kernel
    /// stack, and an initial context entering the dispatch trampoline.
    /// The task is left in `New`; `start` queues it.
    #[cfg(feature = "alloc")]
    pub fn create(
        &mut self,
        elf: &[u8],
        name: &str,
        priority: Priority,
        argv: &[&str],
        envp: &[&str],
        source: &mut impl FrameSource,
    ) -> KernelResult<TaskId> {
        let slot = self
            .find_free_slot()
            .ok_or(KernelError::ResourceExhausted {
                resource: "task slot",
            })?;

        let kernel_space = AddressSpace::from_pml4(self.kernel_pml4);
        let mut space = kernel_space.create_from(source)?;

        let (stack_base, initial_rsp) = match build_user_stack(&mut space, argv, envp, source) {
            Ok(stack) => stack,
            Err(err) => {
                space.destroy(source);
                return Err(err);
            }
        };

        let loaded = match crate::elf::load(elf, &mut space, USER_IMAGE_BASE, source) {
            Ok(loaded) => loaded,
            Err(err) => {
                space.release_user_pages(source);
                space.destroy(source);
                return Err(err);
            }
        };

        let Some(kernel_stack) = source.allocate_contiguous(KERNEL_STACK_PAGES) else {
            space.release_user_pages(source);
            space.destroy(source);
            return Err(KernelError::OutOfMemory {
                requested: KERNEL_STACK_PAGES * PAGE_SIZE,
                available: 0,
            });
        };

        let id = self.alloc_id();
        let mut task = Task::new(id, name, priority, self.quantum);
        task.cr3 = space.pml4_phys();
        task.user_entry = loaded.entry;
        task.user_stack_top = initial_rsp;
        task.user_stack_base = stack_base;
        task.user_stack_pages = USER_STACK_PAGES;
        task.kernel_stack = kernel_stack;
        task.kernel_stack_pages = KERNEL_STACK_PAGES;

        // First dispatch enters the trampoline in ring 0 on the task's
        // kernel stack, with interrupts still off; the trampoline drops
        // the task lock and performs the iretq into ring 3.
        let kernel_stack_top =
            phys_to_virt(kernel_stack.offset((KERNEL_STACK_PAGES * PAGE_SIZE) as u64));
        task.context = CpuContext::new_kernel(
            trampoline_address(),
            kernel_stack_top.as_u64(),
            task.cr3.as_u64(),
        );
        task.context.rflags = 0x2;

        log::info!(
            "task {} ({}) created: entry {:#x} image_top {:#x}",
            id,
            task.name.as_str(),
            loaded.entry.as_u64(),
            loaded.image_top.as_u64()
        );
        self.slots[slot] = Some(task);
        Ok(id)
    }

    /// Queue a freshly created task: New -> Ready, appended in arrival
    /// order.
    pub fn start(&mut self, id: TaskId) -> KernelResult<()> {
        let slot = self
            .slot_by_id(id)
            .ok_or(KernelError::TaskNotFound { id })?;
        let Some(task) = self.slots[slot].as_mut() else {
            return Err(KernelError::TaskNotFound { id });
        };
        if task.state != TaskState::New {
            return Err(KernelError::InvalidTaskState {
                expected: "new",
                actual: task.state.as_str(),
            });
        }
        task.state = TaskState::Ready;
        self.ready.push_back(&mut self.slots, slot);
        Ok(())
    }

    /// Timer-tick bookkeeping: charge the current task and decide
    /// whether a switch is due. Returns the (prev, next) slots when a
    /// context switch must be performed; same-task re-dispatch (sole
    /// runnable) is handled internally.
    pub fn on_tick(&mut self) -> Option<(usize, usize)> {
        let cur = self.current;
        let (is_idle, not_running, expired) = {
            let task = self.slots[cur].as_mut()?;
            task.cpu_time += 1;
            let is_idle = cur == IDLE_SLOT;
            let not_running = task.state != TaskState::Running;
            let expired = !is_idle
                && task.cpu_time.saturating_sub(task.last_schedule) >= task.quantum as u64;
            (is_idle, not_running, expired)
        };

        // Within one tick the handler either sees no expiry and returns
        // or performs exactly one switch. The idle task yields the
        // moment real work exists.
        let must_switch = if not_running {
            true
        } else if is_idle {
            !self.ready.is_empty()
        } else {
            expired
        };
        if !must_switch {
            return None;
        }

        if !not_running {
            if let Some(task) = self.slots[cur].as_mut() {
                task.state = TaskState::Ready;
            }
            if !is_idle {
                self.ready.push_back(&mut self.slots, cur);
            }
        }

        self.pick_and_dispatch(cur)
    }

    /// Voluntary yield: give up the CPU if anything else is runnable.
    pub fn yield_decision(&mut self) -> Option<(usize, usize)> {
        if self.ready.is_empty() {
            return None;
        }
        let cur = self.current;
        if let Some(task) = self.slots[cur].as_mut() {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
                if cur != IDLE_SLOT {
                    self.ready.push_back(&mut self.slots, cur);
                }
            }
        }
        self.pick_and_dispatch(cur)
    }

    /// Move the current task to the blocked queue and pick a successor.
    pub fn block_current(&mut self) -> Option<(usize, usize)> {
        let cur = self.current;
        if cur == IDLE_SLOT {
            log::warn!("the idle task cannot block");
            return None;
        }
        if let Some(task) = self.slots[cur].as_mut() {
            task.state = TaskState::Blocked;
        }
        self.blocked.push(&mut self.slots, cur);
        self.pick_and_dispatch(cur)
    }

    /// Blocked -> Ready on explicit wakeup.
    pub fn unblock(&mut self, id: TaskId) -> KernelResult<()> {
        let slot = self
            .slot_by_id(id)
            .ok_or(KernelError::TaskNotFound { id })?;
        if !self.blocked.remove(&mut self.slots, slot) {
            let actual = self.slots[slot]
                .as_ref()
                .map(|t| t.state.as_str())
                .unwrap_or("empty");
            return Err(KernelError::InvalidTaskState {
                expected: "blocked",
                actual,
            });
        }
        if let Some(task) = self.slots[slot].as_mut() {
            task.state = TaskState::Ready;
        }
        self.ready.push_back(&mut self.slots, slot);
        Ok(())
    }

    fn pick_and_dispatch(&mut self, cur: usize) -> Option<(usize, usize)> {
        let next = self
            .ready
            .pop_front(&mut self.slots)
            .unwrap_or(IDLE_SLOT);
        if next == cur {
            // Sole runnable task: a fresh quantum window, recorded as a
            // dispatch without a register switch.
            if let Some(task) = self.slots[cur].as_mut() {
                task.state = TaskState::Running;
                task.last_schedule = task.cpu_time;
                task.switches += 1;
            }
            self.switches += 1;
            return None;
        }
        self.dispatch(next);
        Some((cur, next))
    }

    /// Mark `next` running and point the world at it. The register-level
    /// switch is the caller's job.
    fn dispatch(&mut self, next: usize) {
        if let Some(task) = self.slots[next].as_mut() {
            task.state = TaskState::Running;
            task.last_schedule = task.cpu_time;
            task.switches += 1;
        }
        self.switches += 1;
        self.current = next;

        #[cfg(target_os = "none")]
        {
            // Ring-3 -> ring-0 transitions of the next task land on its
            // kernel stack.
            let top = self.kernel_stack_top(next);
            if top != 0 {
                crate::arch::x86_64::gdt::set_kernel_stack(top);
            }
        }
    }

    #[cfg(target_os = "none")]
    fn kernel_stack_top(&self, slot: usize) -> u64 {
        match self.slots[slot].as_ref() {
            Some(task) if task.kernel_stack.as_u64() != 0 => phys_to_virt(
                task.kernel_stack
                    .offset((task.kernel_stack_pages * PAGE_SIZE) as u64),
            )
            .as_u64(),
            _ => 0,
        }
    }

    /// Next runnable slot, for dispatch after the current task died.
    fn take_next(&mut self) -> usize {
        self.ready
            .pop_front(&mut self.slots)
            .unwrap_or(IDLE_SLOT)
    }

    /// Terminate a task: record the exit code, pull it off its queue,
    /// and release every owned resource exactly once. Returns whether
    /// the terminated task was the running one (the caller must then
    /// dispatch a successor without saving the dead context).
    pub fn terminate(
        &mut self,
        id: TaskId,
        exit_code: i32,
        source: &mut impl FrameSource,
    ) -> KernelResult<bool> {
        let slot = self
            .slot_by_id(id)
            .ok_or(KernelError::TaskNotFound { id })?;
        if slot == IDLE_SLOT {
            return Err(KernelError::InvalidArgument { name: "id" });
        }

        self.ready.remove(&mut self.slots, slot);
        self.blocked.remove(&mut self.slots, slot);
        let was_current = slot == self.current;

        let (cr3, kernel_stack, kernel_stack_pages, name) = {
            let Some(task) = self.slots[slot].as_mut() else {
                return Err(KernelError::TaskNotFound { id });
            };
            if task.state == TaskState::Terminated {
                return Err(KernelError::InvalidTaskState {
                    expected: "live",
                    actual: "terminated",
                });
            }
            task.state = TaskState::Terminated;
            task.exit_code = exit_code;
            let owned = (task.cr3, task.kernel_stack, task.kernel_stack_pages, task.name);
            task.cr3 = PhysicalAddress::new(0);
            task.kernel_stack = PhysicalAddress::new(0);
            task.kernel_stack_pages = 0;
            task.user_stack_base = VirtualAddress::new(0);
            task.user_stack_pages = 0;
            owned
        };

        // Terminating the running task: leave its hierarchy before
        // tearing it down. The kernel keeps executing because the upper
        // half is shared.
        #[cfg(target_os = "none")]
        if was_current {
            AddressSpace::from_pml4(self.kernel_pml4).switch();
        }

        if cr3.as_u64() != 0 {
            let mut space = AddressSpace::from_pml4(cr3);
            space.release_user_pages(source);
            space.destroy(source);
        }
        if kernel_stack.as_u64() != 0 {
            for page in 0..kernel_stack_pages {
                source.free_frame(kernel_stack.offset((page * PAGE_SIZE) as u64));
            }
        }

        log::info!(
            "task {} ({}) terminated with code {}",
            id,
            name.as_str(),
            exit_code
        );
        Ok(was_current)
    }

    /// Waitpid-style query: collect a terminated task's exit code and
    /// release its slot for reuse.
    pub fn reap(&mut self, id: TaskId) -> Option<i32> {
        let slot = self.slot_by_id(id)?;
        match self.slots[slot].as_ref() {
            Some(task) if task.state == TaskState::Terminated => {
                let exit_code = task.exit_code;
                self.slots[slot] = None;
                Some(exit_code)
            }
            _ => None,
        }
    }

    /// Accounting snapshot of every live slot.
    #[cfg(feature = "alloc")]
    pub fn snapshot(&self) -> Vec<TaskStats> {
        self.slots
            .iter()
            .flatten()
            .map(|task| task.stats())
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Map the user stack (leaving the guard page below it unmapped) and
/// build the Linux-style argc/argv/envp/auxv block at its top. Returns
/// the stack base and the initial, 16-byte-aligned RSP.
#[cfg(feature = "alloc")]
fn build_user_stack(
    space: &mut AddressSpace,
    argv: &[&str],
    envp: &[&str],
    source: &mut impl FrameSource,
) -> KernelResult<(VirtualAddress, VirtualAddress)> {
    let base = VirtualAddress::new(USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u64);
    let stack_flags = PageFlags::USER | PageFlags::WRITABLE | PageFlags::NO_EXECUTE;

    // The page below `base` is deliberately never mapped: it is the
    // guard page, and any access to it faults.
    let mut mapped = 0usize;
    for page in 0..USER_STACK_PAGES {
        let virt = base.offset((page * PAGE_SIZE) as u64);
        let Some(frame) = source.allocate_frame() else {
            unwind_stack(space, base, mapped, source);
            return Err(KernelError::OutOfMemory {
                requested: USER_STACK_PAGES * PAGE_SIZE,
                available: mapped * PAGE_SIZE,
            });
        };
        // SAFETY: freshly allocated frame, reachable only through the
        // direct map until mapped below.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(frame).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        if let Err(err) = space.map_page(virt, frame, stack_flags, source) {
            source.free_frame(frame);
            unwind_stack(space, base, mapped, source);
            return Err(err);
        }
        mapped += 1;
    }

    // Copy the strings to the top of the stack, recording their user
    // addresses.
    let mut sp = USER_STACK_TOP;
    let mut argv_ptrs: Vec<u64> = Vec::with_capacity(argv.len());
    for arg in argv {
        sp -= arg.len() as u64 + 1;
        write_user(space, sp, arg.as_bytes())?;
        argv_ptrs.push(sp);
    }
    let mut envp_ptrs: Vec<u64> = Vec::with_capacity(envp.len());
    for env in envp {
        sp -= env.len() as u64 + 1;
        write_user(space, sp, env.as_bytes())?;
        envp_ptrs.push(sp);
    }

    // argc, argv[0..n], NULL, envp[0..m], NULL, AT_NULL auxv pair.
    let words = 1 + argv.len() + 1 + envp.len() + 1 + 2;
    sp -= (words * 8) as u64;
    sp &= !0xF;

    let mut cursor = sp;
    write_user_u64(space, &mut cursor, argv.len() as u64)?;
    for ptr in &argv_ptrs {
        write_user_u64(space, &mut cursor, *ptr)?;
    }
    write_user_u64(space, &mut cursor, 0)?;
    for ptr in &envp_ptrs {
        write_user_u64(space, &mut cursor, *ptr)?;
    }
    write_user_u64(space, &mut cursor, 0)?;
    write_user_u64(space, &mut cursor, 0)?; // AT_NULL
    write_user_u64(space, &mut cursor, 0)?;

    Ok((base, VirtualAddress::new(sp)))
}

#[cfg(feature = "alloc")]
fn unwind_stack(
    space: &mut AddressSpace,
    base: VirtualAddress,
    pages: usize,
    source: &mut impl FrameSource,
) {
    for page in 0..pages {
        if let Ok(frame) = space.unmap_page(base.offset((page * PAGE_SIZE) as u64)) {
            source.free_frame(frame);
        }
    }
}

/// Copy bytes into a user mapping through the direct map; the target
/// address space need not be active. NUL termination for strings is
/// implicit: the stack pages start zeroed and strings are written
/// top-down without overlap.
fn write_user(space: &AddressSpace, va: u64, bytes: &[u8]) -> KernelResult<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        let addr = va + offset as u64;
        let in_page = PAGE_SIZE - (addr as usize % PAGE_SIZE);
        let chunk = in_page.min(bytes.len() - offset);
        let phys = space
            .translate(VirtualAddress::new(addr))
            .ok_or(KernelError::UnmappedMemory { addr })?;
        // SAFETY: translate() returned the backing frame; chunk stays
        // within it by construction.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(offset),
                phys_to_virt(phys).as_mut_ptr::<u8>(),
                chunk,
            );
        }
        offset += chunk;
    }
    Ok(())
}

fn write_user_u64(space: &AddressSpace, cursor: &mut u64, value: u64) -> KernelResult<()> {
    write_user(space, *cursor, &value.to_le_bytes())?;
    *cursor += 8;
    Ok(())
}

fn trampoline_address() -> u64 {
    #[cfg(target_os = "none")]
    {
        task_entry_trampoline as usize as u64
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Global scheduler instance. This mutex is the task lock: every
/// mutation of the table or queues happens with it held and interrupts
/// disabled.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// First instructions of every task, entered in ring 0 by the
/// dispatcher. Releases the task lock the dispatcher transferred here
/// with, then drops to ring 3 through an iretq frame.
#[cfg(target_os = "none")]
extern "C" fn task_entry_trampoline() -> ! {
    // SAFETY: the dispatching side transferred control with the task
    // lock held; this is the resumed side responsible for releasing it.
    unsafe {
        SCHEDULER.force_unlock();
    }

    let user_context = {
        let sched = SCHEDULER.lock();
        let Some(task) = sched.current_task() else {
            crate::critical!("task trampoline with no current task");
            crate::arch::halt();
        };
        CpuContext::new_user(
            task.user_entry.as_u64(),
            task.user_stack_top.as_u64(),
            task.cr3.as_u64(),
        )
    };
    // SAFETY: the context was built from the current task's validated
    // entry point and stack; its CR3 is already loaded.
    unsafe { crate::arch::x86_64::context::restore_context(&user_context) }
}

/// Perform the register-level switch decided by the scheduler, with the
/// task lock held. The resumed side releases it.
fn switch_tasks(mut guard: spin::MutexGuard<'_, Scheduler>, prev: usize, next: usize) {
    let prev_ctx: *mut CpuContext = match guard.slots[prev].as_mut() {
        Some(task) => &mut task.context,
        None => return,
    };
    let next_ctx: *const CpuContext = match guard.slots[next].as_ref() {
        Some(task) => &task.context,
        None => return,
    };

    // Keep the lock held across the switch; whoever resumes on the other
    // side (this function's continuation, or the entry trampoline for a
    // first dispatch) releases it.
    core::mem::forget(guard);
    // SAFETY: both contexts live in the static task table and the task
    // lock is held; interrupts are disabled on every path into here.
    unsafe {
        context_switch(prev_ctx, next_ctx);
    }
    // SAFETY: resumed side of the switch above; the lock is still held
    // for us by the side that switched away.
    unsafe {
        SCHEDULER.force_unlock();
    }
}

/// Tick callback installed into the timer. Runs in interrupt context
/// with interrupts disabled; EOI has already been sent.
fn scheduler_tick(_now: u64) {
    let mut sched = SCHEDULER.lock();
    if let Some((prev, next)) = sched.on_tick() {
        switch_tasks(sched, prev, next);
    }
}

/// Initialize the scheduler: idle task, tick source, preemption.
#[cfg(target_os = "none")]
pub fn init(quantum: u32, hz: u32) {
    {
        let mut sched = SCHEDULER.lock();
        sched.init_table(AddressSpace::current().pml4_phys(), quantum);
    }
    crate::arch::x86_64::timer::init(hz);
    crate::arch::x86_64::timer::register_tick_callback(scheduler_tick);
    log::info!("scheduler: quantum {} ticks at {} Hz", quantum, hz);
}

/// Create a task from an ELF buffer and queue it.
#[cfg(feature = "alloc")]
pub fn create_task(
    elf: &[u8],
    name: &str,
    priority: Priority,
    argv: &[&str],
    envp: &[&str],
) -> KernelResult<TaskId> {
    crate::arch::interrupts::without_interrupts(|| {
        let mut source = GlobalFrameSource;
        let mut sched = SCHEDULER.lock();
        let id = sched.create(elf, name, priority, argv, envp, &mut source)?;
        sched.start(id)?;
        Ok(id)
    })
}

/// Terminate a task by id. When the victim is the running task, control
/// transfers to the next runnable task and this call does not return to
/// the caller's context.
pub fn terminate_task(id: TaskId, exit_code: i32) -> KernelResult<()> {
    crate::arch::interrupts::without_interrupts(|| {
        let mut source = GlobalFrameSource;
        let mut sched = SCHEDULER.lock();
        let was_current = sched.terminate(id, exit_code, &mut source)?;
        if !was_current {
            return Ok(());
        }

        let next = sched.take_next();
        sched.dispatch(next);
        let next_ctx: *const CpuContext = match sched.slots[next].as_ref() {
            Some(task) => &task.context,
            None => return Ok(()),
        };
        core::mem::forget(sched);
        #[cfg(target_os = "none")]
        // SAFETY: the dead task's context is never saved; the successor
        // context is valid and the task lock transfers to the resumed
        // side (continuation or trampoline), which releases it.
        unsafe {
            crate::arch::x86_64::context::restore_context(next_ctx);
        }
        #[cfg(not(target_os = "none"))]
        // SAFETY: host builds do not switch; release the forgotten
        // guard so the lock state stays balanced.
        unsafe {
            let _ = next_ctx;
            SCHEDULER.force_unlock();
        }
        Ok(())
    })
}

/// Terminate the running task (fault path and sys_exit collaborator).
pub fn terminate_current(exit_code: i32) {
    let id = current_task_id();
    if id != 0 {
        if let Err(err) = terminate_task(id, exit_code) {
            log::error!("terminate_current: {}", err);
        }
    }
}

/// Give up the CPU voluntarily.
pub fn yield_now() {
    crate::arch::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if let Some((prev, next)) = sched.yield_decision() {
            switch_tasks(sched, prev, next);
        }
    });
}

/// Block the running task until `unblock(id)`.
pub fn block_current() {
    crate::arch::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if let Some((prev, next)) = sched.block_current() {
            switch_tasks(sched, prev, next);
        }
    });
}

/// Wake a blocked task.
pub fn unblock(id: TaskId) -> KernelResult<()> {
    crate::arch::interrupts::without_interrupts(|| SCHEDULER.lock().unblock(id))
}

/// Id of the running task (0 when the scheduler is not initialized).
pub fn current_task_id() -> TaskId {
    crate::arch::interrupts::without_interrupts(|| {
        SCHEDULER.lock().current_task().map(|t| t.id).unwrap_or(0)
    })
}

/// Accounting snapshot for one task.
pub fn task_stats(id: TaskId) -> Option<TaskStats> {
    crate::arch::interrupts::without_interrupts(|| {
        SCHEDULER.lock().task_by_id(id).map(|t| t.stats())
    })
}

/// Accounting snapshot of every live task.
#[cfg(feature = "alloc")]
pub fn tasks_snapshot() -> Vec<TaskStats> {
    crate::arch::interrupts::without_interrupts(|| SCHEDULER.lock().snapshot())
}

/// Collect a terminated task's exit code, releasing its slot.
pub fn reap(id: TaskId) -> Option<i32> {
    crate::arch::interrupts::without_interrupts(|| SCHEDULER.lock().reap(id))
}

/// The idle loop: slot 0's body once boot completes. Verifies
/// descriptor-table integrity on each wakeup.
pub fn run() -> ! {
    loop {
        crate::arch::x86_64::gdt::verify_integrity();
        crate::arch::idle();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::elf::test_image::{build, SegmentSpec};
    use crate::elf::{ET_EXEC, PF_R, PF_X};
    use crate::mm::page_table::PageTable;
    use std::{boxed::Box, vec, vec::Vec as StdVec};

    /// Heap-backed frames; the host identity "HHDM" makes them readable
    /// and writable at their physical address.
    struct HeapFrames {
        allocated: usize,
        freed: usize,
    }

    impl HeapFrames {
        fn new() -> Self {
            Self {
                allocated: 0,
                freed: 0,
            }
        }

        fn outstanding(&self) -> usize {
            self.allocated - self.freed
        }
    }

    impl FrameSource for HeapFrames {
        fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
            self.allocated += 1;
            let frame: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
            Some(PhysicalAddress::new(frame as *mut PageTable as u64))
        }

        fn free_frame(&mut self, _frame: PhysicalAddress) {
            self.freed += 1;
        }

        fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
            self.allocated += count;
            let run: StdVec<PageTable> = (0..count).map(|_| PageTable::new()).collect();
            let leaked = Box::leak(run.into_boxed_slice());
            Some(PhysicalAddress::new(leaked.as_ptr() as u64))
        }
    }

    /// A source that fails after a fixed number of single-frame
    /// allocations, for unwind testing.
    struct FailingFrames {
        inner: HeapFrames,
        budget: usize,
    }

    impl FrameSource for FailingFrames {
        fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
            if self.budget == 0 {
                return None;
            }
            self.budget -= 1;
            self.inner.allocate_frame()
        }

        fn free_frame(&mut self, frame: PhysicalAddress) {
            self.inner.free_frame(frame);
        }

        fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
            self.inner.allocate_contiguous(count)
        }
    }

    fn test_elf() -> StdVec<u8> {
        build(
            ET_EXEC,
            0x40_0000,
            &[SegmentSpec {
                vaddr: 0x40_0000,
                data: vec![0x90; 64],
                memsz: 64,
                flags: PF_R | PF_X,
            }],
        )
    }

    fn fresh(quantum: u32) -> (Box<Scheduler>, HeapFrames) {
        let mut source = HeapFrames::new();
        let kernel_space = AddressSpace::new_bare(&mut source).expect("kernel space");
        let mut sched = Box::new(Scheduler::new());
        sched.init_table(kernel_space.pml4_phys(), quantum);
        (sched, source)
    }

    fn spawn(sched: &mut Scheduler, source: &mut HeapFrames, name: &str) -> TaskId {
        let elf = test_elf();
        let id = sched
            .create(&elf, name, Priority::Normal, &[name], &[], source)
            .expect("task creation should succeed");
        sched.start(id).expect("start");
        id
    }

    fn read_user_u64(space: &AddressSpace, va: u64) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let phys = space
                .translate(VirtualAddress::new(va + i as u64))
                .expect("stack address should be mapped");
            *byte = unsafe { *(phys.as_u64() as *const u8) };
        }
        u64::from_le_bytes(bytes)
    }

    fn read_user_str(space: &AddressSpace, va: u64) -> std::string::String {
        let mut out = std::string::String::new();
        let mut addr = va;
        loop {
            let phys = space
                .translate(VirtualAddress::new(addr))
                .expect("string address should be mapped");
            let byte = unsafe { *(phys.as_u64() as *const u8) };
            if byte == 0 {
                break;
            }
            out.push(byte as char);
            addr += 1;
        }
        out
    }

    #[test]
    fn boot_leaves_idle_running() {
        let (sched, _source) = fresh(10);
        let idle = sched.current_task().expect("idle task");
        assert_eq!(idle.state, TaskState::Running);
        assert_eq!(idle.priority, Priority::Idle);
        assert!(sched.ready.is_empty());
        // Running implies current: the only Running task is slot 0.
        let running: StdVec<_> = sched
            .slots
            .iter()
            .flatten()
            .filter(|t| t.state == TaskState::Running)
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, idle.id);
    }

    #[test]
    fn create_then_start_queues_the_task() {
        let (mut sched, mut source) = fresh(10);
        let elf = test_elf();
        let id = sched
            .create(&elf, "init", Priority::Normal, &["init"], &[], &mut source)
            .expect("create");
        assert!(id >= 2);
        assert_eq!(
            sched.task_by_id(id).map(|t| t.state),
            Some(TaskState::New)
        );
        assert!(sched.ready.is_empty());

        sched.start(id).expect("start");
        assert_eq!(
            sched.task_by_id(id).map(|t| t.state),
            Some(TaskState::Ready)
        );
        assert_eq!(sched.ready.len(), 1);

        // start is New-only.
        assert!(sched.start(id).is_err());
    }

    #[test]
    fn first_tick_preempts_idle() {
        let (mut sched, mut source) = fresh(10);
        let id = spawn(&mut sched, &mut source, "worker");

        let switch = sched.on_tick().expect("idle must yield to real work");
        assert_eq!(switch.0, IDLE_SLOT);
        let task = sched.current_task().expect("current");
        assert_eq!(task.id, id);
        assert_eq!(task.state, TaskState::Running);
        assert!(sched.ready.is_empty());
        assert_eq!(
            sched.slots[IDLE_SLOT].as_ref().map(|t| t.state),
            Some(TaskState::Ready)
        );
    }

    #[test]
    fn round_robin_splits_ticks_evenly() {
        let (mut sched, mut source) = fresh(1);
        let a = spawn(&mut sched, &mut source, "a");
        let b = spawn(&mut sched, &mut source, "b");

        for _ in 0..21 {
            let _ = sched.on_tick();
        }

        let a_time = sched.task_by_id(a).expect("a").cpu_time;
        let b_time = sched.task_by_id(b).expect("b").cpu_time;
        // One tick went to idle before the first dispatch; the rest
        // alternate under the one-tick quantum.
        assert_eq!(a_time + b_time, 20);
        assert!(a_time.abs_diff(b_time) <= 1);
    }

    #[test]
    fn quantum_expiry_requeues_the_sole_task() {
        let (mut sched, mut source) = fresh(3);
        let id = spawn(&mut sched, &mut source, "sole");

        for _ in 0..11 {
            let _ = sched.on_tick();
        }

        let task = sched.task_by_id(id).expect("task");
        assert_eq!(task.cpu_time, 10);
        assert_eq!(task.state, TaskState::Running);
        assert!(task.switches >= 2);
        assert_eq!(sched.current_task().map(|t| t.id), Some(id));
    }

    #[test]
    fn initial_stack_carries_argc_argv_envp() {
        let (mut sched, mut source) = fresh(10);
        let elf = test_elf();
        let id = sched
            .create(
                &elf,
                "init",
                Priority::Normal,
                &["init", "-v"],
                &["TERM=vt100"],
                &mut source,
            )
            .expect("create");

        let task = sched.task_by_id(id).expect("task");
        let space = AddressSpace::from_pml4(task.cr3);
        let rsp = task.user_stack_top.as_u64();
        assert_eq!(rsp % 16, 0);

        // argc
        assert_eq!(read_user_u64(&space, rsp), 2);
        // argv[0], argv[1], NULL
        let argv0 = read_user_u64(&space, rsp + 8);
        let argv1 = read_user_u64(&space, rsp + 16);
        assert_eq!(read_user_u64(&space, rsp + 24), 0);
        assert_eq!(read_user_str(&space, argv0), "init");
        assert_eq!(read_user_str(&space, argv1), "-v");
        // envp[0], NULL
        let envp0 = read_user_u64(&space, rsp + 32);
        assert_eq!(read_user_u64(&space, rsp + 40), 0);
        assert_eq!(read_user_str(&space, envp0), "TERM=vt100");
        // auxv terminator
        assert_eq!(read_user_u64(&space, rsp + 48), 0);
        assert_eq!(read_user_u64(&space, rsp + 56), 0);

        // Guard page below the stack is not mapped.
        let guard = task.user_stack_base.as_u64() - PAGE_SIZE as u64;
        assert!(!space.is_mapped(VirtualAddress::new(guard)));
        assert!(space.is_mapped(task.user_stack_base));
    }

    #[test]
    fn terminate_returns_every_frame() {
        let (mut sched, mut source) = fresh(10);
        let baseline = source.outstanding();

        let id = spawn(&mut sched, &mut source, "doomed");
        let after_create = source.outstanding();
        // At least: image page + one page table + user stack pages.
        assert!(after_create - baseline >= 3);

        let was_current = sched
            .terminate(id, 0, &mut source)
            .expect("terminate should succeed");
        assert!(!was_current);
        assert_eq!(source.outstanding(), baseline);

        // The slot survives until reaped, then becomes reusable.
        assert_eq!(
            sched.task_by_id(id).map(|t| t.state),
            Some(TaskState::Terminated)
        );
        assert_eq!(sched.reap(id), Some(0));
        assert!(sched.task_by_id(id).is_none());
    }

    #[test]
    fn terminating_the_running_task_reports_it() {
        let (mut sched, mut source) = fresh(10);
        let id = spawn(&mut sched, &mut source, "self-exit");
        let _ = sched.on_tick();
        assert_eq!(sched.current_task().map(|t| t.id), Some(id));

        let was_current = sched
            .terminate(id, 7, &mut source)
            .expect("terminate current");
        assert!(was_current);
        let next = sched.take_next();
        sched.dispatch(next);
        assert_eq!(next, IDLE_SLOT);
        assert_eq!(sched.reap(id), Some(7));
    }

    #[test]
    fn double_terminate_is_rejected() {
        let (mut sched, mut source) = fresh(10);
        let id = spawn(&mut sched, &mut source, "once");
        sched.terminate(id, 0, &mut source).expect("first");
        assert!(sched.terminate(id, 0, &mut source).is_err());
    }

    #[test]
    fn idle_task_cannot_be_terminated() {
        let (mut sched, mut source) = fresh(10);
        let idle_id = sched.current_task().expect("idle").id;
        assert!(sched.terminate(idle_id, 0, &mut source).is_err());
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let (mut sched, mut source) = fresh(10);
        let id = spawn(&mut sched, &mut source, "sleeper");
        let _ = sched.on_tick();
        assert_eq!(sched.current_task().map(|t| t.id), Some(id));

        let switch = sched.block_current().expect("must switch away");
        assert_eq!(switch.1, IDLE_SLOT);
        assert_eq!(
            sched.task_by_id(id).map(|t| t.state),
            Some(TaskState::Blocked)
        );
        assert_eq!(sched.blocked.len(), 1);

        sched.unblock(id).expect("unblock");
        assert_eq!(
            sched.task_by_id(id).map(|t| t.state),
            Some(TaskState::Ready)
        );
        // Unblocking twice is an error.
        assert!(sched.unblock(id).is_err());

        let _ = sched.on_tick();
        assert_eq!(sched.current_task().map(|t| t.id), Some(id));
    }

    #[test]
    fn ids_wrap_without_zero() {
        let (mut sched, mut source) = fresh(10);
        sched.next_id = u32::MAX;
        let high = spawn(&mut sched, &mut source, "high");
        assert_eq!(high, u32::MAX);
        // Wrap skips 0 and the idle task's live id 1.
        let wrapped = spawn(&mut sched, &mut source, "wrapped");
        assert_eq!(wrapped, 2);
    }

    #[test]
    fn failed_creation_unwinds_cleanly() {
        let mut source = FailingFrames {
            inner: HeapFrames::new(),
            budget: usize::MAX,
        };
        let kernel_space = AddressSpace::new_bare(&mut source).expect("kernel space");
        let mut sched = Box::new(Scheduler::new());
        sched.init_table(kernel_space.pml4_phys(), 10);
        let baseline = source.inner.outstanding();

        // Enough budget for the address space and part of the stack,
        // not for all of it.
        source.budget = 6;
        let elf = test_elf();
        let err = sched
            .create(&elf, "starved", Priority::Normal, &[], &[], &mut source)
            .expect_err("creation must fail under frame exhaustion");
        assert!(matches!(err, KernelError::OutOfMemory { .. }));
        assert_eq!(source.inner.outstanding(), baseline);
        assert!(sched.task_by_id(2).is_none());
    }

    #[test]
    fn snapshot_reports_live_tasks() {
        let (mut sched, mut source) = fresh(10);
        let a = spawn(&mut sched, &mut source, "a");
        let b = spawn(&mut sched, &mut source, "b");
        let snapshot = sched.snapshot();
        assert_eq!(snapshot.len(), 3); // idle + a + b
        assert!(snapshot.iter().any(|s| s.id == a));
        assert!(snapshot.iter().any(|s| s.id == b));
    }
}
