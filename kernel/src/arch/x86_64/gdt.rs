// Global Descriptor Table

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // RSP0: the stack the CPU switches to on ring-3 -> ring-0
        // transitions. Points at the boot stack until the scheduler
        // replaces it with the running task's kernel stack on every
        // context switch. Must be 16-byte aligned for the x86_64 ABI.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const BOOT_KERNEL_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };

        // Dedicated stack for double faults so a corrupt RSP0 cannot
        // escalate to a triple fault.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let user_code = gdt.append(Descriptor::user_code_segment());     // 0x18 (+ RPL 3 = 0x1B)
        let user_data = gdt.append(Descriptor::user_data_segment());     // 0x20 (+ RPL 3 = 0x23)
        let tss = gdt.append(Descriptor::tss_segment(&TSS));             // 0x28 (2 entries)
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0, long mode)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: User code segment (Ring 3, selector 0x1B with RPL)
/// - 0x20: User data segment (Ring 3, selector 0x23 with RPL)
/// - 0x28: TSS (occupies 2 entries, 0x28-0x30)
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

/// Byte image of the descriptor table captured right after `init()`,
/// used by the integrity check to detect and undo corruption.
struct GdtBackup {
    image: [u8; GDT_IMAGE_LEN],
    base: u64,
    limit: u16,
}

const GDT_IMAGE_LEN: usize = core::mem::size_of::<GlobalDescriptorTable>();

static BACKUP: Mutex<Option<GdtBackup>> = Mutex::new(None);

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: After loading the GDT, segment registers must be updated to
    // reference the new descriptors. The selectors come from GDT.1 which
    // was computed from the same GDT we just loaded, so they reference
    // valid descriptors.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }

    // Snapshot the loaded table so corruption can be detected and undone.
    let pointer = x86_64::instructions::tables::sgdt();
    let mut image = [0u8; GDT_IMAGE_LEN];
    // SAFETY: GDT.0 is a fully initialized static of exactly GDT_IMAGE_LEN
    // bytes; we copy it into a local array without aliasing concerns.
    unsafe {
        core::ptr::copy_nonoverlapping(
            &GDT.0 as *const GlobalDescriptorTable as *const u8,
            image.as_mut_ptr(),
            GDT_IMAGE_LEN,
        );
    }
    *BACKUP.lock() = Some(GdtBackup {
        image,
        base: pointer.base.as_u64(),
        limit: pointer.limit,
    });
}

/// Returns a reference to the GDT selectors (kernel and user mode).
///
/// The lazy_static ensures the GDT is initialized on first access; the
/// table is not loaded into GDTR until `init()` runs.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Check the descriptor table against the backup taken at `init()`.
///
/// Compares the GDTR pointer and the raw table bytes. On mismatch the
/// table is restored from the backup, reloaded, and the segment registers
/// are re-set. Returns `true` when the table was intact.
#[cfg(target_os = "none")]
pub fn verify_integrity() -> bool {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS},
        tables::sgdt,
    };

    let backup = BACKUP.lock();
    let Some(ref saved) = *backup else {
        return true;
    };

    let pointer = sgdt();
    let pointer_ok = pointer.base.as_u64() == saved.base && pointer.limit == saved.limit;
    // SAFETY: GDT.0 is a live static of GDT_IMAGE_LEN bytes.
    let table = unsafe {
        core::slice::from_raw_parts(
            &GDT.0 as *const GlobalDescriptorTable as *const u8,
            GDT_IMAGE_LEN,
        )
    };
    if pointer_ok && table == &saved.image[..] {
        return true;
    }

    log::error!("descriptor table corruption detected, restoring from backup");
    // SAFETY: The backup is a byte-exact image of the table taken after
    // init(); restoring it and reloading GDTR/segments returns the CPU to
    // the known-good descriptor state. The TSS selector is not reloaded:
    // TR still points at the restored descriptor and reloading a busy TSS
    // descriptor would fault.
    unsafe {
        core::ptr::copy_nonoverlapping(
            saved.image.as_ptr(),
            &GDT.0 as *const GlobalDescriptorTable as *mut u8,
            GDT_IMAGE_LEN,
        );
        GDT.0.load();
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
    }
    false
}

#[cfg(not(target_os = "none"))]
pub fn verify_integrity() -> bool {
    true
}

/// Update the kernel stack pointer in the TSS (RSP0).
///
/// Called during context switch to set the stack used for Ring 3 -> Ring 0
/// transitions. Must be called with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: The TSS is a static initialized during boot. Modifying
    // `privilege_stack_table[0]` via raw pointer is sound because this is
    // only called from the scheduler with interrupts disabled, so no
    // transition can race the write.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Read the current kernel stack pointer from the TSS (RSP0).
pub fn kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}
