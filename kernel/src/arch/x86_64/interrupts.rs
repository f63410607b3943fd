//! Interrupt dispatch
//!
//! A dense 256-slot handler table indexed by vector, fed by the IDT
//! trampolines in `idt.rs`. Every trampoline normalizes its arguments
//! into an [`InterruptContext`] (injecting a zero error code where the
//! CPU does not push one) before calling [`dispatch`], so handlers see a
//! uniform frame regardless of vector.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the remapped primary PIC.
pub const PIC_1_OFFSET: u8 = 32;
/// First vector of the remapped secondary PIC.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Vector the PIT timer (IRQ 0) arrives on after remapping.
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;

/// Number of CPU exception vectors.
const EXCEPTION_VECTORS: u8 = 32;

/// The legacy interrupt controller pair, remapped to vectors 32..48.
// SAFETY: the chosen offsets do not collide with CPU exceptions.
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Uniform view of an interrupt delivered to a handler: the trampoline's
/// vector and error code followed by the CPU-pushed frame tail.
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub vector: u8,
    pub error_code: u64,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub cpu_flags: u64,
    pub code_segment: u16,
    pub stack_segment: u16,
}

/// A registered interrupt handler.
pub type InterruptHandler = fn(&InterruptContext);

/// Dense handler table. Written only during init, before interrupts are
/// enabled; read by the dispatcher with the lock held only long enough to
/// copy the function pointer out.
static HANDLERS: Mutex<[Option<InterruptHandler>; 256]> = Mutex::new([None; 256]);

/// Load the IDT and remap the interrupt controllers.
pub fn init() {
    super::idt::init();

    #[cfg(target_os = "none")]
    // SAFETY: remapping the PICs to 32..48 moves hardware IRQs clear of
    // the CPU exception range; interrupts are still disabled here.
    unsafe {
        PICS.lock().initialize();
    }

    log::info!("interrupt dispatch initialized, PIC remapped to 32..48");
}

/// Store a handler for a vector. Intended to be called during subsystem
/// init, before interrupts are enabled.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Common dispatch invoked by every trampoline.
///
/// A registered handler is called if present. Otherwise CPU exceptions
/// are fatal: the frame is dumped and the CPU halts. Unregistered
/// hardware IRQs are silently dropped (their EOI has already been sent by
/// the trampoline path).
pub(crate) fn dispatch(ctx: &InterruptContext) {
    let handler = HANDLERS.lock()[ctx.vector as usize];
    match handler {
        Some(h) => h(ctx),
        None if ctx.vector < EXCEPTION_VECTORS => unhandled_exception(ctx),
        None => {}
    }
}

/// Acknowledge a hardware interrupt on the legacy controller. For vectors
/// on the secondary PIC (>= 40) the EOI is routed to both controllers.
pub(crate) fn end_of_interrupt(vector: u8) {
    #[cfg(target_os = "none")]
    // SAFETY: `vector` comes from the IRQ trampolines and is always in
    // the remapped 32..48 range the PICs were initialized with.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
    #[cfg(not(target_os = "none"))]
    let _ = vector;
}

fn unhandled_exception(ctx: &InterruptContext) -> ! {
    crate::critical!(
        "unhandled CPU exception {}: error={:#x} rip={:#x} rsp={:#x} rflags={:#x} cs={:#x} ss={:#x}",
        ctx.vector,
        ctx.error_code,
        ctx.instruction_pointer,
        ctx.stack_pointer,
        ctx.cpu_flags,
        ctx.code_segment,
        ctx.stack_segment
    );
    crate::arch::halt()
}
