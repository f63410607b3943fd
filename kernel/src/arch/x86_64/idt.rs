// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::interrupts::{self, InterruptContext};

fn context_from(vector: u8, error_code: u64, frame: &InterruptStackFrame) -> InterruptContext {
    InterruptContext {
        vector,
        error_code,
        instruction_pointer: frame.instruction_pointer.as_u64(),
        stack_pointer: frame.stack_pointer.as_u64(),
        cpu_flags: frame.cpu_flags.bits(),
        code_segment: frame.code_segment.0,
        stack_segment: frame.stack_segment.0,
    }
}

fn handle_exception(vector: u8, error_code: u64, frame: &InterruptStackFrame) {
    interrupts::dispatch(&context_from(vector, error_code, frame));
}

/// Hardware IRQs acknowledge the controller first: the interrupt-enable
/// flag stays clear until iretq, so re-entry is impossible, and the
/// scheduler tick may context-switch away without leaving the PIC wedged.
fn handle_irq(vector: u8, frame: &InterruptStackFrame) {
    interrupts::end_of_interrupt(vector);
    interrupts::dispatch(&context_from(vector, 0, frame));
}

// CPU pushes no error code for these vectors; the trampoline injects a
// zero so the dispatch frame is uniform.
macro_rules! exception_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            handle_exception($vector, 0, &frame);
        }
    };
}

macro_rules! exception_handler_with_error {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            handle_exception($vector, error_code, &frame);
        }
    };
}

macro_rules! irq_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            handle_irq($vector, &frame);
        }
    };
}

exception_handler!(divide_error_handler, 0);
exception_handler!(debug_handler, 1);
exception_handler!(non_maskable_interrupt_handler, 2);
exception_handler!(breakpoint_handler, 3);
exception_handler!(overflow_handler, 4);
exception_handler!(bound_range_exceeded_handler, 5);
exception_handler!(invalid_opcode_handler, 6);
exception_handler!(device_not_available_handler, 7);
exception_handler_with_error!(invalid_tss_handler, 10);
exception_handler_with_error!(segment_not_present_handler, 11);
exception_handler_with_error!(stack_segment_fault_handler, 12);
exception_handler_with_error!(general_protection_fault_handler, 13);
exception_handler!(x87_floating_point_handler, 16);
exception_handler_with_error!(alignment_check_handler, 17);
exception_handler!(simd_floating_point_handler, 19);
exception_handler!(virtualization_handler, 20);
exception_handler_with_error!(security_exception_handler, 30);

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    handle_exception(8, error_code, &frame);
    // A double fault is never recoverable even if a handler was
    // registered for diagnostics.
    crate::arch::halt()
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    handle_exception(18, 0, &frame);
    crate::arch::halt()
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let info = crate::mm::page_fault::PageFaultInfo {
        faulting_address: Cr2::read_raw(),
        error_code: crate::mm::page_fault::PageFaultBits::from_bits_truncate(error_code.bits()),
        instruction_pointer: frame.instruction_pointer.as_u64(),
        stack_pointer: frame.stack_pointer.as_u64(),
    };
    crate::mm::page_fault::handle(&info);
}

irq_handler!(irq0_handler, 32);
irq_handler!(irq1_handler, 33);
irq_handler!(irq2_handler, 34);
irq_handler!(irq3_handler, 35);
irq_handler!(irq4_handler, 36);
irq_handler!(irq5_handler, 37);
irq_handler!(irq6_handler, 38);
irq_handler!(irq7_handler, 39);
irq_handler!(irq8_handler, 40);
irq_handler!(irq9_handler, 41);
irq_handler!(irq10_handler, 42);
irq_handler!(irq11_handler, 43);
irq_handler!(irq12_handler, 44);
irq_handler!(irq13_handler, 45);
irq_handler!(irq14_handler, 46);
irq_handler!(irq15_handler, 47);

extern "x86-interrupt" fn unknown_interrupt_handler(_frame: InterruptStackFrame) {}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt
            .set_handler_fn(non_maskable_interrupt_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded
            .set_handler_fn(bound_range_exceeded_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        // SAFETY: the double-fault IST index references a dedicated stack
        // configured in the TSS by gdt::init().
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault
            .set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point
            .set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        idt.security_exception
            .set_handler_fn(security_exception_handler);

        idt[32].set_handler_fn(irq0_handler);
        idt[33].set_handler_fn(irq1_handler);
        idt[34].set_handler_fn(irq2_handler);
        idt[35].set_handler_fn(irq3_handler);
        idt[36].set_handler_fn(irq4_handler);
        idt[37].set_handler_fn(irq5_handler);
        idt[38].set_handler_fn(irq6_handler);
        idt[39].set_handler_fn(irq7_handler);
        idt[40].set_handler_fn(irq8_handler);
        idt[41].set_handler_fn(irq9_handler);
        idt[42].set_handler_fn(irq10_handler);
        idt[43].set_handler_fn(irq11_handler);
        idt[44].set_handler_fn(irq12_handler);
        idt[45].set_handler_fn(irq13_handler);
        idt[46].set_handler_fn(irq14_handler);
        idt[47].set_handler_fn(irq15_handler);

        // Everything else defaults to a no-op.
        let mut vector = 48;
        loop {
            idt[vector].set_handler_fn(unknown_interrupt_handler);
            if vector == 255 {
                break;
            }
            vector += 1;
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}
