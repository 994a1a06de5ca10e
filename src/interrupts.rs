//! Interrupt handling module.
//! This module provides the Interrupt Descriptor Table (IDT) with all 256
//! gates, the built-in CPU exception handlers, and the IRQ dispatch
//! framework with spurious-interrupt filtering and end-of-interrupt
//! bookkeeping for the legacy interrupt controllers.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::{
    instructions::port::Port,
    registers::control::Cr2,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::{gdt, keyboard, println, process, serial_println};

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting after
/// the CPU exception vectors).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Number of IRQ lines behind the two cascaded PICs.
pub const IRQ_LINES: usize = 16;

/// IRQ line of the timer.
pub const TIMER_IRQ: u8 = 0;
/// IRQ line of the PS/2 keyboard.
pub const KEYBOARD_IRQ: u8 = 1;

const PIC_1_COMMAND: u16 = 0x20;
const PIC_2_COMMAND: u16 = 0xA0;
/// OCW3 command selecting the in-service register for the next read.
const PIC_READ_ISR: u8 = 0x0B;

/// The Programmable Interrupt Controller (PIC) pair used for hardware interrupts.
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Context handed to exception handlers: the trapped register state as far
/// as the gate type exposes it, plus the decoded vector identity.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    /// CPU vector number (0..32).
    pub vector: u8,
    /// Human readable exception name.
    pub name: &'static str,
    /// Hardware error code, for the vectors that push one.
    pub error_code: Option<u64>,
    /// Faulting instruction pointer.
    pub instruction_pointer: u64,
    /// Stack pointer at the fault.
    pub stack_pointer: u64,
    /// Code segment at the fault; selects the ring the fault came from.
    pub code_segment: u64,
}

impl ExceptionInfo {
    /// Whether the exception was raised while executing ring 3 code.
    #[must_use]
    pub fn from_user_mode(&self) -> bool {
        self.code_segment & 0b11 == 0b11
    }
}

/// A registered exception handler. Returning means "resume the trapped context".
pub type ExceptionHandler = fn(&ExceptionInfo);

/// A registered IRQ handler, called with the IRQ line number.
pub type IrqHandler = fn(u8);

static EXCEPTION_HANDLERS: Mutex<[Option<ExceptionHandler>; 32]> = Mutex::new([None; 32]);
static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; IRQ_LINES]> = Mutex::new([None; IRQ_LINES]);

/// Register a handler for a CPU exception vector, overriding the built-in
/// fatal diagnostics for that vector.
pub fn register_exception_handler(vector: u8, handler: ExceptionHandler) {
    assert!(vector < 32, "exception vectors are 0..32");
    EXCEPTION_HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Register a handler for an IRQ line.
pub fn register_irq_handler(irq: u8, handler: IrqHandler) {
    assert!((irq as usize) < IRQ_LINES, "IRQ lines are 0..16");
    IRQ_HANDLERS.lock()[irq as usize] = Some(handler);
}

/// Remove the handler for an IRQ line. Subsequent interrupts on the line
/// are acknowledged but otherwise ignored.
pub fn unregister_irq_handler(irq: u8) {
    assert!((irq as usize) < IRQ_LINES, "IRQ lines are 0..16");
    IRQ_HANDLERS.lock()[irq as usize] = None;
}

/// Generates an `extern "x86-interrupt"` trampoline for an exception
/// without a hardware error code.
macro_rules! exception_stub {
    ($handler:ident, $vector:expr, $name:expr) => {
        extern "x86-interrupt" fn $handler(stack_frame: InterruptStackFrame) {
            on_exception(&ExceptionInfo {
                vector: $vector,
                name: $name,
                error_code: None,
                instruction_pointer: stack_frame.instruction_pointer.as_u64(),
                stack_pointer: stack_frame.stack_pointer.as_u64(),
                code_segment: stack_frame.code_segment,
            });
        }
    };
}

/// Generates a trampoline for an exception that pushes an error code.
macro_rules! exception_stub_with_code {
    ($handler:ident, $vector:expr, $name:expr) => {
        extern "x86-interrupt" fn $handler(stack_frame: InterruptStackFrame, error_code: u64) {
            on_exception(&ExceptionInfo {
                vector: $vector,
                name: $name,
                error_code: Some(error_code),
                instruction_pointer: stack_frame.instruction_pointer.as_u64(),
                stack_pointer: stack_frame.stack_pointer.as_u64(),
                code_segment: stack_frame.code_segment,
            });
        }
    };
}

/// Generates a trampoline for an IRQ line.
macro_rules! irq_stub {
    ($handler:ident, $irq:expr) => {
        extern "x86-interrupt" fn $handler(_stack_frame: InterruptStackFrame) {
            on_irq($irq);

            // Preemption happens here, after the end-of-interrupt: the
            // interrupted context is already saved on this kernel stack, so
            // a reschedule simply parks it until the process is picked again.
            if $irq == TIMER_IRQ {
                process::scheduler::preempt_if_requested();
            }
        }
    };
}

exception_stub!(divide_error_handler, 0, "DIVIDE ERROR");
exception_stub!(debug_handler, 1, "DEBUG");
exception_stub!(nmi_handler, 2, "NON-MASKABLE INTERRUPT");
exception_stub!(overflow_handler, 4, "OVERFLOW");
exception_stub!(bound_range_handler, 5, "BOUND RANGE EXCEEDED");
exception_stub!(invalid_opcode_handler, 6, "INVALID OPCODE");
exception_stub!(device_not_available_handler, 7, "DEVICE NOT AVAILABLE");
exception_stub_with_code!(invalid_tss_handler, 10, "INVALID TSS");
exception_stub_with_code!(segment_not_present_handler, 11, "SEGMENT NOT PRESENT");
exception_stub_with_code!(stack_segment_handler, 12, "STACK SEGMENT FAULT");
exception_stub!(x87_floating_point_handler, 16, "x87 FLOATING POINT");
exception_stub_with_code!(alignment_check_handler, 17, "ALIGNMENT CHECK");
exception_stub!(simd_floating_point_handler, 19, "SIMD FLOATING POINT");
exception_stub!(virtualization_handler, 20, "VIRTUALIZATION");
exception_stub_with_code!(security_exception_handler, 30, "SECURITY EXCEPTION");

irq_stub!(irq0_handler, 0);
irq_stub!(irq1_handler, 1);
irq_stub!(irq2_handler, 2);
irq_stub!(irq3_handler, 3);
irq_stub!(irq4_handler, 4);
irq_stub!(irq5_handler, 5);
irq_stub!(irq6_handler, 6);
irq_stub!(irq7_handler, 7);
irq_stub!(irq8_handler, 8);
irq_stub!(irq9_handler, 9);
irq_stub!(irq10_handler, 10);
irq_stub!(irq11_handler, 11);
irq_stub!(irq12_handler, 12);
irq_stub!(irq13_handler, 13);
irq_stub!(irq14_handler, 14);
irq_stub!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);

        // SAFETY:
        // The double fault handler is safe to set as the IST index is valid
        // and backed by a dedicated stack in the TSS.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
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

        let irq_handlers: [extern "x86-interrupt" fn(InterruptStackFrame); IRQ_LINES] = [
            irq0_handler,
            irq1_handler,
            irq2_handler,
            irq3_handler,
            irq4_handler,
            irq5_handler,
            irq6_handler,
            irq7_handler,
            irq8_handler,
            irq9_handler,
            irq10_handler,
            irq11_handler,
            irq12_handler,
            irq13_handler,
            irq14_handler,
            irq15_handler,
        ];
        for (irq, handler) in irq_handlers.iter().enumerate() {
            idt[usize::from(PIC_1_OFFSET) + irq].set_handler_fn(*handler);
        }

        for vector in (usize::from(PIC_1_OFFSET) + IRQ_LINES)..256 {
            idt[vector].set_handler_fn(default_handler);
        }

        idt
    };
}

/// Initialize the Interrupt Descriptor Table (IDT).
pub fn init_idt() {
    IDT.load();
}

/// Initialize and unmask the interrupt controllers.
///
/// Only the timer, the keyboard, and the cascade line are unmasked; the
/// remaining lines stay off until a driver registers for them.
pub fn init_pics() {
    // SAFETY:
    // Standard remap-and-mask sequence; the offsets avoid the CPU
    // exception vector range.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0b1111_1000, 0b1111_1111);
    }

    register_irq_handler(KEYBOARD_IRQ, keyboard_irq_handler);
}

/// Common exception entry: user-registered handler first, otherwise the
/// built-in diagnostics.
fn on_exception(info: &ExceptionInfo) {
    let registered = EXCEPTION_HANDLERS.lock()[info.vector as usize];
    if let Some(handler) = registered {
        handler(info);
        return;
    }

    fatal_exception(info);
}

/// Common IRQ entry: filter spurious interrupts, dispatch, acknowledge.
fn on_irq(irq: u8) {
    if is_spurious(irq) {
        return;
    }

    let registered = IRQ_HANDLERS.lock()[irq as usize];
    if let Some(handler) = registered {
        handler(irq);
    }

    // SAFETY:
    // The crate handles master/slave routing: IRQs 0-7 acknowledge the
    // master only, IRQs 8-15 acknowledge the slave and then the master.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}

/// Detect spurious IRQ 7 / IRQ 15 by reading the in-service register of
/// the owning controller. A spurious IRQ 7 needs no acknowledgment at
/// all; a spurious IRQ 15 still needs one for the master's cascade line.
fn is_spurious(irq: u8) -> bool {
    if irq != 7 && irq != 15 {
        return false;
    }

    let command_port = if irq == 7 { PIC_1_COMMAND } else { PIC_2_COMMAND };

    // SAFETY:
    // OCW3 read of the in-service register; reading the command port after
    // the OCW3 write is the documented handshake.
    let in_service: u8 = unsafe {
        let mut port: Port<u8> = Port::new(command_port);
        port.write(PIC_READ_ISR);
        port.read()
    };

    if in_service & 0x80 != 0 {
        return false;
    }

    serial_println!("[irq] spurious interrupt on line {}", irq);
    if irq == 15 {
        // SAFETY:
        // The slave never raised the line, but the master's cascade entry
        // is in service and must be cleared.
        unsafe {
            let mut master: Port<u8> = Port::new(PIC_1_COMMAND);
            master.write(0x20);
        }
    }
    true
}

fn keyboard_irq_handler(_irq: u8) {
    let mut port = Port::new(0x60);

    // SAFETY:
    // We are reading from the keyboard data port which is known to be safe.
    let scancode: u8 = unsafe { port.read() };
    keyboard::add_scancode(scancode);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    let info = ExceptionInfo {
        vector: 3,
        name: "BREAKPOINT",
        error_code: None,
        instruction_pointer: stack_frame.instruction_pointer.as_u64(),
        stack_pointer: stack_frame.stack_pointer.as_u64(),
        code_segment: stack_frame.code_segment,
    };

    let registered = EXCEPTION_HANDLERS.lock()[3];
    if let Some(handler) = registered {
        handler(&info);
        return;
    }

    // Breakpoints are the one built-in that resumes execution.
    println!("EXCEPTION: BREAKPOINT at {:#x}", info.instruction_pointer);
    serial_println!("EXCEPTION: BREAKPOINT at {:#x}", info.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    serial_println!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    serial_println!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let info = ExceptionInfo {
        vector: 13,
        name: "GENERAL PROTECTION FAULT",
        error_code: Some(error_code),
        instruction_pointer: stack_frame.instruction_pointer.as_u64(),
        stack_pointer: stack_frame.stack_pointer.as_u64(),
        code_segment: stack_frame.code_segment,
    };

    let registered = EXCEPTION_HANDLERS.lock()[13];
    if let Some(handler) = registered {
        handler(&info);
        return;
    }

    // A non-zero error code names the selector that triggered the fault.
    if error_code != 0 {
        let index = (error_code >> 3) & 0x1FFF;
        let table = match (error_code >> 1) & 0b11 {
            0 => "GDT",
            1 | 3 => "IDT",
            _ => "LDT",
        };
        serial_println!(
            "[fault] GP: selector index {} in {} (external: {})",
            index,
            table,
            error_code & 1 != 0
        );
    }
    fatal_exception(&info);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_address = Cr2::read();

    let info = ExceptionInfo {
        vector: 14,
        name: "PAGE FAULT",
        error_code: Some(error_code.bits()),
        instruction_pointer: stack_frame.instruction_pointer.as_u64(),
        stack_pointer: stack_frame.stack_pointer.as_u64(),
        code_segment: stack_frame.code_segment,
    };

    let registered = EXCEPTION_HANDLERS.lock()[14];
    if let Some(handler) = registered {
        handler(&info);
        return;
    }

    serial_println!("[fault] page fault at {:?} ({:?})", fault_address, error_code);
    println!("[fault] page fault at {:?} ({:?})", fault_address, error_code);
    fatal_exception(&info);
}

extern "x86-interrupt" fn default_handler(_stack_frame: InterruptStackFrame) {
    // Vectors 48..256 are unused by the kernel; anything landing here is a
    // programming error or stray hardware.
    serial_println!("[interrupt] unexpected vector above 47");
}

/// Log the trapped context and halt with interrupts masked.
///
/// A ring 3 fault takes the whole kernel down too; terminating only the
/// offending process is a known simplification.
fn fatal_exception(info: &ExceptionInfo) -> ! {
    let origin = if info.from_user_mode() { "ring 3" } else { "ring 0" };
    serial_println!(
        "EXCEPTION: {} ({}) at {:#x}, rsp {:#x}, error {:?}, pid {}",
        info.name,
        origin,
        info.instruction_pointer,
        info.stack_pointer,
        info.error_code,
        process::current_pid(),
    );
    println!("EXCEPTION: {} ({}) at {:#x}", info.name, origin, info.instruction_pointer);

    x86_64::instructions::interrupts::disable();
    crate::hlt_loop();
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};

    use x86_64::instructions::interrupts;

    use super::{register_exception_handler, ExceptionInfo};

    #[test_case]
    fn test_breakpoint_exception() {
        interrupts::int3();
    }

    /// A registered handler takes precedence over the built-in one and
    /// resumes the trapped context on return.
    #[test_case]
    fn test_registered_exception_handler_is_dispatched() {
        static HIT: AtomicBool = AtomicBool::new(false);

        fn on_breakpoint(_info: &ExceptionInfo) {
            HIT.store(true, Ordering::SeqCst);
        }

        register_exception_handler(3, on_breakpoint);
        interrupts::int3();
        assert!(
            HIT.load(Ordering::SeqCst),
            "The registered handler must run for its vector."
        );
    }
}
