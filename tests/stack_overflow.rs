//! A kernel stack overflow must be caught as a double fault on the
//! dedicated IST stack, and getting there must not corrupt the process
//! table: the handler verifies that the boot context still impersonates
//! idle and that an already-created process is still queued untouched.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};

use bootloader::{entry_point, BootInfo};
use lazy_static::lazy_static;
use rox_os::process::{self, ProcessState};
use rox_os::{exit_qemu, gdt, memory, serial_print, serial_println, QemuExitCode};
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

/// PID of the process created before the overflow, checked afterwards.
static BYSTANDER_PID: AtomicU64 = AtomicU64::new(0);

entry_point!(main);

/// This test checks that a stack overflow is handled as a double fault
/// while the PCB arena stays intact.
/// # Panics
/// This test should panic if the stack overflows without a double fault.
fn main(boot_info: &'static BootInfo) -> ! {
    serial_print!("stack_overflow::stack_overflow...\t");

    gdt::init();
    init_test_idt();

    // SAFETY: called once with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }
    process::init();

    let pid = process::create("bystander", bystander_entry, 0).expect("process table has room");
    BYSTANDER_PID.store(pid, Ordering::SeqCst);

    stack_overflow();

    panic!("Execution should not reach here");
}

/// Never runs; it only exists so the bystander PCB is a fully formed,
/// queued process while the boot stack overflows.
fn bystander_entry(_arg: usize) {}

#[expect(
    unconditional_recursion,
    reason = "This function is expected to cause a stack overflow."
)]
fn stack_overflow() {
    stack_overflow();
    volatile::Volatile::new(0).read();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rox_os::test_panic_handler(info)
}

lazy_static! {
    static ref TEST_IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // SAFETY:
        // The double fault handler is safe to set as the index is valid.
        unsafe {
            idt.double_fault
                .set_handler_fn(test_double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt
    };
}

/// Initialize the test Interrupt Descriptor Table (IDT) for the test.
pub fn init_test_idt() {
    TEST_IDT.load();
}

extern "x86-interrupt" fn test_double_fault_handler(
    _stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    // Running here at all proves the IST switch worked; the overflow ran
    // on the boot stack, which impersonates idle, so the process table
    // must still read exactly as it did before the recursion.
    assert_eq!(
        process::current_pid(),
        0,
        "The overflowing boot context still counts as idle.",
    );
    assert_eq!(
        process::count_in(ProcessState::Running),
        1,
        "Exactly one PCB stays in the running state.",
    );

    let pid = BYSTANDER_PID.load(Ordering::SeqCst);
    let bystander = process::lookup(pid).expect("bystander PCB survived the overflow");
    assert_eq!(
        bystander.state,
        ProcessState::Ready,
        "The queued process must be untouched by the fault.",
    );
    assert_eq!(
        rox_os::process::scheduler::ready_count(),
        1,
        "The ready queue still holds exactly the bystander.",
    );

    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);

    rox_os::hlt_loop();
}
