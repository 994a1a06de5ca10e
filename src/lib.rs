//! Educational x86_64 kernel in Rust.
//! The kernel boots into 64-bit long mode and runs preemptively scheduled
//! processes, some in ring 0 and some in ring 3, against an in-memory
//! filesystem, backed by a hand-rolled physical and virtual memory manager.
//! It is a learning project and not intended to be a production ready OS.
//! Refer to the README.md file for more information about the features supported.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod console;
pub mod fs;
pub mod gdt;
pub mod interrupts;
pub mod keyboard;
pub mod memory;
pub mod process;
pub mod serial;
pub mod syscall;
pub mod time;
pub mod userspace;

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Initialize the CPU-facing kernel state: segmentation, the interrupt
/// descriptor table, the legacy interrupt controllers, the timer, and the
/// fast-syscall machinery.
///
/// Memory management and the filesystem need boot information and are
/// initialized separately through [`memory::init`] and [`fs::init`];
/// [`keyboard::init`] needs the heap and follows them.
pub fn init() {
    gdt::init();
    interrupts::init_idt();
    interrupts::init_pics();
    time::init();
    syscall::init();
}

/// Halt the CPU until the next interrupt, forever.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Test entry point for cargo test.
#[cfg(test)]
bootloader::entry_point!(test_kernel_main);

#[cfg(test)]
fn test_kernel_main(boot_info: &'static bootloader::BootInfo) -> ! {
    init();
    // SAFETY: called once, with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }
    keyboard::init();
    test_main();

    hlt_loop();
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
/// Configuration for the exit port is in the config.toml file.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY:
    // Create a `Port` to write exit_code for qemu.
    unsafe {
        let mut port = Port::new(QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);

    hlt_loop();
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
