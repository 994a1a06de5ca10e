//! Kernel entry point: bring the subsystems up in dependency order, seed
//! a few demo processes (ring 0 and ring 3), and hand the CPU to the
//! scheduler.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rox_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use rox_os::{
    fs, memory, print, println, process, serial_println, time, userspace,
};

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    println!("rox_os booting...");
    serial_println!("rox_os booting...");

    rox_os::init();

    // SAFETY: called once, with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }
    rox_os::keyboard::init();
    fs::init();
    process::init();

    #[cfg(test)]
    test_main();

    let stats = memory::pmm::stats();
    println!(
        "memory: {} MiB usable, heap at {:#x}",
        stats.total_memory / (1024 * 1024),
        memory::heap::HEAP_START,
    );

    fs::mkdir("/tmp", "/").expect("mkdir /tmp failed");

    process::create("alpha", demo_process, 1).expect("process table full");
    process::create("beta", demo_process, 2).expect("process table full");
    userspace::spawn("hello", userspace::DEMO_PROGRAM).expect("user spawn failed");

    x86_64::instructions::interrupts::enable();
    process::scheduler::start();
}

/// Ring 0 demo body: a few greetings with voluntary and timed pauses in
/// between, then a clean exit.
fn demo_process(id: usize) {
    println!("[proc {}] pid {} up at tick {}", id, process::current_pid(), time::ticks());

    for round in 0..3 {
        print!("[proc {}] round {}\n", id, round);
        if round == 0 {
            process::yield_now();
        } else {
            process::sleep_ticks(id as u64 * 2);
        }
    }

    println!("[proc {}] done", id);
}

////////////////////////
//    Panic handler   //
////////////////////////

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    println!("KERNEL PANIC: {}", info);
    serial_println!("KERNEL PANIC: {}", info);
    rox_os::hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rox_os::test_panic_handler(info)
}
