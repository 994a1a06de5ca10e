//! Boot sequence test: after the full init chain (CPU state, memory,
//! filesystem, processes) the kernel must be in its documented post-boot
//! shape, with the boot context impersonating the idle process.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rox_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use rox_os::fs::{self, Stat};
use rox_os::memory::{self, heap, pmm};
use rox_os::process::{self, ProcessState};
use rox_os::println;

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    rox_os::init();
    // SAFETY: called once with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }
    rox_os::keyboard::init();
    fs::init();
    process::init();

    test_main();

    rox_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rox_os::test_panic_handler(info)
}

/// The console is writable once init ran.
#[test_case]
fn test_console_prints_after_init() {
    println!("boot smoke output");
}

/// Directly after boot the idle process exists, is current, and is the
/// only running process.
#[test_case]
fn test_idle_owns_the_boot_context() {
    assert_eq!(process::current_pid(), 0, "PID 0 is reserved for idle.");

    let idle = process::lookup(0).expect("idle must exist after process::init");
    assert_eq!(idle.state, ProcessState::Running);
    assert_eq!(process::count_in(ProcessState::Running), 1);
    assert_eq!(
        rox_os::process::scheduler::ready_count(),
        0,
        "Nothing is queued before the first create."
    );
}

/// Memory init left the allocators in their boot shape: usable frames
/// discovered, the heap window mapped and consistent.
#[test_case]
fn test_memory_is_initialized() {
    let frames = pmm::stats();
    assert!(frames.total_frames > 0, "The memory map must yield frames.");
    assert!(frames.free_frames <= frames.total_frames);

    let heap_stats = heap::stats();
    assert!(
        heap_stats.total_size >= heap::HEAP_INITIAL_SIZE,
        "The heap window spans at least its initial size."
    );
    assert!(heap::validate(), "The boot heap must pass validation.");
}

/// The RAM filesystem is mounted with the root directory resolvable.
#[test_case]
fn test_root_directory_is_mounted() {
    let root = fs::stat("/", "/").expect("root must stat after fs::init");
    assert_eq!(root.kind, Stat::KIND_DIRECTORY);
    assert_eq!(root.ino, fs::ramfs::ROOT_INO);
}
