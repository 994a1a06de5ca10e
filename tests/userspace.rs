//! Integration test for the user-space plumbing: address-space
//! construction, user image mapping, and the syscall validation layer.
//!
//! Actually dropping to ring 3 requires handing the CPU to the scheduler,
//! which never returns; the full round trip is exercised by the kernel
//! binary itself. Here we verify everything that can be checked before
//! `start`: spawned processes exist with their address spaces built, and
//! the pointer validation rejects each class of bad user argument.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rox_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use rox_os::process::{self, ProcessFlags, ProcessState};
use rox_os::syscall::uaccess;
use rox_os::{memory, userspace};

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    rox_os::init();
    // SAFETY: called once with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }
    rox_os::fs::init();
    process::init();

    test_main();

    rox_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rox_os::test_panic_handler(info)
}

#[test_case]
fn test_spawn_builds_a_user_process() {
    let pid = userspace::spawn("demo", userspace::DEMO_PROGRAM).expect("spawn failed");

    let info = process::lookup(pid).expect("spawned process exists");
    assert_eq!(info.state, ProcessState::Ready);
    assert!(info.flags.contains(ProcessFlags::USER));
    assert!(!info.flags.contains(ProcessFlags::KERNEL));

    process::testing::force_state(pid, ProcessState::Terminated);
}

#[test_case]
fn test_write_with_kernel_half_pointer_is_rejected() {
    assert!(
        uaccess::check_user_range(0xFFFF_FFFF_0000_0000, 1).is_err(),
        "A kernel-half buffer must fail validation."
    );
}

#[test_case]
fn test_write_with_wrapping_length_is_rejected() {
    assert!(
        uaccess::check_user_range(userspace::USER_CODE_BASE, u64::MAX).is_err(),
        "A length that wraps or crosses the window must fail."
    );
}

#[test_case]
fn test_write_with_null_pointer_is_rejected() {
    assert!(uaccess::check_user_range(0, 16).is_err());
}

#[test_case]
fn test_zero_length_write_with_valid_pointer_is_accepted() {
    assert!(
        uaccess::check_user_range(userspace::USER_CODE_BASE, 0).is_ok(),
        "A zero-length buffer at a valid user address passes."
    );
}

#[test_case]
fn test_user_stack_range_validates() {
    assert!(uaccess::check_user_range(
        userspace::USER_STACK_BOTTOM,
        userspace::USER_STACK_SIZE
    )
    .is_ok());
}
