//! Tests of the process table and scheduler bookkeeping.
//!
//! These run before `scheduler::start`, so they exercise creation, queue
//! order, state transitions, and tick accounting without ever switching
//! stacks; the boot context impersonates the idle process throughout.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rox_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use rox_os::memory;
use rox_os::process::{self, scheduler, ProcessState};

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
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

fn noop_entry(_arg: usize) {}

#[test_case]
fn test_idle_is_current_after_init() {
    assert_eq!(process::current_pid(), 0, "The boot context is idle.");
    assert_eq!(
        process::count_in(ProcessState::Running),
        1,
        "Exactly one process is running."
    );
}

#[test_case]
fn test_created_processes_queue_fifo() {
    let base = scheduler::ready_count();

    let first = process::create("fifo-a", noop_entry, 0).expect("create fifo-a");
    let second = process::create("fifo-b", noop_entry, 0).expect("create fifo-b");

    assert_eq!(scheduler::ready_count(), base + 2);

    let info_a = process::lookup(first).expect("lookup fifo-a");
    let info_b = process::lookup(second).expect("lookup fifo-b");
    assert_eq!(info_a.state, ProcessState::Ready);
    assert_eq!(info_b.state, ProcessState::Ready);
    assert!(info_b.pid > info_a.pid, "PID allocation is monotonic.");
}

#[test_case]
fn test_block_and_unblock_move_through_states() {
    let pid = process::create("blocker", noop_entry, 0).expect("create blocker");
    let ready = scheduler::ready_count();

    // Nudge the process out of the queue by hand, as block() would.
    process::testing::force_state(pid, ProcessState::Blocked);
    assert_eq!(scheduler::ready_count(), ready - 1);
    assert_eq!(
        process::lookup(pid).expect("lookup").state,
        ProcessState::Blocked
    );

    process::unblock(pid);
    assert_eq!(
        process::lookup(pid).expect("lookup").state,
        ProcessState::Ready
    );
    assert_eq!(
        scheduler::ready_count(),
        ready,
        "An unblocked process lands back on the queue."
    );
}

#[test_case]
fn test_sleeper_wakes_when_tick_passes() {
    let pid = process::create("sleeper", noop_entry, 0).expect("create sleeper");
    process::testing::force_sleep(pid, rox_os::time::ticks() + 2);

    process::wake_sleeping(rox_os::time::ticks() + 1);
    assert_eq!(
        process::lookup(pid).expect("lookup").state,
        ProcessState::Blocked,
        "The wake tick has not passed yet."
    );

    process::wake_sleeping(rox_os::time::ticks() + 2);
    assert_eq!(
        process::lookup(pid).expect("lookup").state,
        ProcessState::Ready,
        "A due sleeper becomes ready."
    );
}

#[test_case]
fn test_tick_charges_the_running_process() {
    let before = process::lookup(0).expect("idle").total_ticks;
    scheduler::tick(rox_os::time::ticks());
    let after = process::lookup(0).expect("idle").total_ticks;
    assert_eq!(after, before + 1, "Ticks are charged to the running PCB.");
}

#[test_case]
fn test_table_exhaustion_returns_none() {
    let mut created = alloc::vec::Vec::new();
    loop {
        match process::create("filler", noop_entry, 0) {
            Some(pid) => created.push(pid),
            None => break,
        }
        assert!(created.len() <= rox_os::process::MAX_PROCESSES, "runaway");
    }

    // Table is full now; one more must fail, not panic.
    assert!(process::create("overflow", noop_entry, 0).is_none());

    for pid in created {
        process::testing::force_state(pid, ProcessState::Terminated);
    }
}
