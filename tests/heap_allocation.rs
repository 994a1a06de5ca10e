//! Tests for the first-fit kernel heap in a `no_std` environment.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rox_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_assert_message)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use rox_os::memory::{self, heap};

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    rox_os::init();
    // SAFETY: called once with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }

    test_main();

    rox_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rox_os::test_panic_handler(info)
}

#[test_case]
fn when_creating_simple_allocation_then_memory_is_allocated() {
    let heap_value_1 = Box::new(41);
    let heap_value_2 = Box::new(42);

    assert_eq!(*heap_value_1, 41);
    assert_eq!(*heap_value_2, 42);
}

#[test_case]
fn when_creating_large_vec_then_memory_is_allocated() {
    let mut vec = Vec::new();
    for i in 0..1000 {
        vec.push(i);
    }
    assert_eq!(vec.iter().sum::<u64>(), (0..1000).sum());
}

#[test_case]
fn when_allocating_zero_bytes_then_null_is_returned() {
    assert!(heap::alloc(0).is_null());
}

#[test_case]
fn when_freeing_null_then_nothing_happens() {
    heap::free(core::ptr::null_mut());
    assert!(heap::validate());
}

#[test_case]
fn when_alloc_then_free_then_heap_validates_and_bytes_return() {
    let before = heap::stats();

    let ptr = heap::alloc(1000);
    assert!(!ptr.is_null());
    assert!(heap::validate());

    heap::free(ptr);
    assert!(heap::validate());

    let after = heap::stats();
    assert_eq!(
        before.used_bytes, after.used_bytes,
        "Used byte count must return to its pre-allocation value."
    );
}

#[test_case]
fn when_double_freeing_then_second_free_is_ignored() {
    let ptr = heap::alloc(64);
    assert!(!ptr.is_null());
    heap::free(ptr);

    let stats = heap::stats();
    heap::free(ptr);
    assert_eq!(
        heap::stats(),
        stats,
        "A double free must not change the heap."
    );
    assert!(heap::validate());
}

#[test_case]
fn when_freeing_neighbors_then_blocks_coalesce() {
    let a = heap::alloc(256);
    let b = heap::alloc(256);
    let c = heap::alloc(256);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    let populated = heap::stats();
    heap::free(b);
    heap::free(a);
    heap::free(c);

    assert!(heap::validate(), "No two adjacent free blocks may survive.");
    assert!(
        heap::stats().blocks < populated.blocks,
        "Freeing all three neighbors must merge blocks."
    );
}

#[test_case]
fn when_reallocating_then_content_is_preserved() {
    let ptr = heap::alloc(32);
    assert!(!ptr.is_null());
    // SAFETY: freshly allocated 32 byte block.
    unsafe {
        core::ptr::write_bytes(ptr, 0xAB, 32);
    }

    let grown = heap::realloc(ptr, 4096);
    assert!(!grown.is_null());
    for offset in 0..32 {
        // SAFETY: grown block is at least 4096 bytes.
        let byte = unsafe { *grown.add(offset) };
        assert_eq!(byte, 0xAB, "Realloc must copy the old payload.");
    }
    heap::free(grown);
    assert!(heap::validate());
}

#[test_case]
fn when_allocating_aligned_then_pointer_obeys_alignment() {
    let ptr = heap::alloc_aligned(100, 256);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 256, 0, "Pointer must honor the alignment.");

    heap::free(ptr);
    assert!(heap::validate(), "Aligned frees must find their header.");
}

#[test_case]
fn when_exceeding_initial_window_then_heap_expands() {
    let before = heap::stats();
    let big = heap::alloc(heap::HEAP_INITIAL_SIZE);
    assert!(!big.is_null(), "Allocation beyond the window must expand it.");
    assert!(heap::stats().total_size > before.total_size);

    heap::free(big);
    assert!(heap::validate());
}
