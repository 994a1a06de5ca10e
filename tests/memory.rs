//! Tests for the frame allocator and the paging manager against live
//! boot-provided memory.

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
use rox_os::memory::{self, paging, pmm};
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

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

/// A scratch virtual page in an otherwise unused kernel region.
const SCRATCH_PAGE: u64 = 0x_5555_0000_0000;

#[test_case]
fn test_boot_leaves_usable_memory() {
    let stats = pmm::stats();
    assert!(stats.total_frames > 1024, "At least 4 MiB must be usable.");
    assert!(stats.free_frames > 0);
    assert!(stats.free_frames <= stats.total_frames);
}

#[test_case]
fn test_alloc_and_free_roundtrip() {
    let before = pmm::stats().free_frames;

    let frame = pmm::alloc_one().expect("out of frames");
    assert!(!pmm::is_free(frame), "An allocated frame is not free.");
    assert_eq!(pmm::stats().free_frames, before - 1);

    pmm::free_one(frame);
    assert!(pmm::is_free(frame));
    assert_eq!(pmm::stats().free_frames, before);
}

#[test_case]
fn test_double_free_is_ignored() {
    let frame = pmm::alloc_one().expect("out of frames");
    pmm::free_one(frame);

    let stats = pmm::stats();
    pmm::free_one(frame);
    assert_eq!(
        pmm::stats(),
        stats,
        "A double free must leave the counters alone."
    );
}

#[test_case]
fn test_reserve_then_free_restores_frame() {
    let frame = pmm::alloc_one().expect("out of frames");
    pmm::free_one(frame);

    // Reserving twice is idempotent; one free brings the frame back.
    pmm::reserve(frame, 1);
    pmm::reserve(frame, 1);
    assert!(!pmm::is_free(frame));

    pmm::free_one(frame);
    assert!(pmm::is_free(frame));
}

#[test_case]
fn test_contiguous_frames_are_adjacent() {
    let first = pmm::alloc_contiguous(4).expect("no contiguous run");
    for offset in 0..4_u64 {
        assert!(!pmm::is_free(first + offset));
    }
    pmm::free_contiguous(first, 4);
    for offset in 0..4_u64 {
        assert!(pmm::is_free(first + offset));
    }
}

#[test_case]
fn test_map_translate_unmap_roundtrip() {
    let frame = pmm::alloc_one().expect("out of frames");
    let virt = VirtAddr::new(SCRATCH_PAGE);

    paging::map(virt, frame.start_address(), PageTableFlags::WRITABLE)
        .expect("mapping failed");
    assert_eq!(
        paging::translate(virt),
        Some(frame.start_address()),
        "A mapped page must translate to its frame."
    );

    // The mapping is real: write through it and read back.
    let ptr: *mut u64 = virt.as_mut_ptr();
    // SAFETY: the page was just mapped writable.
    unsafe {
        ptr.write_volatile(0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(ptr.read_volatile(), 0xDEAD_BEEF_CAFE_F00D);
    }

    assert!(paging::unmap(virt), "Unmapping a live page succeeds.");
    assert_eq!(
        paging::translate(virt),
        None,
        "An unmapped page translates to nothing."
    );

    pmm::free_one(frame);
}

#[test_case]
fn test_unmapping_never_mapped_address_fails() {
    assert!(!paging::unmap(VirtAddr::new(SCRATCH_PAGE + 0x10_0000)));
}

#[test_case]
fn test_map_range_rolls_back_cleanly() {
    let frame = pmm::alloc_one().expect("out of frames");
    let virt = VirtAddr::new(SCRATCH_PAGE + 0x100_0000);

    paging::map_range(virt, frame.start_address(), 4096, PageTableFlags::WRITABLE)
        .expect("single page range failed");
    paging::unmap_range(virt, 4096);
    assert_eq!(paging::translate(virt), None);

    pmm::free_one(frame);
}

#[test_case]
fn test_address_space_lifecycle() {
    let before = pmm::stats().free_frames;

    let root = paging::create_address_space().expect("no frame for address space");
    let virt = VirtAddr::new(paging::USER_SPACE_BASE + 0x1000);
    let frame = pmm::alloc_one().expect("out of frames");

    paging::map_user(root, virt, frame.start_address(), PageTableFlags::WRITABLE)
        .expect("user mapping failed");

    let mut data_frames = 0;
    paging::for_each_user_frame(root, &mut |_| data_frames += 1);
    assert_eq!(data_frames, 1, "Exactly the mapped data frame is found.");

    paging::for_each_user_frame(root, &mut rox_os::memory::pmm::free_one);
    paging::destroy_address_space(root);

    assert_eq!(
        pmm::stats().free_frames,
        before,
        "Address space teardown must return every frame."
    );
}

#[test_case]
fn test_map_user_rejects_kernel_addresses() {
    let root = paging::create_address_space().expect("no frame for address space");
    let frame = pmm::alloc_one().expect("out of frames");

    let result = paging::map_user(
        root,
        VirtAddr::new(0x1000),
        frame.start_address(),
        PageTableFlags::WRITABLE,
    );
    assert_eq!(
        result,
        Err(paging::MapError::NotUserAddress),
        "Mapping outside the user window must be refused."
    );

    pmm::free_one(frame);
    paging::destroy_address_space(root);
}
