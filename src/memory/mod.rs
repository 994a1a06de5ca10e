//! Memory management: physical frames, paging, and the kernel heap.
//!
//! Initialization is strictly ordered: the frame allocator consumes the
//! boot memory map, the paging manager then builds the kernel address
//! space on top of it, and finally the heap maps its initial window
//! through both.

use bootloader::BootInfo;
use conquer_once::spin::OnceCell;
use x86_64::{PhysAddr, VirtAddr};

pub mod heap;
pub mod paging;
pub mod pmm;

/// Size of one page and one frame.
pub const PAGE_SIZE: usize = 4096;

/// Offset at which the bootloader maps all physical memory.
static PHYS_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Initialize the whole memory stack from the boot information.
///
/// # Safety
///
/// Must be called exactly once, with the boot information handed to the
/// kernel entry point, before anything allocates.
pub unsafe fn init(boot_info: &'static BootInfo) {
    PHYS_OFFSET
        .try_init_once(|| VirtAddr::new(boot_info.physical_memory_offset))
        .expect("memory::init called twice");

    pmm::init(&boot_info.memory_map);
    // SAFETY:
    // The physical memory offset comes straight from the bootloader and
    // the frame allocator is ready to back fresh page tables.
    unsafe {
        paging::init();
    }
    heap::init().expect("kernel heap initialization failed");
}

/// Virtual address of a physical address inside the bootloader's
/// physical-memory window.
///
/// # Panics
///
/// Panics if called before [`init`].
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    let offset = PHYS_OFFSET
        .try_get()
        .expect("memory subsystem not initialized");
    *offset + phys.as_u64()
}

/// Align `value` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(8192, 4096), 8192);
    }
}
