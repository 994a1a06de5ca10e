//! Four-level paging manager.
//!
//! Table walks go through the bootloader's physical-memory window. The
//! kernel owns one distinguished root built at init from the boot tables;
//! every user process owns a private root whose kernel-side slots are
//! cloned from it, so kernel code and data stay visible in every context.
//!
//! The user window is a fixed range of top-level slots
//! ([`USER_PML4_FIRST`]..=[`USER_PML4_LAST`]). Mappings inside it must
//! carry the user-accessible bit; mappings outside it must not.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;
use x86_64::{
    instructions::{interrupts, tlb},
    registers::control::Cr3,
    structures::paging::{PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{phys_to_virt, pmm, PAGE_SIZE};
use crate::serial_println;

/// Top-level slot holding the recursive self-mapping of the kernel root.
pub const RECURSIVE_INDEX: usize = 510;

/// First top-level slot of the user window.
pub const USER_PML4_FIRST: usize = 160;
/// Last top-level slot of the user window (inclusive).
pub const USER_PML4_LAST: usize = 167;

/// Lowest user-addressable virtual address.
pub const USER_SPACE_BASE: u64 = (USER_PML4_FIRST as u64) << 39;
/// One past the highest user-addressable virtual address.
pub const USER_SPACE_END: u64 = ((USER_PML4_LAST as u64) + 1) << 39;

/// Physical address of the kernel root table. Zero until [`init`] ran.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Pages currently mapped through [`map`] (kernel space only).
static MAPPED_PAGES: AtomicU64 = AtomicU64::new(0);

/// Serializes all table mutations. The data lives in the tables
/// themselves; the mutex only guards the walks.
static TABLE_LOCK: Mutex<()> = Mutex::new(());

/// Failures of the paging manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame allocator ran dry mid-walk.
    FrameExhausted,
    /// A 1 GiB huge page sits above the requested 4 KiB mapping; splitting
    /// it is not supported.
    GiantHugeParent,
    /// The virtual address lies outside the user window.
    NotUserAddress,
}

fn table_at(frame: PhysFrame) -> *mut PageTable {
    phys_to_virt(frame.start_address()).as_mut_ptr()
}

/// Flags an intermediate table entry carries in kernel space.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::from_bits_truncate(
    PageTableFlags::PRESENT.bits() | PageTableFlags::WRITABLE.bits(),
);

/// Flags an intermediate table entry carries inside the user window.
const USER_TABLE_FLAGS: PageTableFlags = PageTableFlags::from_bits_truncate(
    TABLE_FLAGS.bits() | PageTableFlags::USER_ACCESSIBLE.bits(),
);

/// Build the kernel address space and switch to it.
///
/// Reads the boot root, clones every present top-level entry into a fresh
/// root (the boot identity mappings and the physical-memory window among
/// them), installs the recursive self-mapping, and loads CR3.
///
/// # Safety
///
/// Must run once, after [`pmm::init`], while still on the boot tables.
pub unsafe fn init() {
    let (boot_root, flags) = Cr3::read();
    let root = pmm::alloc_zeroed_table().expect("no frame for the kernel root table");

    // SAFETY:
    // Both roots are valid page-table frames inside the physical window.
    unsafe {
        let boot_table = &*table_at(boot_root);
        let table = &mut *table_at(root);
        for (index, entry) in boot_table.iter().enumerate() {
            if !entry.is_unused() {
                table[index].set_addr(entry.addr(), entry.flags());
            }
        }
        table[RECURSIVE_INDEX].set_frame(root, TABLE_FLAGS);
    }

    KERNEL_ROOT.store(root.start_address().as_u64(), Ordering::Release);

    // SAFETY:
    // The new root maps a superset of the boot root (plus recursion), so
    // execution continues seamlessly.
    unsafe {
        Cr3::write(root, flags);
    }

    serial_println!(
        "[vmm] kernel address space at {:#x}, recursive slot {}",
        root.start_address(),
        RECURSIVE_INDEX
    );
}

/// The kernel root table.
///
/// # Panics
///
/// Panics if paging is not initialized yet.
#[must_use]
pub fn kernel_root() -> PhysFrame {
    let addr = KERNEL_ROOT.load(Ordering::Acquire);
    assert!(addr != 0, "paging not initialized");
    PhysFrame::containing_address(PhysAddr::new(addr))
}

/// Number of pages currently mapped in kernel space.
#[must_use]
pub fn mapped_pages() -> u64 {
    MAPPED_PAGES.load(Ordering::Relaxed)
}

/// Split a 2 MiB huge entry into a fresh table of 512 small pages that
/// cover the same physical range with the same flags.
///
/// # Safety
///
/// `entry` must be a present huge PD-level entry reachable from a live
/// root; the caller holds the table lock.
unsafe fn split_huge_page(
    entry: &mut x86_64::structures::paging::page_table::PageTableEntry,
    user: bool,
) -> Result<(), MapError> {
    let table_frame = pmm::alloc_zeroed_table().ok_or(MapError::FrameExhausted)?;
    let base = entry.addr();
    let mut flags = entry.flags();
    flags.remove(PageTableFlags::HUGE_PAGE);
    if user {
        // A split on the user path stamps every resulting leaf.
        flags.insert(PageTableFlags::USER_ACCESSIBLE);
    }

    // SAFETY:
    // Freshly allocated table frame, accessed through the physical window.
    let table = unsafe { &mut *table_at(table_frame) };
    for (index, sub_entry) in table.iter_mut().enumerate() {
        sub_entry.set_addr(base + (index * PAGE_SIZE) as u64, flags);
    }

    let parent_flags = if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        USER_TABLE_FLAGS
    } else {
        TABLE_FLAGS
    };
    entry.set_frame(table_frame, parent_flags);

    // The old translation may be cached at any granularity.
    tlb::flush_all();
    Ok(())
}

/// Walk `root` down to the page-table level for `virt`, creating missing
/// tables and splitting 2 MiB pages on the way.
///
/// With `user` set, every intermediate entry is stamped user-accessible;
/// intermediate tables that were cloned from kernel space (present but not
/// user-accessible) are copied into private frames first, so the kernel
/// originals never become reachable from ring 3.
unsafe fn walk_create(
    root: PhysFrame,
    virt: VirtAddr,
    user: bool,
) -> Result<*mut PageTable, MapError> {
    let indices = [
        usize::from(virt.p4_index()),
        usize::from(virt.p3_index()),
        usize::from(virt.p2_index()),
    ];
    let table_flags = if user { USER_TABLE_FLAGS } else { TABLE_FLAGS };

    let mut table = table_at(root);
    for (level, &index) in indices.iter().enumerate() {
        // SAFETY:
        // `table` always points at a valid table frame in the window.
        let entry = unsafe { &mut (&mut *table)[index] };

        if entry.is_unused() {
            let frame = pmm::alloc_zeroed_table().ok_or(MapError::FrameExhausted)?;
            entry.set_frame(frame, table_flags);
        } else if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            match level {
                // A 1 GiB mapping above a 4 KiB request cannot be split.
                1 => {
                    serial_println!(
                        "[vmm] refusing to split 1 GiB page over {:#x}",
                        virt.as_u64()
                    );
                    return Err(MapError::GiantHugeParent);
                }
                // SAFETY: present huge PD entry under the table lock.
                _ => unsafe { split_huge_page(entry, user)? },
            }
            if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
            }
        } else if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
            // SAFETY: copying a whole table frame into a private one.
            unsafe {
                let private = pmm::alloc_zeroed_table().ok_or(MapError::FrameExhausted)?;
                core::ptr::copy_nonoverlapping(
                    table_at(PhysFrame::containing_address(entry.addr())),
                    table_at(private),
                    1,
                );
                entry.set_frame(private, table_flags);
            }
        }

        table = table_at(PhysFrame::containing_address(entry.addr()));
    }

    Ok(table)
}

/// Map one 4 KiB page in kernel space. An existing mapping is overwritten
/// in place (an "update"); only genuinely new mappings bump the counter.
pub fn map(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MapError> {
    interrupts::without_interrupts(|| {
        let _guard = TABLE_LOCK.lock();

        // SAFETY: kernel root is live; lock held.
        let table = unsafe { walk_create(kernel_root(), virt, false)? };
        let index = usize::from(virt.p1_index());

        // SAFETY: leaf table pointer produced by the walk above.
        let entry = unsafe { &mut (&mut *table)[index] };
        if entry.is_unused() {
            MAPPED_PAGES.fetch_add(1, Ordering::Relaxed);
        }
        entry.set_addr(phys, flags | PageTableFlags::PRESENT);

        flush_one(virt);
        Ok(())
    })
}

/// Remove a 4 KiB mapping from kernel space. Returns false when the
/// address was not mapped.
pub fn unmap(virt: VirtAddr) -> bool {
    interrupts::without_interrupts(|| {
        let _guard = TABLE_LOCK.lock();

        let Some(leaf) = walk_lookup(kernel_root(), virt) else {
            return false;
        };
        // SAFETY: the lookup returned a live leaf entry.
        let entry = unsafe { &mut *leaf };
        if entry.is_unused() {
            return false;
        }
        entry.set_unused();
        MAPPED_PAGES.fetch_sub(1, Ordering::Relaxed);
        flush_one(virt);
        true
    })
}

/// Raw pointer to the leaf entry for `virt`, if all intermediate levels
/// are present and small. Huge mappings yield `None` here; `translate`
/// handles them separately.
fn walk_lookup(
    root: PhysFrame,
    virt: VirtAddr,
) -> Option<*mut x86_64::structures::paging::page_table::PageTableEntry> {
    let indices = [
        usize::from(virt.p4_index()),
        usize::from(virt.p3_index()),
        usize::from(virt.p2_index()),
    ];

    let mut table = table_at(root);
    for &index in &indices {
        // SAFETY: valid table frame in the window.
        let entry = unsafe { &(&*table)[index] };
        if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return None;
        }
        table = table_at(PhysFrame::containing_address(entry.addr()));
    }

    // SAFETY: `table` is the final-level table.
    Some(unsafe { &mut (&mut *table)[usize::from(virt.p1_index())] })
}

/// Translate a virtual address through the currently active root.
/// Returns `None` for unmapped addresses; huge pages resolve to the
/// offset within their large frame.
#[must_use]
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    interrupts::without_interrupts(|| {
        let (root, _) = Cr3::read();
        let indices = [
            usize::from(virt.p4_index()),
            usize::from(virt.p3_index()),
            usize::from(virt.p2_index()),
            usize::from(virt.p1_index()),
        ];

        let mut table = table_at(root);
        for (level, &index) in indices.iter().enumerate() {
            // SAFETY: valid table frame in the window.
            let entry = unsafe { &(&*table)[index] };
            if entry.is_unused() {
                return None;
            }
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                // Level 1 = 1 GiB entry, level 2 = 2 MiB entry.
                let chunk = if level == 1 { 1 << 30 } else { 1 << 21 };
                let offset = virt.as_u64() & (chunk - 1);
                return Some(entry.addr() + offset);
            }
            if level == 3 {
                return Some(entry.addr() + u64::from(virt.page_offset()));
            }
            table = table_at(PhysFrame::containing_address(entry.addr()));
        }
        None
    })
}

/// Map a contiguous range page by page. On failure every page mapped by
/// this call is unmapped again before the error is returned.
pub fn map_range(
    virt: VirtAddr,
    phys: PhysAddr,
    size: usize,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    let pages = size.div_ceil(PAGE_SIZE);
    for page in 0..pages {
        let offset = (page * PAGE_SIZE) as u64;
        if let Err(error) = map(virt + offset, phys + offset, flags) {
            for undo in 0..page {
                unmap(virt + (undo * PAGE_SIZE) as u64);
            }
            return Err(error);
        }
    }
    Ok(())
}

/// Unmap a contiguous range page by page.
pub fn unmap_range(virt: VirtAddr, size: usize) {
    let pages = size.div_ceil(PAGE_SIZE);
    for page in 0..pages {
        unmap(virt + (page * PAGE_SIZE) as u64);
    }
}

/// Invalidate the TLB entry for one address.
pub fn flush_one(virt: VirtAddr) {
    tlb::flush(virt);
}

/// Invalidate the whole TLB.
pub fn flush_all() {
    tlb::flush_all();
}

/// Create a fresh user address space: a new root whose kernel-side slots
/// alias the kernel root, with the user window and recursion private.
pub fn create_address_space() -> Option<PhysFrame> {
    interrupts::without_interrupts(|| {
        let _guard = TABLE_LOCK.lock();
        let root = pmm::alloc_zeroed_table()?;

        // SAFETY: both roots are valid table frames in the window.
        unsafe {
            let kernel_table = &*table_at(kernel_root());
            let table = &mut *table_at(root);
            for (index, entry) in kernel_table.iter().enumerate() {
                let in_user_window = (USER_PML4_FIRST..=USER_PML4_LAST).contains(&index);
                if !entry.is_unused() && !in_user_window && index != RECURSIVE_INDEX {
                    table[index].set_addr(entry.addr(), entry.flags());
                }
            }
            table[RECURSIVE_INDEX].set_frame(root, TABLE_FLAGS);
        }
        Some(root)
    })
}

/// Free every table frame reachable through the user window of `root`,
/// then the root itself. Huge leaves are skipped: their data frames are
/// not owned by the paging manager. Data frames of small leaves are the
/// caller's to free beforehand (see [`for_each_user_frame`]).
pub fn destroy_address_space(root: PhysFrame) {
    interrupts::without_interrupts(|| {
        let _guard = TABLE_LOCK.lock();

        // SAFETY: `root` was produced by `create_address_space`.
        let table = unsafe { &mut *table_at(root) };
        for index in USER_PML4_FIRST..=USER_PML4_LAST {
            let entry = &mut table[index];
            if entry.is_unused() {
                continue;
            }
            free_table_tree(PhysFrame::containing_address(entry.addr()), 3);
            entry.set_unused();
        }
        pmm::free_one(root);
    });
}

/// Recursively free the table frames below `frame`. `levels_left` counts
/// the table levels below this one (3 for a PDPT).
fn free_table_tree(frame: PhysFrame, levels_left: usize) {
    // SAFETY: reachable table frame, accessed through the window.
    let table = unsafe { &*table_at(frame) };
    if levels_left > 1 {
        for entry in table.iter() {
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            free_table_tree(
                PhysFrame::containing_address(entry.addr()),
                levels_left - 1,
            );
        }
    }
    pmm::free_one(frame);
}

/// Invoke `f` with every data frame mapped through the user window of
/// `root`. Used by process teardown to return user memory to the frame
/// allocator before the address space itself is destroyed.
pub fn for_each_user_frame(root: PhysFrame, f: &mut dyn FnMut(PhysFrame)) {
    interrupts::without_interrupts(|| {
        let _guard = TABLE_LOCK.lock();

        // SAFETY: `root` was produced by `create_address_space`.
        let table = unsafe { &*table_at(root) };
        for index in USER_PML4_FIRST..=USER_PML4_LAST {
            let entry = &table[index];
            if !entry.is_unused() {
                visit_leaf_frames(PhysFrame::containing_address(entry.addr()), 3, f);
            }
        }
    });
}

fn visit_leaf_frames(frame: PhysFrame, levels_left: usize, f: &mut dyn FnMut(PhysFrame)) {
    // SAFETY: reachable table frame, accessed through the window.
    let table = unsafe { &*table_at(frame) };
    for entry in table.iter() {
        if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            continue;
        }
        if levels_left == 1 {
            f(PhysFrame::containing_address(entry.addr()));
        } else {
            visit_leaf_frames(
                PhysFrame::containing_address(entry.addr()),
                levels_left - 1,
                f,
            );
        }
    }
}

/// Map one user-accessible page into `root`. The target must lie inside
/// the user window; the user bit is added to the leaf automatically.
pub fn map_user(
    root: PhysFrame,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    if !is_user_address(virt.as_u64()) {
        return Err(MapError::NotUserAddress);
    }

    interrupts::without_interrupts(|| {
        let _guard = TABLE_LOCK.lock();

        // SAFETY: `root` is a live address-space root; lock held.
        let table = unsafe { walk_create(root, virt, true)? };
        let index = usize::from(virt.p1_index());

        // SAFETY: leaf table pointer produced by the walk above.
        let entry = unsafe { &mut (&mut *table)[index] };
        entry.set_addr(
            phys,
            flags | PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
        );
        Ok(())
    })
}

/// Whether `addr` lies inside the user window.
#[must_use]
pub const fn is_user_address(addr: u64) -> bool {
    addr >= USER_SPACE_BASE && addr < USER_SPACE_END
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_user_window_bounds() {
        assert!(!is_user_address(0));
        assert!(!is_user_address(USER_SPACE_BASE - 1));
        assert!(is_user_address(USER_SPACE_BASE));
        assert!(is_user_address(USER_SPACE_END - 1));
        assert!(!is_user_address(USER_SPACE_END));
        assert!(
            !is_user_address(0xFFFF_FFFF_0000_0000),
            "Kernel-half addresses are never user addresses."
        );
    }

    #[test_case]
    fn test_user_window_matches_pml4_slots() {
        assert_eq!(USER_SPACE_BASE >> 39, USER_PML4_FIRST as u64);
        assert_eq!((USER_SPACE_END - 1) >> 39, USER_PML4_LAST as u64);
    }
}
