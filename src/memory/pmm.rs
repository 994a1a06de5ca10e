//! Physical frame allocator.
//!
//! One bit per 4 KiB frame, bit set = used. The bitmap is sized for the
//! largest supported machine and starts fully set, so memory the boot map
//! never declares usable can never be handed out. Allocation is first fit
//! from a moving hint with a single wrap-around.

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use spin::Mutex;
use x86_64::{
    instructions::interrupts,
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

use super::{align_down, align_up, PAGE_SIZE};
use crate::serial_println;

/// Largest physical memory the bitmap covers.
const MAX_PHYS_MEMORY: usize = 32 * 1024 * 1024 * 1024;

/// Number of frames covered by the bitmap.
const FRAME_COUNT: usize = MAX_PHYS_MEMORY / PAGE_SIZE;

const WORD_BITS: usize = 64;

/// Bitmap words for the full allocator.
const BITMAP_WORDS: usize = FRAME_COUNT / WORD_BITS;

/// Everything below 1 MiB (BIOS structures, real-mode leftovers) stays
/// reserved even if the memory map calls it usable.
const RESERVED_LOW_FRAMES: usize = 0x10_0000 / PAGE_SIZE;

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmmStats {
    /// Usable frames discovered at init.
    pub total_frames: usize,
    /// Frames currently free.
    pub free_frames: usize,
    /// Usable bytes discovered at init.
    pub total_memory: usize,
    /// Bytes currently free.
    pub free_memory: usize,
}

/// Fixed-size used/free bitmap with a first-fit hint.
///
/// Generic over the word count so the allocation logic is testable on a
/// small instance; the kernel uses one [`BITMAP_WORDS`]-sized static.
struct Bitmap<const WORDS: usize> {
    words: [u64; WORDS],
    /// Lowest index that might be free; moves forward on allocation and
    /// backward on free.
    hint: usize,
    free_frames: usize,
    total_frames: usize,
}

impl<const WORDS: usize> Bitmap<WORDS> {
    const fn new() -> Self {
        Self {
            words: [u64::MAX; WORDS],
            hint: 0,
            free_frames: 0,
            total_frames: 0,
        }
    }

    const fn capacity(&self) -> usize {
        WORDS * WORD_BITS
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize) {
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    fn clear(&mut self, index: usize) {
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    /// Mark one frame used, if it was free. Returns whether it was free.
    fn take(&mut self, index: usize) -> bool {
        if self.is_set(index) {
            return false;
        }
        self.set(index);
        self.free_frames -= 1;
        true
    }

    /// Release one frame. Returns false on double free.
    fn release(&mut self, index: usize) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.clear(index);
        self.free_frames += 1;
        if index < self.hint {
            self.hint = index;
        }
        true
    }

    /// First-fit scan for a single free frame, starting at the hint and
    /// wrapping once.
    fn find_free(&self) -> Option<usize> {
        let limit = self.capacity();
        (self.hint..limit)
            .chain(0..self.hint)
            .find(|&index| !self.is_set(index))
    }

    /// Scan for `count` consecutive free frames.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let limit = self.capacity();
        let mut run = 0;
        let mut start = 0;
        for index in 0..limit {
            if self.is_set(index) {
                run = 0;
            } else {
                if run == 0 {
                    start = index;
                }
                run += 1;
                if run == count {
                    return Some(start);
                }
            }
        }
        None
    }

    fn alloc_one(&mut self) -> Option<usize> {
        let index = self.find_free()?;
        self.set(index);
        self.free_frames -= 1;
        self.hint = index + 1;
        Some(index)
    }

    fn alloc_contiguous(&mut self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let start = self.find_free_run(count)?;
        for index in start..start + count {
            self.set(index);
        }
        self.free_frames -= count;
        if start <= self.hint {
            self.hint = start + count;
        }
        Some(start)
    }
}

static PMM: Mutex<Bitmap<BITMAP_WORDS>> = Mutex::new(Bitmap::new());

fn with_pmm<R>(f: impl FnOnce(&mut Bitmap<BITMAP_WORDS>) -> R) -> R {
    interrupts::without_interrupts(|| f(&mut PMM.lock()))
}

fn frame_index(frame: PhysFrame) -> usize {
    (frame.start_address().as_u64() as usize) / PAGE_SIZE
}

fn frame_at(index: usize) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new((index * PAGE_SIZE) as u64))
}

/// Populate the bitmap from the boot memory map.
///
/// All bits start set; only regions the map declares usable are cleared,
/// with their bounds aligned inward to page boundaries. The low 1 MiB is
/// re-reserved afterwards regardless of what the map says. The kernel
/// image, the boot page tables, and the boot information are already
/// non-usable regions in the map and therefore stay reserved.
pub fn init(memory_map: &MemoryMap) {
    with_pmm(|pmm| {
        for region in memory_map.iter() {
            if region.region_type != MemoryRegionType::Usable {
                continue;
            }

            let start = align_up(region.range.start_addr() as usize, PAGE_SIZE);
            let end = align_down(region.range.end_addr() as usize, PAGE_SIZE);
            if start >= end {
                continue;
            }

            for index in (start / PAGE_SIZE)..(end / PAGE_SIZE).min(pmm.capacity()) {
                if pmm.is_set(index) {
                    pmm.clear(index);
                    pmm.free_frames += 1;
                    pmm.total_frames += 1;
                }
            }
        }

        for index in 0..RESERVED_LOW_FRAMES {
            if !pmm.is_set(index) {
                pmm.set(index);
                pmm.free_frames -= 1;
                pmm.total_frames -= 1;
            }
        }

        pmm.hint = RESERVED_LOW_FRAMES;
    });

    let stats = stats();
    serial_println!(
        "[pmm] {} usable frames ({} MiB)",
        stats.total_frames,
        stats.total_memory / (1024 * 1024)
    );
}

/// Allocate a single frame, or `None` on exhaustion.
pub fn alloc_one() -> Option<PhysFrame> {
    with_pmm(Bitmap::alloc_one).map(frame_at)
}

/// Allocate `count` physically contiguous frames, or `None` if no such
/// run exists. Returns the first frame of the run.
pub fn alloc_contiguous(count: usize) -> Option<PhysFrame> {
    with_pmm(|pmm| pmm.alloc_contiguous(count)).map(frame_at)
}

/// Return a frame to the allocator. Double frees are rejected with a
/// diagnostic and leave the bitmap untouched.
pub fn free_one(frame: PhysFrame) {
    let index = frame_index(frame);
    let released = with_pmm(|pmm| pmm.release(index));
    if !released {
        serial_println!(
            "[pmm] double free of frame {:#x} ignored",
            frame.start_address()
        );
    }
}

/// Return a contiguous run to the allocator.
pub fn free_contiguous(frame: PhysFrame, count: usize) {
    for offset in 0..count {
        free_one(frame + offset as u64);
    }
}

/// Mark frames as used without allocating them. Idempotent against frames
/// that are already used.
pub fn reserve(frame: PhysFrame, count: usize) {
    with_pmm(|pmm| {
        let start = frame_index(frame);
        for index in start..start + count {
            pmm.take(index);
        }
    });
}

/// Whether the frame is currently free.
#[must_use]
pub fn is_free(frame: PhysFrame) -> bool {
    let index = frame_index(frame);
    with_pmm(|pmm| !pmm.is_set(index))
}

/// Snapshot of the allocator counters.
#[must_use]
pub fn stats() -> PmmStats {
    with_pmm(|pmm| PmmStats {
        total_frames: pmm.total_frames,
        free_frames: pmm.free_frames,
        total_memory: pmm.total_frames * PAGE_SIZE,
        free_memory: pmm.free_frames * PAGE_SIZE,
    })
}

/// Allocate a frame usable as a page table, i.e. zeroed.
pub(crate) fn alloc_zeroed_table() -> Option<PhysFrame<Size4KiB>> {
    let frame = alloc_one()?;
    let virt = super::phys_to_virt(frame.start_address());

    // SAFETY:
    // The frame was just allocated, is page sized, and is mapped in the
    // physical-memory window.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(free: core::ops::Range<usize>) -> Bitmap<4> {
        let mut bitmap = Bitmap::new();
        for index in free {
            bitmap.clear(index);
            bitmap.free_frames += 1;
            bitmap.total_frames += 1;
        }
        bitmap
    }

    #[test_case]
    fn test_alloc_is_first_fit_from_hint() {
        let mut bitmap = seeded(8..32);
        assert_eq!(bitmap.alloc_one(), Some(8), "Lowest free frame first.");
        assert_eq!(bitmap.alloc_one(), Some(9), "Hint advances past allocations.");
    }

    #[test_case]
    fn test_free_moves_hint_backwards() {
        let mut bitmap = seeded(8..32);
        let a = bitmap.alloc_one().unwrap();
        let _b = bitmap.alloc_one().unwrap();
        assert!(bitmap.release(a), "Frame was allocated, release succeeds.");
        assert_eq!(bitmap.alloc_one(), Some(a), "Freed low frame is reused first.");
    }

    #[test_case]
    fn test_double_release_is_rejected() {
        let mut bitmap = seeded(8..16);
        let a = bitmap.alloc_one().unwrap();
        assert!(bitmap.release(a));
        assert!(!bitmap.release(a), "Second release of a frame must fail.");
        assert_eq!(bitmap.free_frames, 8, "Counter untouched by double free.");
    }

    #[test_case]
    fn test_contiguous_run_skips_holes() {
        let mut bitmap = seeded(8..32);
        bitmap.take(10);
        let start = bitmap.alloc_contiguous(4).unwrap();
        assert_eq!(start, 11, "Run must start after the hole at 10.");
    }

    #[test_case]
    fn test_contiguous_exhaustion_returns_none() {
        let mut bitmap = seeded(8..12);
        assert_eq!(bitmap.alloc_contiguous(8), None, "No 8-frame run exists.");
        assert_eq!(bitmap.free_frames, 4, "Failed allocation changes nothing.");
    }

    #[test_case]
    fn test_free_count_matches_cleared_bits() {
        let mut bitmap = seeded(8..24);
        let _ = bitmap.alloc_contiguous(3);
        let cleared = (0..bitmap.capacity()).filter(|&i| !bitmap.is_set(i)).count();
        assert_eq!(
            bitmap.free_frames, cleared,
            "free_frames must equal the number of cleared bits."
        );
    }
}
