//! Kernel heap: a first-fit byte allocator with coalescing free blocks.
//!
//! The heap owns a fixed virtual window that starts at
//! [`HEAP_START`] and grows on demand up to [`HEAP_MAX_SIZE`], mapping
//! fresh frames through the paging manager. Every block carries a header
//! with a magic cookie and address-ordered neighbor links; freeing merges
//! adjacent free blocks immediately, so two free neighbors never coexist.
//!
//! The same allocator backs Rust's `alloc` crate through
//! [`GlobalAlloc`], replacing an off-the-shelf allocator crate.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;
use x86_64::{instructions::interrupts, structures::paging::PageTableFlags, VirtAddr};

use super::{align_up, paging, pmm, PAGE_SIZE};
use crate::serial_println;

/// Start address of the heap window.
pub const HEAP_START: usize = 0x_4444_4444_0000;
/// Bytes mapped at init.
pub const HEAP_INITIAL_SIZE: usize = 1024 * 1024;
/// Hard ceiling of the heap window.
pub const HEAP_MAX_SIZE: usize = 32 * 1024 * 1024;
/// Minimum growth step when the free list has no fit.
const HEAP_EXPAND_INCREMENT: usize = 256 * 1024;

/// Cookie stamped into every live header.
const HEAP_MAGIC: u32 = 0x4845_4150;

/// Block payload alignment and size granularity.
const HEAP_ALIGN: usize = 16;
/// Smallest payload a block can carry.
const MIN_PAYLOAD: usize = 32;

const STATE_FREE: u32 = 0;
const STATE_USED: u32 = 1;

/// Header preceding every payload, address-ordered and doubly linked.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    state: u32,
    /// Payload bytes following this header.
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

/// Header size, padded to the payload alignment.
const HEADER_SIZE: usize = align_up(core::mem::size_of::<BlockHeader>(), HEAP_ALIGN);

impl BlockHeader {
    fn payload(&mut self) -> *mut u8 {
        (core::ptr::from_mut(self) as usize + HEADER_SIZE) as *mut u8
    }

    fn is_valid(&self) -> bool {
        self.magic == HEAP_MAGIC && (self.state == STATE_FREE || self.state == STATE_USED)
    }
}

/// Heap statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes of virtual window currently mapped.
    pub total_size: usize,
    /// Payload bytes handed out.
    pub used_bytes: usize,
    /// Payload bytes on the free list.
    pub free_bytes: usize,
    /// Number of blocks, free and used.
    pub blocks: usize,
}

struct KernelHeap {
    head: *mut BlockHeader,
    /// Bytes of the window mapped so far.
    total_size: usize,
    used_bytes: usize,
}

// SAFETY:
// The raw pointers reference the heap window only; access is serialized
// by the surrounding mutex with interrupts masked.
unsafe impl Send for KernelHeap {}

static HEAP: Mutex<KernelHeap> = Mutex::new(KernelHeap {
    head: ptr::null_mut(),
    total_size: 0,
    used_bytes: 0,
});

fn with_heap<R>(f: impl FnOnce(&mut KernelHeap) -> R) -> R {
    interrupts::without_interrupts(|| f(&mut HEAP.lock()))
}

/// Map `size` bytes of fresh frames at the given window offset.
fn map_window(offset: usize, size: usize) -> Result<(), ()> {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    for page in 0..size / PAGE_SIZE {
        let virt = VirtAddr::new((HEAP_START + offset + page * PAGE_SIZE) as u64);
        let Some(frame) = pmm::alloc_one() else {
            // Roll the partial mapping back; the window must stay contiguous.
            for undo in 0..page {
                let virt = VirtAddr::new((HEAP_START + offset + undo * PAGE_SIZE) as u64);
                if let Some(phys) = paging::translate(virt) {
                    pmm::free_one(x86_64::structures::paging::PhysFrame::containing_address(
                        phys,
                    ));
                }
                paging::unmap(virt);
            }
            return Err(());
        };
        if paging::map(virt, frame.start_address(), flags).is_err() {
            pmm::free_one(frame);
            return Err(());
        }
    }
    Ok(())
}

impl KernelHeap {
    /// Lay out the initial window as one giant free block.
    fn init(&mut self) -> Result<(), ()> {
        map_window(0, HEAP_INITIAL_SIZE)?;
        self.total_size = HEAP_INITIAL_SIZE;
        self.head = HEAP_START as *mut BlockHeader;

        // SAFETY:
        // The window was just mapped writable and is exclusively ours.
        unsafe {
            self.head.write(BlockHeader {
                magic: HEAP_MAGIC,
                state: STATE_FREE,
                size: HEAP_INITIAL_SIZE - HEADER_SIZE,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
        }
        Ok(())
    }

    /// Whether `ptr` could be a payload pointer of this heap.
    fn contains(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        addr >= HEAP_START + HEADER_SIZE && addr < HEAP_START + self.total_size
    }

    /// Split `block` so it carries exactly `size` payload bytes, if the
    /// remainder can still hold a header plus the minimum payload. The
    /// remainder becomes a free block.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block with `size <= block.size`.
    unsafe fn split(&mut self, block: *mut BlockHeader, size: usize) {
        // SAFETY: caller contract.
        let header = unsafe { &mut *block };
        let remainder = header.size - size;
        if remainder < HEADER_SIZE + MIN_PAYLOAD {
            return;
        }

        let rest = (block as usize + HEADER_SIZE + size) as *mut BlockHeader;
        // SAFETY: `rest` lies inside the mapped window, past the shrunk payload.
        unsafe {
            rest.write(BlockHeader {
                magic: HEAP_MAGIC,
                state: STATE_FREE,
                size: remainder - HEADER_SIZE,
                prev: block,
                next: header.next,
            });
            if let Some(next) = header.next.as_mut() {
                next.prev = rest;
            }
        }
        header.size = size;
        header.next = rest;
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.head.is_null() {
            return ptr::null_mut();
        }
        let size = align_up(size, HEAP_ALIGN).max(MIN_PAYLOAD);

        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: list links only reference live headers in the window.
            let (state, block_size, next) =
                unsafe { ((*cursor).state, (*cursor).size, (*cursor).next) };
            if state == STATE_FREE && block_size >= size {
                // SAFETY: free block with sufficient payload.
                unsafe {
                    self.split(cursor, size);
                    let header = &mut *cursor;
                    header.state = STATE_USED;
                    self.used_bytes += header.size;
                    return header.payload();
                }
            }
            cursor = next;
        }

        if self.expand(size).is_err() {
            return ptr::null_mut();
        }
        self.alloc(size)
    }

    /// Grow the window by at least `min` payload bytes, merging the new
    /// tail block into a trailing free block if there is one.
    fn expand(&mut self, min: usize) -> Result<(), ()> {
        let wanted = align_up(min + HEADER_SIZE, PAGE_SIZE).max(HEAP_EXPAND_INCREMENT);
        let growth = wanted.min(HEAP_MAX_SIZE - self.total_size);
        if growth < min + HEADER_SIZE {
            serial_println!("[heap] window exhausted at {} bytes", self.total_size);
            return Err(());
        }

        map_window(self.total_size, growth)?;

        let tail_block = (HEAP_START + self.total_size) as *mut BlockHeader;
        let mut last = self.head;
        // SAFETY: walking live headers.
        unsafe {
            while !(*last).next.is_null() {
                last = (*last).next;
            }
            tail_block.write(BlockHeader {
                magic: HEAP_MAGIC,
                state: STATE_FREE,
                size: growth - HEADER_SIZE,
                prev: last,
                next: ptr::null_mut(),
            });
            (*last).next = tail_block;
            self.total_size += growth;
            if (*last).state == STATE_FREE {
                self.merge_with_next(last);
            }
        }
        Ok(())
    }

    /// Fold `block.next` into `block`.
    ///
    /// # Safety
    ///
    /// Both `block` and its successor must be valid; the successor is
    /// consumed and must not be referenced afterwards.
    unsafe fn merge_with_next(&mut self, block: *mut BlockHeader) {
        // SAFETY: caller contract.
        unsafe {
            let next = (*block).next;
            (*block).size += HEADER_SIZE + (*next).size;
            (*block).next = (*next).next;
            if let Some(after) = (*next).next.as_mut() {
                after.prev = block;
            }
            // Poison the dead header so stale pointers fail validation.
            (*next).magic = 0;
        }
    }

    /// Header belonging to `ptr`, following the aligned-allocation
    /// back-pointer when the direct header does not validate.
    fn header_for(&mut self, ptr: *mut u8) -> Option<*mut BlockHeader> {
        if !self.contains(ptr) {
            return None;
        }
        let direct = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: inside the mapped window.
        if unsafe { (*direct).is_valid() } {
            return Some(direct);
        }

        // Aligned allocations stash the original payload pointer in the
        // word right before the aligned address.
        // SAFETY: inside the mapped window.
        let original = unsafe { *(ptr as *const *mut u8).sub(1) };
        if !self.contains(original) {
            return None;
        }
        let fallback = (original as usize - HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: inside the mapped window.
        unsafe { (*fallback).is_valid().then_some(fallback) }
    }

    fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(block) = self.header_for(ptr) else {
            serial_println!("[heap] free of invalid pointer {:p} ignored", ptr);
            return;
        };

        // SAFETY: `header_for` validated the header.
        let header = unsafe { &mut *block };
        if header.state == STATE_FREE {
            serial_println!("[heap] double free of {:p} ignored", ptr);
            return;
        }

        header.state = STATE_FREE;
        self.used_bytes -= header.size;

        // SAFETY: neighbors are live headers; merges consume the successor.
        unsafe {
            let next = header.next;
            if !next.is_null() && (*next).state == STATE_FREE {
                self.merge_with_next(block);
            }
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).state == STATE_FREE {
                self.merge_with_next(prev);
            }
        }
    }

    fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        let Some(block) = self.header_for(ptr) else {
            serial_println!("[heap] realloc of invalid pointer {:p} ignored", ptr);
            return ptr::null_mut();
        };

        let rounded = align_up(new_size, HEAP_ALIGN).max(MIN_PAYLOAD);
        // SAFETY: validated header.
        let header = unsafe { &mut *block };

        if header.size >= rounded {
            return ptr;
        }

        // SAFETY: neighbor links are valid; merge consumes the successor.
        unsafe {
            let next = header.next;
            if !next.is_null()
                && (*next).state == STATE_FREE
                && header.size + HEADER_SIZE + (*next).size >= rounded
            {
                self.used_bytes -= header.size;
                self.merge_with_next(block);
                self.split(block, rounded);
                self.used_bytes += (*block).size;
                return (*block).payload();
            }
        }

        let new_ptr = self.alloc(new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both payloads are live and at least `header.size` /
        // `new_size` bytes long; regions cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, header.size.min(new_size));
        }
        self.free(ptr);
        new_ptr
    }

    fn stats(&self) -> HeapStats {
        let mut free_bytes = 0;
        let mut blocks = 0;
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: list links only reference live headers.
            let header = unsafe { &*cursor };
            blocks += 1;
            if header.state == STATE_FREE {
                free_bytes += header.size;
            }
            cursor = header.next;
        }
        HeapStats {
            total_size: self.total_size,
            used_bytes: self.used_bytes,
            free_bytes,
            blocks,
        }
    }

    /// Walk the whole list checking every structural invariant. Returns
    /// false (after logging) on the first violation.
    fn validate(&self) -> bool {
        let mut cursor = self.head;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut accounted = 0usize;

        while !cursor.is_null() {
            // SAFETY: links are only followed after the previous header
            // validated.
            let header = unsafe { &*cursor };
            if !header.is_valid() {
                serial_println!("[heap] corrupt header at {:p}", cursor);
                return false;
            }
            if header.prev != prev {
                serial_println!("[heap] broken prev link at {:p}", cursor);
                return false;
            }
            if !prev.is_null() {
                // SAFETY: `prev` validated on the previous iteration.
                let prev_header = unsafe { &*prev };
                if prev_header.state == STATE_FREE && header.state == STATE_FREE {
                    serial_println!("[heap] adjacent free blocks at {:p}", cursor);
                    return false;
                }
            }
            accounted += HEADER_SIZE + header.size;
            prev = cursor;
            cursor = header.next;
        }

        if accounted != self.total_size {
            serial_println!(
                "[heap] accounted {} bytes of a {} byte window",
                accounted,
                self.total_size
            );
            return false;
        }
        true
    }
}

/// Map the initial heap window and install the free list.
pub fn init() -> Result<(), ()> {
    with_heap(KernelHeap::init)
}

/// Allocate `size` bytes, 16-byte aligned. Zero-sized requests and
/// exhaustion yield a null pointer.
pub fn alloc(size: usize) -> *mut u8 {
    with_heap(|heap| heap.alloc(size))
}

/// Allocate and zero.
pub fn alloc_zeroed(size: usize) -> *mut u8 {
    let ptr = alloc(size);
    if !ptr.is_null() {
        // SAFETY: freshly allocated block of at least `size` bytes.
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }
    }
    ptr
}

/// Allocate with an alignment above the default. The original payload
/// pointer is stored right before the returned address so [`free`] can
/// find the header again.
pub fn alloc_aligned(size: usize, alignment: usize) -> *mut u8 {
    assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    if alignment <= HEAP_ALIGN {
        return alloc(size);
    }
    if size == 0 {
        return ptr::null_mut();
    }

    let raw = alloc(size + alignment + core::mem::size_of::<usize>());
    if raw.is_null() {
        return ptr::null_mut();
    }

    let aligned = align_up(raw as usize + core::mem::size_of::<usize>(), alignment) as *mut u8;
    // SAFETY: the over-allocation guarantees room for the back-pointer
    // below `aligned` and `size` bytes at it.
    unsafe {
        *(aligned as *mut *mut u8).sub(1) = raw;
    }
    aligned
}

/// Free a pointer from [`alloc`], [`alloc_zeroed`], or [`alloc_aligned`].
/// Null, foreign, and double frees are logged no-ops.
pub fn free(ptr: *mut u8) {
    with_heap(|heap| heap.free(ptr));
}

/// Resize an allocation, moving it if the block cannot grow in place.
pub fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    with_heap(|heap| heap.realloc(ptr, new_size))
}

/// Grow the window by at least `min` payload bytes. The allocator expands
/// on demand; this is for callers that want to pre-grow.
pub fn expand(min: usize) -> bool {
    with_heap(|heap| heap.expand(min).is_ok())
}

/// Heap counters.
#[must_use]
pub fn stats() -> HeapStats {
    with_heap(|heap| heap.stats())
}

/// Structural check of the whole block list. Diagnostic only.
#[must_use]
pub fn validate() -> bool {
    with_heap(|heap| KernelHeap::validate(heap))
}

/// Adapter exposing the kernel heap to Rust's `alloc` crate.
struct GlobalHeap;

// SAFETY:
// Delegates to the lock-protected allocator above; the layout contract of
// `GlobalAlloc` maps directly onto `alloc`/`alloc_aligned`/`free`.
unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            alloc(layout.size())
        } else {
            alloc_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            alloc_zeroed(layout.size())
        } else {
            let ptr = alloc_aligned(layout.size(), layout.align());
            if !ptr.is_null() {
                // SAFETY: freshly allocated block of `layout.size()` bytes.
                unsafe {
                    ptr::write_bytes(ptr, 0, layout.size());
                }
            }
            ptr
        }
    }
}

#[global_allocator]
static ALLOCATOR: GlobalHeap = GlobalHeap;
