//! User space support.
//!
//! User processes are statically embedded flat binaries. Spawning one
//! builds a private address space, copies the image into fresh frames
//! mapped read-only at [`USER_CODE_BASE`] (W^X: the stack is writable,
//! the code is not), and creates a process whose ring 0 entry drops to
//! ring 3 with `iretq`. From then on the program talks to the kernel
//! exclusively through the `syscall` instruction.

use core::arch::naked_asm;

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use crate::memory::{paging, phys_to_virt, pmm, PAGE_SIZE};
use crate::process::{self, Pid, ProcessFlags};
use crate::{gdt, serial_println};

/// Base virtual address where user program code is loaded.
pub const USER_CODE_BASE: u64 = paging::USER_SPACE_BASE;

/// Top of the user-mode stack (stack grows downward).
pub const USER_STACK_TOP: u64 = paging::USER_SPACE_BASE + 0x80_0000;

/// Size of the user-mode stack in bytes (16 KiB).
pub const USER_STACK_SIZE: u64 = 4096 * 4;

/// Bottom of the user-mode stack.
pub const USER_STACK_BOTTOM: u64 = USER_STACK_TOP - USER_STACK_SIZE;

/// Demo program, hand-assembled for the fast-syscall ABI (number in
/// `rax`, arguments in `rdi`/`rsi`/`rdx`). It writes a greeting to file
/// descriptor 1, naps, and exits with code 0. The source shape lives in
/// `user_programs/hello`.
#[rustfmt::skip]
pub const DEMO_PROGRAM: &[u8] = &[
    0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00,       // mov rax, 1   (write)
    0x48, 0xc7, 0xc7, 0x01, 0x00, 0x00, 0x00,       // mov rdi, 1   (stdout)
    0x48, 0x8d, 0x35, 0x2b, 0x00, 0x00, 0x00,       // lea rsi, [rip + msg]
    0x48, 0xc7, 0xc2, 0x12, 0x00, 0x00, 0x00,       // mov rdx, 18
    0x0f, 0x05,                                     // syscall
    0x48, 0xc7, 0xc0, 0x05, 0x00, 0x00, 0x00,       // mov rax, 5   (sleep)
    0x48, 0xc7, 0xc7, 0x1e, 0x00, 0x00, 0x00,       // mov rdi, 30  (ms)
    0x0f, 0x05,                                     // syscall
    0x48, 0xc7, 0xc0, 0x00, 0x00, 0x00, 0x00,       // mov rax, 0   (exit)
    0x48, 0xc7, 0xc7, 0x00, 0x00, 0x00, 0x00,       // mov rdi, 0
    0x0f, 0x05,                                     // syscall
    0xeb, 0xfe,                                     // jmp $
    // msg: "hello from ring 3\n"
    b'h', b'e', b'l', b'l', b'o', b' ', b'f', b'r', b'o', b'm', b' ',
    b'r', b'i', b'n', b'g', b' ', b'3', b'\n',
];

/// Spawn a ring 3 process running an embedded flat binary.
///
/// Returns the new PID, or `None` when frames, address-space tables, or
/// PCB slots ran out (everything allocated so far is released again).
pub fn spawn(name: &str, binary: &[u8]) -> Option<Pid> {
    let root = paging::create_address_space()?;

    match build_user_image(root, binary) {
        Ok(()) => {}
        Err(()) => {
            release_address_space(root);
            return None;
        }
    }

    let Some(pid) = process::create_with_flags(name, user_process_entry, 0, ProcessFlags::USER)
    else {
        release_address_space(root);
        return None;
    };
    process::configure_user(pid, root, USER_CODE_BASE, binary.len() as u64, USER_STACK_TOP);

    serial_println!(
        "[user] spawned pid {} ({} bytes of code at {:#x})",
        pid,
        binary.len(),
        USER_CODE_BASE
    );
    Some(pid)
}

/// Map the binary (read-only) and the stack (writable, zeroed) into a
/// fresh address space, copying code through the physical window.
fn build_user_image(root: PhysFrame, binary: &[u8]) -> Result<(), ()> {
    let code_pages = binary.len().div_ceil(PAGE_SIZE);

    for page in 0..code_pages {
        let frame = pmm::alloc_one().ok_or(())?;

        let start = page * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(binary.len());
        let chunk = &binary[start..end];
        let dest: *mut u8 = phys_to_virt(frame.start_address()).as_mut_ptr();

        // SAFETY:
        // The frame is freshly allocated and visible through the physical
        // window; the chunk fits one page and the tail is zeroed.
        unsafe {
            core::ptr::copy_nonoverlapping(chunk.as_ptr(), dest, chunk.len());
            core::ptr::write_bytes(dest.add(chunk.len()), 0, PAGE_SIZE - chunk.len());
        }

        // No WRITABLE bit: the program cannot rewrite its own code.
        let virt = VirtAddr::new(USER_CODE_BASE + (start as u64));
        if paging::map_user(root, virt, frame.start_address(), PageTableFlags::empty()).is_err() {
            pmm::free_one(frame);
            return Err(());
        }
    }

    let stack_pages = (USER_STACK_SIZE as usize) / PAGE_SIZE;
    for page in 0..stack_pages {
        let frame = pmm::alloc_one().ok_or(())?;
        let dest: *mut u8 = phys_to_virt(frame.start_address()).as_mut_ptr();

        // SAFETY: fresh frame behind the physical window.
        unsafe {
            core::ptr::write_bytes(dest, 0, PAGE_SIZE);
        }

        let virt = VirtAddr::new(USER_STACK_BOTTOM + (page * PAGE_SIZE) as u64);
        if paging::map_user(root, virt, frame.start_address(), PageTableFlags::WRITABLE).is_err() {
            pmm::free_one(frame);
            return Err(());
        }
    }

    Ok(())
}

/// Return every frame of a partially built address space and the space
/// itself to the allocators.
fn release_address_space(root: PhysFrame) {
    paging::for_each_user_frame(root, &mut pmm::free_one);
    paging::destroy_address_space(root);
}

/// Ring 0 entry of every user process: the scheduler has already switched
/// to the process's address space and kernel stack, so all that is left
/// is the drop to ring 3.
fn user_process_entry(_arg: usize) {
    let (rip, rsp) = process::with_current(|pcb| (pcb.user_code_base, pcb.user_stack_top));
    let user_cs = u64::from(gdt::user_code_selector().0);
    let user_ss = u64::from(gdt::user_data_selector().0);

    // SAFETY:
    // The code and stack were mapped user-accessible by `spawn`; the
    // selectors are the ring 3 pair from the GDT; the TSS RSP0 and the
    // syscall stack were set by the scheduler when this process was
    // switched in.
    unsafe {
        enter_ring3(rip, rsp, user_cs, user_ss);
    }
}

/// Build an `iretq` frame and drop to ring 3.
///
/// # Safety
///
/// `rip`/`rsp` must be user-mapped in the active address space and the
/// selectors must be the GDT's ring 3 pair. Does not return.
#[unsafe(naked)]
unsafe extern "C" fn enter_ring3(_rip: u64, _rsp: u64, _cs: u64, _ss: u64) -> ! {
    // System V AMD64: rdi = rip, rsi = rsp, rdx = cs, rcx = ss.
    naked_asm!(
        // Data segments carry the user selector; in long mode only the
        // iretq-popped CS/SS matter, but stale kernel selectors in
        // ds/es would survive into ring 3 otherwise.
        "mov rax, rcx",
        "mov ds, ax",
        "mov es, ax",

        "push rcx",          // SS
        "push rsi",          // RSP
        "pushfq",
        "pop rax",
        "or rax, 0x200",     // IF set: interrupts run in ring 3
        "push rax",          // RFLAGS
        "push rdx",          // CS
        "push rdi",          // RIP
        "iretq",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_user_layout_is_page_aligned_and_disjoint() {
        assert_eq!(USER_CODE_BASE % 4096, 0, "Code base must be page aligned.");
        assert_eq!(
            USER_STACK_BOTTOM % 4096,
            0,
            "Stack bottom must be page aligned."
        );
        assert_eq!(
            USER_STACK_BOTTOM + USER_STACK_SIZE,
            USER_STACK_TOP,
            "Stack bounds must be consistent."
        );
        assert!(
            USER_CODE_BASE + 0x10_0000 < USER_STACK_BOTTOM,
            "Code region must sit well below the stack."
        );
    }

    #[test_case]
    fn test_user_layout_is_inside_the_user_window() {
        assert!(paging::is_user_address(USER_CODE_BASE));
        assert!(paging::is_user_address(USER_STACK_TOP - 1));
    }

    #[test_case]
    fn test_demo_program_fits_one_page() {
        assert!(DEMO_PROGRAM.len() <= 4096, "Demo must stay a single page.");
    }
}
