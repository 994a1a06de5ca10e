//! Context-switch trampolines and initial kernel-stack frames.
//!
//! The contract between [`seed_kernel_stack`] and the trampolines is
//! exact: a fresh stack holds the entry wrapper's address on top of six
//! zeroed slots for the callee-saved registers, so the first "return" on
//! behalf of a new process lands in [`process_entry_wrapper`].

use core::arch::naked_asm;

use crate::process;

/// Switch kernel stacks: save the callee-saved registers on the outgoing
/// stack, store the outgoing stack pointer through `old_rsp_slot`, load
/// the incoming stack pointer, and restore.
///
/// # Safety
///
/// `new_rsp` must point at a stack layout produced by this function or by
/// [`seed_kernel_stack`]. Interrupts must be masked across the call; the
/// incoming context re-enables them on its own path (`iretq`, the entry
/// wrapper, or an interrupt-state restore).
#[unsafe(naked)]
pub(super) unsafe extern "C" fn context_switch(_old_rsp_slot: *mut u64, _new_rsp: u64) {
    // System V AMD64: rdi = old_rsp_slot, rsi = new_rsp.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First switch into the scheduler world: same as [`context_switch`] minus
/// the outgoing save. The boot stack is abandoned.
///
/// # Safety
///
/// Same stack-layout contract as [`context_switch`]; never returns to the
/// caller.
#[unsafe(naked)]
pub(super) unsafe extern "C" fn context_switch_first(_new_rsp: u64) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Shape a fresh kernel stack so the trampoline's restore sequence runs
/// the entry wrapper. Returns the initial saved stack pointer.
///
/// # Safety
///
/// `stack_top` must be the 16-byte aligned top of a writable stack of at
/// least seven words.
pub(super) unsafe fn seed_kernel_stack(stack_top: u64) -> u64 {
    // Drop one word so the wrapper starts with the stack alignment the
    // ABI guarantees after a call.
    let mut sp = (stack_top - 8) as *mut u64;

    // SAFETY:
    // Seven in-bounds writes below the adjusted top.
    unsafe {
        sp = sp.sub(1);
        sp.write(process_entry_wrapper as *const () as u64);
        for _ in 0..6 {
            sp = sp.sub(1);
            sp.write(0);
        }
    }
    sp as u64
}

/// First code every process runs: enable interrupts (the switch path runs
/// masked), call the entry function, and exit with code 0 if it returns.
extern "C" fn process_entry_wrapper() -> ! {
    let (entry, arg) = process::current_entry();
    x86_64::instructions::interrupts::enable();
    entry(arg);
    process::exit(0);
}
