//! The `syscall`/`sysretq` trampoline.
//!
//! On `syscall` the CPU leaves us on the *user* stack with the return RIP
//! in `rcx` and the user RFLAGS in `r11`, interrupts masked by the SFMASK
//! programming. The trampoline parks the user stack pointer in a scratch
//! slot, pivots onto the current process's kernel stack, materializes the
//! full register snapshot there, and calls the Rust dispatcher. The
//! return path undoes all of it and drops back to ring 3 atomically.
//!
//! The scratch slot is a plain static: this kernel runs one logical CPU,
//! and every access happens with interrupts masked.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicU64, Ordering};

/// Kernel stack top of the running process; rewritten on every context
/// switch. Read by the trampoline before any Rust code can run.
pub(super) static KERNEL_STACK_TOP: AtomicU64 = AtomicU64::new(0);

/// Parking slot for the user RSP between `syscall` and the stack pivot
/// (and again between the frame pop and `sysretq`).
static USER_RSP_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Publish the kernel stack used by the next syscall entry.
pub fn set_kernel_stack(top: u64) {
    KERNEL_STACK_TOP.store(top, Ordering::Release);
}

/// User RSP captured by the most recent syscall entry. Valid while
/// interrupts are still masked in the dispatch prologue.
pub(super) fn scratch_user_rsp() -> u64 {
    USER_RSP_SCRATCH.load(Ordering::Acquire)
}

/// Fast-syscall entry point programmed into the LSTAR MSR.
///
/// # Register layout on the kernel stack after all pushes
///
/// ```text
/// rsp + 0x00 : r15
/// rsp + 0x08 : r14
/// rsp + 0x10 : r13
/// rsp + 0x18 : r12
/// rsp + 0x20 : r10  (arg4)
/// rsp + 0x28 : r9
/// rsp + 0x30 : r8   (arg5)
/// rsp + 0x38 : rdx  (arg3)
/// rsp + 0x40 : rsi  (arg2)
/// rsp + 0x48 : rdi  (arg1)
/// rsp + 0x50 : rbp
/// rsp + 0x58 : rbx
/// rsp + 0x60 : rax  (syscall number; result on the way out)
/// rsp + 0x68 : r11  (user RFLAGS)
/// rsp + 0x70 : rcx  (user RIP)
/// rsp + 0x78 : user RSP
/// ```
#[unsafe(naked)]
pub(super) unsafe extern "C" fn syscall_entry() {
    // SAFETY:
    // This naked function manages the entire stack pivot and register
    // save/restore. Interrupts stay masked (SFMASK) until the Rust
    // dispatcher re-enables them on the kernel stack.
    naked_asm!(
        // Park the user stack and pivot onto the kernel stack.
        "mov [{scratch}], rsp",
        "mov rsp, [{kstack}]",

        // Build the register snapshot.
        "push qword ptr [{scratch}]",
        "push rcx",
        "push r11",
        "push rax",
        "push rbx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push r8",
        "push r9",
        "push r10",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Shuffle the user ABI (rax, rdi, rsi, rdx, r10, r8) into the
        // C ABI (rdi, rsi, rdx, rcx, r8, r9). r10 stands in for the
        // rcx slot that `syscall` itself clobbered.
        "mov r9, r8",
        "mov r8, r10",
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",

        "call {dispatch}",

        // Deliver the result into the saved rax slot and unwind. From
        // here to `sysretq` interrupts must stay off: the scratch slot
        // and the stack pivot are not reentrant.
        "cli",
        "mov [rsp + 0x60], rax",

        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rbx",
        "pop rax",
        "pop r11",
        "pop rcx",
        "pop qword ptr [{scratch}]",
        "mov rsp, [{scratch}]",

        "sysretq",

        scratch = sym USER_RSP_SCRATCH,
        kstack = sym KERNEL_STACK_TOP,
        dispatch = sym super::dispatch,
    );
}
