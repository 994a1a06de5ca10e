//! Process model: the PCB table and process lifecycle.
//!
//! Processes live in a fixed arena of [`MAX_PROCESSES`] slots; scheduler
//! links are slot indices into the same arena, never pointers. PID 0 is
//! the idle process, created at init with a permanently ready state and
//! never placed on the run queue.
//!
//! All table access funnels through [`with_table`], which masks
//! interrupts for the duration; on a single CPU that makes the closure a
//! critical section.

use core::cell::UnsafeCell;

use bitflags::bitflags;
use x86_64::instructions::interrupts;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::fs::file::FdTable;
use crate::memory::{paging, pmm};
use crate::{serial_println, time};

mod context;
pub mod scheduler;

/// Capacity of the PCB arena.
pub const MAX_PROCESSES: usize = 64;

/// Bytes of kernel stack per process.
pub const KERNEL_STACK_SIZE: usize = 8192;

/// Characters kept of a process name.
const NAME_LEN: usize = 16;

/// Longest current-working-directory path a process can hold.
pub const MAX_CWD_LEN: usize = 128;

/// Slot of the idle process.
const IDLE_SLOT: usize = 0;

/// Process identifier. Monotonic; never reused even when slots are.
pub type Pid = u64;

/// Entry function of a kernel-side process body.
pub type EntryFn = fn(usize);

/// Lifecycle states of a PCB slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot is empty.
    Unused,
    /// On the run queue (or idle, which is ready without being queued).
    Ready,
    /// Currently executing. Exactly one slot is in this state.
    Running,
    /// Off the queue, waiting for a wake condition.
    Blocked,
    /// Exited; slot and kernel stack are reclaimed on reuse.
    Terminated,
}

bitflags! {
    /// Static and transient properties of a process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        /// Runs in ring 0 and shares the kernel address space.
        const KERNEL = 1 << 0;
        /// The idle process.
        const IDLE = 1 << 1;
        /// Owns a private address space and a ring 3 image.
        const USER = 1 << 2;
        /// Blocked waiting for keyboard input.
        const KEYBOARD_WAIT = 1 << 3;
    }
}

/// Process control block.
pub struct Pcb {
    pub(crate) pid: Pid,
    name: [u8; NAME_LEN],
    name_len: usize,
    pub(crate) state: ProcessState,
    pub(crate) flags: ProcessFlags,
    /// Heap allocation backing the kernel stack; 0 while none is held.
    kstack_base: u64,
    pub(crate) kstack_top: u64,
    /// Saved kernel stack pointer while not running.
    pub(crate) rsp: u64,
    entry: Option<EntryFn>,
    arg: usize,
    pub(crate) slice_remaining: u32,
    pub(crate) total_ticks: u64,
    pub(crate) parent: Pid,
    pub(crate) exit_code: i64,
    /// Tick at which a sleeper becomes ready again; 0 = not sleeping.
    pub(crate) wake_tick: u64,
    /// Physical root of the private address space; 0 = kernel space.
    pub(crate) cr3: u64,
    pub(crate) user_stack_top: u64,
    /// User RSP snapshot across syscalls.
    pub(crate) user_rsp: u64,
    pub(crate) user_code_base: u64,
    pub(crate) user_code_size: u64,
    pub(crate) fds: FdTable,
    cwd: [u8; MAX_CWD_LEN],
    cwd_len: usize,
    /// Run-queue neighbors as arena indices. Non-`None` only while queued.
    pub(super) next: Option<usize>,
    pub(super) prev: Option<usize>,
}

impl Pcb {
    const fn unused() -> Self {
        Self {
            pid: 0,
            name: [0; NAME_LEN],
            name_len: 0,
            state: ProcessState::Unused,
            flags: ProcessFlags::empty(),
            kstack_base: 0,
            kstack_top: 0,
            rsp: 0,
            entry: None,
            arg: 0,
            slice_remaining: 0,
            total_ticks: 0,
            parent: 0,
            exit_code: 0,
            wake_tick: 0,
            cr3: 0,
            user_stack_top: 0,
            user_rsp: 0,
            user_code_base: 0,
            user_code_size: 0,
            fds: FdTable::empty(),
            cwd: [0; MAX_CWD_LEN],
            cwd_len: 0,
            next: None,
            prev: None,
        }
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len;
    }

    /// Process name as UTF-8, best effort.
    #[must_use]
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }

    pub(crate) fn set_cwd(&mut self, path: &str) -> bool {
        let bytes = path.as_bytes();
        if bytes.len() > MAX_CWD_LEN {
            return false;
        }
        self.cwd[..bytes.len()].copy_from_slice(bytes);
        self.cwd_len = bytes.len();
        true
    }

    /// Current working directory of the process.
    #[must_use]
    pub fn cwd(&self) -> &str {
        core::str::from_utf8(&self.cwd[..self.cwd_len]).unwrap_or("/")
    }
}

/// The PCB arena plus scheduler bookkeeping.
pub(crate) struct ProcessTable {
    pub(super) slots: [Pcb; MAX_PROCESSES],
    /// Arena index of the running process.
    pub(super) current: usize,
    pub(super) ready_head: Option<usize>,
    pub(super) ready_tail: Option<usize>,
    next_pid: Pid,
    pub(super) started: bool,
}

impl ProcessTable {
    const fn new() -> Self {
        // A const block would read nicer, but array::from_fn is not const;
        // this is the established pattern for const arena initialization.
        const UNUSED: Pcb = Pcb::unused();
        Self {
            slots: [UNUSED; MAX_PROCESSES],
            current: IDLE_SLOT,
            ready_head: None,
            ready_tail: None,
            next_pid: 1,
            started: false,
        }
    }
}

struct TableCell(UnsafeCell<ProcessTable>);

// SAFETY:
// Single logical CPU; every access goes through `with_table`, which masks
// interrupts for the duration of the borrow.
unsafe impl Sync for TableCell {}

static TABLE: TableCell = TableCell(UnsafeCell::new(ProcessTable::new()));

/// Run `f` with exclusive access to the process table.
///
/// Interrupts are masked while the closure runs, so neither the timer nor
/// any other handler can observe intermediate states.
pub(crate) fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    interrupts::without_interrupts(|| {
        // SAFETY:
        // Interrupts are off and there is one CPU; this is the only live
        // borrow of the table.
        f(unsafe { &mut *TABLE.0.get() })
    })
}

/// Allocate an 8 KiB kernel stack on the heap. Returns (base, top).
fn alloc_kernel_stack() -> Option<(u64, u64)> {
    let base = crate::memory::heap::alloc(KERNEL_STACK_SIZE);
    if base.is_null() {
        return None;
    }
    let base = base as u64;
    Some((base, base + KERNEL_STACK_SIZE as u64))
}

fn free_kernel_stack(base: u64) {
    if base != 0 {
        crate::memory::heap::free(base as *mut u8);
    }
}

/// Create the idle process and install the timer hook.
///
/// The boot context adopts idle's identity: after `init`, `current()`
/// reports PID 0 until [`scheduler::start`] hands control to the first
/// real process.
pub fn init() {
    let (base, top) = alloc_kernel_stack().expect("no memory for the idle stack");

    with_table(|table| {
        assert!(
            table.slots[IDLE_SLOT].state == ProcessState::Unused,
            "process::init called twice"
        );
        let idle = &mut table.slots[IDLE_SLOT];
        idle.pid = 0;
        idle.set_name("idle");
        idle.state = ProcessState::Running;
        idle.flags = ProcessFlags::KERNEL | ProcessFlags::IDLE;
        idle.kstack_base = base;
        idle.kstack_top = top;
        // SAFETY: freshly allocated, aligned stack of sufficient size.
        idle.rsp = unsafe { context::seed_kernel_stack(top) };
        idle.entry = Some(idle_main);
        idle.slice_remaining = scheduler::TIME_SLICE_TICKS;
        idle.fds = FdTable::with_console();
        idle.set_cwd("/");
        table.current = IDLE_SLOT;
    });

    scheduler::init();
}

/// The idle body: halt until the next interrupt, forever.
fn idle_main(_arg: usize) {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Create a ring 0 process. Returns its PID, or `None` when the table or
/// the heap is exhausted.
pub fn create(name: &str, entry: EntryFn, arg: usize) -> Option<Pid> {
    create_with_flags(name, entry, arg, ProcessFlags::KERNEL)
}

/// Create a process with explicit flags; user-space setup fills in the
/// address-space fields afterwards through [`configure_user`].
pub(crate) fn create_with_flags(
    name: &str,
    entry: EntryFn,
    arg: usize,
    flags: ProcessFlags,
) -> Option<Pid> {
    let (base, top) = alloc_kernel_stack()?;

    let pid = with_table(|table| {
        let slot = (0..MAX_PROCESSES).find(|&index| {
            matches!(
                table.slots[index].state,
                ProcessState::Unused | ProcessState::Terminated
            ) && index != IDLE_SLOT
        })?;

        // Lazily reclaim whatever the previous owner left behind.
        free_kernel_stack(table.slots[slot].kstack_base);

        let pid = table.next_pid;
        table.next_pid += 1;

        let parent = table.slots[table.current].pid;
        let fds = table.slots[table.current].fds.clone_for_spawn();
        let cwd_source: alloc::string::String = table.slots[table.current].cwd().into();

        let pcb = &mut table.slots[slot];
        *pcb = Pcb::unused();
        pcb.pid = pid;
        pcb.set_name(name);
        pcb.state = ProcessState::Ready;
        pcb.flags = flags;
        pcb.kstack_base = base;
        pcb.kstack_top = top;
        // SAFETY: freshly allocated, aligned stack of sufficient size.
        pcb.rsp = unsafe { context::seed_kernel_stack(top) };
        pcb.entry = Some(entry);
        pcb.arg = arg;
        pcb.slice_remaining = scheduler::TIME_SLICE_TICKS;
        pcb.parent = parent;
        pcb.fds = fds;
        pcb.set_cwd(&cwd_source);

        scheduler::enqueue(table, slot);
        Some(pid)
    });

    if pid.is_none() {
        free_kernel_stack(base);
    }
    pid
}

/// Fill in the user-mode fields of a freshly created process.
pub(crate) fn configure_user(
    pid: Pid,
    cr3: PhysFrame,
    code_base: u64,
    code_size: u64,
    stack_top: u64,
) {
    with_table(|table| {
        let slot = slot_of(table, pid).expect("configure_user: no such process");
        let pcb = &mut table.slots[slot];
        pcb.cr3 = cr3.start_address().as_u64();
        pcb.user_code_base = code_base;
        pcb.user_code_size = code_size;
        pcb.user_stack_top = stack_top;
    });
}

fn slot_of(table: &ProcessTable, pid: Pid) -> Option<usize> {
    (0..MAX_PROCESSES).find(|&index| {
        table.slots[index].pid == pid && table.slots[index].state != ProcessState::Unused
    })
}

/// Terminate the calling process. Never returns.
///
/// The kernel stack is *not* freed here: the scheduler still runs on it
/// until the switch completes. It is reclaimed when the slot is reused.
pub fn exit(code: i64) -> ! {
    interrupts::disable();

    let (cr3, mut fds) = with_table(|table| {
        let pcb = &mut table.slots[table.current];
        serial_println!("[process] pid {} ({}) exits with {}", pcb.pid, pcb.name(), code);
        pcb.state = ProcessState::Terminated;
        pcb.exit_code = code;
        pcb.wake_tick = 0;
        let cr3 = pcb.cr3;
        pcb.cr3 = 0;
        (cr3, core::mem::replace(&mut pcb.fds, FdTable::empty()))
    });

    fds.release();

    if cr3 != 0 {
        let root = PhysFrame::containing_address(PhysAddr::new(cr3));
        // Leave the dying address space before tearing it down; the
        // kernel-side mappings are identical in the kernel root.
        let (_, cr3_flags) = Cr3::read();
        // SAFETY:
        // The kernel root maps everything this code path touches.
        unsafe {
            Cr3::write(paging::kernel_root(), cr3_flags);
        }
        paging::for_each_user_frame(root, &mut pmm::free_one);
        paging::destroy_address_space(root);
    }

    scheduler::schedule();
    unreachable!("terminated process was scheduled again");
}

/// Voluntarily give up the CPU, keeping the process ready.
pub fn yield_now() {
    interrupts::without_interrupts(|| {
        scheduler::schedule();
    });
}

/// Block the calling process until [`unblock`] (or a wake condition)
/// readies it again.
pub fn block() {
    interrupts::without_interrupts(|| {
        with_table(|table| {
            let current = table.current;
            table.slots[current].state = ProcessState::Blocked;
        });
        scheduler::schedule();
    });
}

/// Ready a blocked process. No-op for any other state.
pub fn unblock(pid: Pid) {
    with_table(|table| {
        if let Some(slot) = slot_of(table, pid) {
            if table.slots[slot].state == ProcessState::Blocked {
                table.slots[slot].wake_tick = 0;
                table.slots[slot].flags.remove(ProcessFlags::KEYBOARD_WAIT);
                table.slots[slot].state = ProcessState::Ready;
                scheduler::enqueue(table, slot);
            }
        }
    });
}

/// Sleep for at least `ticks` timer ticks.
pub fn sleep_ticks(ticks: u64) {
    if ticks == 0 {
        yield_now();
        return;
    }
    interrupts::without_interrupts(|| {
        with_table(|table| {
            let current = table.current;
            table.slots[current].wake_tick = time::ticks() + ticks;
            table.slots[current].state = ProcessState::Blocked;
        });
        scheduler::schedule();
    });
}

/// Ready every sleeper whose wake tick has passed. Driven by the timer.
pub fn wake_sleeping(now: u64) {
    with_table(|table| wake_sleeping_locked(table, now));
}

pub(super) fn wake_sleeping_locked(table: &mut ProcessTable, now: u64) {
    for slot in 0..MAX_PROCESSES {
        let pcb = &table.slots[slot];
        if pcb.state == ProcessState::Blocked && pcb.wake_tick != 0 && pcb.wake_tick <= now {
            table.slots[slot].wake_tick = 0;
            table.slots[slot].state = ProcessState::Ready;
            scheduler::enqueue(table, slot);
        }
    }
}

/// Block the caller until the keyboard delivers input.
///
/// Before the scheduler runs there is nothing to switch to; in that case
/// wait for the interrupt right here.
pub fn wait_for_keyboard() {
    if !scheduler::is_started() {
        x86_64::instructions::hlt();
        return;
    }
    interrupts::without_interrupts(|| {
        with_table(|table| {
            let current = table.current;
            table.slots[current].flags.insert(ProcessFlags::KEYBOARD_WAIT);
            table.slots[current].state = ProcessState::Blocked;
        });
        scheduler::schedule();
    });
}

/// Ready every process blocked on keyboard input. Called from the
/// keyboard interrupt handler.
pub fn notify_keyboard() {
    with_table(|table| {
        for slot in 0..MAX_PROCESSES {
            if table.slots[slot].state == ProcessState::Blocked
                && table.slots[slot].flags.contains(ProcessFlags::KEYBOARD_WAIT)
            {
                table.slots[slot].flags.remove(ProcessFlags::KEYBOARD_WAIT);
                table.slots[slot].state = ProcessState::Ready;
                scheduler::enqueue(table, slot);
            }
        }
    });
}

/// PID of the running process.
#[must_use]
pub fn current_pid() -> Pid {
    with_table(|table| table.slots[table.current].pid)
}

/// Entry function and argument of the running process. Used once by the
/// entry wrapper on a process's first run.
pub(crate) fn current_entry() -> (EntryFn, usize) {
    with_table(|table| {
        let pcb = &table.slots[table.current];
        (pcb.entry.expect("process has no entry"), pcb.arg)
    })
}

/// Copyable summary of one PCB, for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: Pid,
    /// Lifecycle state.
    pub state: ProcessState,
    /// Static flags.
    pub flags: ProcessFlags,
    /// Parent pid.
    pub parent: Pid,
    /// Exit code, meaningful once terminated.
    pub exit_code: i64,
    /// Ticks of CPU time consumed.
    pub total_ticks: u64,
}

/// Look up a process by PID.
#[must_use]
pub fn lookup(pid: Pid) -> Option<ProcessInfo> {
    with_table(|table| {
        slot_of(table, pid).map(|slot| {
            let pcb = &table.slots[slot];
            ProcessInfo {
                pid: pcb.pid,
                state: pcb.state,
                flags: pcb.flags,
                parent: pcb.parent,
                exit_code: pcb.exit_code,
                total_ticks: pcb.total_ticks,
            }
        })
    })
}

/// Number of PCBs currently in `state`.
#[must_use]
pub fn count_in(state: ProcessState) -> usize {
    with_table(|table| {
        table
            .slots
            .iter()
            .filter(|pcb| pcb.state == state)
            .count()
    })
}

/// Run `f` against the current PCB. The closure runs with interrupts
/// masked; keep it short.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Pcb) -> R) -> R {
    with_table(|table| {
        let current = table.current;
        f(&mut table.slots[current])
    })
}

/// Support for integration tests: force lifecycle transitions on PCBs
/// without running them. Not part of the kernel's own control flow.
#[doc(hidden)]
pub mod testing {
    use super::{scheduler, slot_of, with_table, Pid, ProcessState};

    /// Put a process into `state`, unlinking it from the ready queue
    /// first when necessary.
    pub fn force_state(pid: Pid, state: ProcessState) {
        with_table(|table| {
            if let Some(slot) = slot_of(table, pid) {
                if table.slots[slot].state == ProcessState::Ready {
                    scheduler::dequeue(table, slot);
                }
                table.slots[slot].state = state;
            }
        });
    }

    /// Park a process as a sleeper with the given wake tick.
    pub fn force_sleep(pid: Pid, wake_tick: u64) {
        with_table(|table| {
            if let Some(slot) = slot_of(table, pid) {
                if table.slots[slot].state == ProcessState::Ready {
                    scheduler::dequeue(table, slot);
                }
                table.slots[slot].state = ProcessState::Blocked;
                table.slots[slot].wake_tick = wake_tick;
            }
        });
    }
}
