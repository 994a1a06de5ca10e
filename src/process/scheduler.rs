//! Round-robin scheduler.
//!
//! The run queue is a strict FIFO of arena indices threaded through the
//! PCBs' `next`/`prev` fields. The timer interrupt drives preemption: the
//! registered tick handler only does bookkeeping and raises the
//! reschedule flag, and the interrupt stub performs the in-place
//! `schedule` after the end-of-interrupt has been sent.

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::{context, with_table, wake_sleeping_locked, ProcessFlags, ProcessState, ProcessTable};
use crate::{gdt, interrupts as irq, serial_println, syscall, time};

/// Timer ticks a process may run before it is preempted.
pub const TIME_SLICE_TICKS: u32 = 5;

/// Set when the current time slice ran out (or on explicit request); the
/// timer interrupt stub converts it into a `schedule` call.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Becomes true once `start` has handed control to the first process.
static STARTED: AtomicBool = AtomicBool::new(false);

/// Hook the scheduler into the timer interrupt.
pub(super) fn init() {
    irq::register_irq_handler(irq::TIMER_IRQ, timer_handler);
}

/// Whether the scheduler has taken over from the boot context.
#[must_use]
pub fn is_started() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// Ask for a reschedule at the next opportunity.
pub fn request_resched() {
    NEED_RESCHED.store(true, Ordering::Release);
}

/// The registered timer IRQ handler: advance time, wake sleepers, and
/// charge the running process.
fn timer_handler(_irq: u8) {
    let now = time::on_tick();
    tick(now);
}

/// Per-tick scheduler bookkeeping. Runs in interrupt context with
/// interrupts masked.
pub fn tick(now: u64) {
    with_table(|table| {
        wake_sleeping_locked(table, now);

        let ready = table.ready_head.is_some();
        let current = table.current;
        let pcb = &mut table.slots[current];
        pcb.total_ticks += 1;
        if pcb.slice_remaining > 0 {
            pcb.slice_remaining -= 1;
        }

        if pcb.slice_remaining == 0 {
            if pcb.flags.contains(ProcessFlags::IDLE) {
                // Idle's slice refills in place; it only steps aside when
                // somebody is actually waiting.
                pcb.slice_remaining = TIME_SLICE_TICKS;
                if ready {
                    request_resched();
                }
            } else {
                request_resched();
            }
        }
    });
}

/// Consume the reschedule flag; switch if it was raised. Called by the
/// timer interrupt stub after the end-of-interrupt.
pub fn preempt_if_requested() {
    if !is_started() {
        NEED_RESCHED.store(false, Ordering::Release);
        return;
    }
    if NEED_RESCHED.swap(false, Ordering::AcqRel) {
        schedule();
    }
}

/// Append a ready process to the queue tail. Idle is never queued.
pub(super) fn enqueue(table: &mut ProcessTable, slot: usize) {
    if table.slots[slot].flags.contains(ProcessFlags::IDLE) {
        return;
    }
    debug_assert!(
        table.slots[slot].next.is_none() && table.slots[slot].prev.is_none(),
        "process already queued"
    );

    table.slots[slot].next = None;
    table.slots[slot].prev = table.ready_tail;
    match table.ready_tail {
        Some(tail) => table.slots[tail].next = Some(slot),
        None => table.ready_head = Some(slot),
    }
    table.ready_tail = Some(slot);
}

/// Unlink a process from anywhere in the queue.
pub(super) fn dequeue(table: &mut ProcessTable, slot: usize) {
    let (prev, next) = (table.slots[slot].prev, table.slots[slot].next);
    match prev {
        Some(prev) => table.slots[prev].next = next,
        None if table.ready_head == Some(slot) => table.ready_head = next,
        None => return,
    }
    match next {
        Some(next) => table.slots[next].prev = prev,
        None => table.ready_tail = prev,
    }
    table.slots[slot].next = None;
    table.slots[slot].prev = None;
}

/// Pop the queue head; the idle slot when the queue is empty.
pub(super) fn pick_next(table: &mut ProcessTable) -> usize {
    match table.ready_head {
        Some(head) => {
            dequeue(table, head);
            head
        }
        None => super::IDLE_SLOT,
    }
}

/// Number of processes on the ready queue (excluding idle).
#[must_use]
pub fn ready_count() -> usize {
    with_table(|table| {
        let mut count = 0;
        let mut cursor = table.ready_head;
        while let Some(slot) = cursor {
            count += 1;
            cursor = table.slots[slot].next;
        }
        count
    })
}

/// Everything the switch path needs after the table borrow ends.
struct SwitchPlan {
    old_rsp_slot: *mut u64,
    new_rsp: u64,
    new_kstack_top: u64,
    new_cr3: u64,
}

/// Pick the next process and switch to it.
///
/// Must be entered with interrupts masked. A process that is no longer
/// `Running` (blocked or terminated) is not re-enqueued. When the pick is
/// the current process, only its slice is refilled.
pub fn schedule() {
    let plan = with_table(|table| {
        let next = pick_next(table);
        let current = table.current;

        if next == current {
            table.slots[current].slice_remaining = TIME_SLICE_TICKS;
            return None;
        }

        // Nothing better to run: an empty queue hands back idle, but a
        // still-running process beats switching to it.
        if next == super::IDLE_SLOT
            && table.slots[current].state == ProcessState::Running
            && !table.slots[current].flags.contains(ProcessFlags::IDLE)
        {
            table.slots[current].slice_remaining = TIME_SLICE_TICKS;
            return None;
        }

        if table.slots[current].state == ProcessState::Running {
            table.slots[current].state = ProcessState::Ready;
            table.slots[current].slice_remaining = TIME_SLICE_TICKS;
            enqueue(table, current);
        }

        table.slots[next].state = ProcessState::Running;
        table.slots[next].slice_remaining = TIME_SLICE_TICKS;
        table.current = next;

        Some(SwitchPlan {
            old_rsp_slot: &raw mut table.slots[current].rsp,
            new_rsp: table.slots[next].rsp,
            new_kstack_top: table.slots[next].kstack_top,
            new_cr3: table.slots[next].cr3,
        })
    });

    let Some(plan) = plan else {
        return;
    };

    switch_cpu_state(&plan);

    // SAFETY:
    // Both stack pointers obey the trampoline contract: the outgoing slot
    // is this process's PCB field, the incoming value was produced by a
    // previous save or by stack seeding. Interrupts are masked.
    unsafe {
        context::context_switch(plan.old_rsp_slot, plan.new_rsp);
    }
    // Execution resumes here when this process is scheduled again.
}

/// Update the TSS ring 0 stack, the syscall entry stack, and CR3 for the
/// incoming process.
fn switch_cpu_state(plan: &SwitchPlan) {
    gdt::set_kernel_stack(x86_64::VirtAddr::new(plan.new_kstack_top));
    syscall::set_kernel_stack(plan.new_kstack_top);

    // Kernel processes keep whatever address space is live; a zero root
    // must never reach CR3.
    if plan.new_cr3 != 0 {
        let root = PhysFrame::containing_address(PhysAddr::new(plan.new_cr3));
        let (active, cr3_flags) = Cr3::read();
        if active != root {
            // SAFETY:
            // The root was built by `create_address_space` and carries all
            // kernel mappings.
            unsafe {
                Cr3::write(root, cr3_flags);
            }
        }
    }
}

/// Hand the CPU to the scheduler. The boot context is abandoned; from
/// here on only PCB kernel stacks execute.
///
/// # Panics
///
/// Panics when called twice.
pub fn start() -> ! {
    x86_64::instructions::interrupts::disable();
    assert!(!is_started(), "scheduler already started");

    let (new_rsp, new_kstack_top, new_cr3) = with_table(|table| {
        table.started = true;

        let next = pick_next(table);
        // The boot context was impersonating idle; idle goes back to
        // ready (unqueued) unless it is the pick itself.
        table.slots[super::IDLE_SLOT].state = ProcessState::Ready;
        table.slots[next].state = ProcessState::Running;
        table.slots[next].slice_remaining = TIME_SLICE_TICKS;
        table.current = next;

        serial_println!(
            "[sched] starting with pid {} ({})",
            table.slots[next].pid,
            table.slots[next].name()
        );
        (
            table.slots[next].rsp,
            table.slots[next].kstack_top,
            table.slots[next].cr3,
        )
    });

    STARTED.store(true, Ordering::Release);

    switch_cpu_state(&SwitchPlan {
        old_rsp_slot: core::ptr::null_mut(),
        new_rsp,
        new_kstack_top,
        new_cr3,
    });

    // SAFETY:
    // The stack was seeded by `seed_kernel_stack`; the entry wrapper
    // re-enables interrupts.
    unsafe { context::context_switch_first(new_rsp) }
}
