//! GDT and TSS initialization.
//! This module sets up the Global Descriptor Table (GDT) and the Task State Segment (TSS).
//! The descriptor order is load bearing: the user data/code pair sits directly
//! above the TSS so that `sysret` can derive CS and SS from a single base
//! selector programmed into the STAR register.
//!
//! Resulting layout: null (0x00), kernel code (0x08), kernel data (0x10),
//! TSS (0x18, two slots), user data (0x28, RPL 0x2B), user code (0x30, RPL 0x33).

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    PrivilegeLevel, VirtAddr,
};

/// The index of the IST entry for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of the double fault handler stack.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// Size of the boot kernel stack installed as RSP0 until the scheduler
/// takes over and points RSP0 at per-process kernel stacks.
const BOOT_KERNEL_STACK_SIZE: usize = 4096 * 5;

/// The ring 0 stack pointer and the double fault stack live here.
///
/// The scheduler rewrites `privilege_stack_table[0]` on every context
/// switch, so the TSS cannot sit behind an immutable `lazy_static`.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Initialize the Global Descriptor Table (GDT).
pub fn init() {
    GDT.0.load();

    // SAFETY:
    // The GDT is loaded; the selectors reference valid descriptors in it.
    unsafe {
        CS::set_reg(GDT.1.kernel_code_selector);
        SS::set_reg(GDT.1.kernel_data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Point the TSS ring 0 stack at the given kernel stack top.
///
/// Called by the scheduler on every context switch so that interrupts
/// taken in ring 3 land on the running process's own kernel stack.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    // SAFETY:
    // Single CPU; callers run with interrupts masked, so no interrupt can
    // observe a half-written stack pointer.
    unsafe {
        TSS.privilege_stack_table[0] = stack_top;
    }
}

/// Returns the kernel code segment selector.
#[must_use]
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code_selector
}

/// Returns the kernel data segment selector.
#[must_use]
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data_selector
}

/// Returns the user code segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// Returns the user data segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

/// Holds the GDT segment selectors used during initialization, syscall MSR
/// setup, and user mode transitions.
struct Selectors {
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.add_entry(Descriptor::kernel_data_segment());

        // Fill in the static TSS stacks before handing the TSS to the GDT.
        // SAFETY:
        // Runs once, before interrupts are enabled; nothing reads the TSS yet.
        let tss_selector = unsafe {
            TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                static mut STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];

                let stack_start = VirtAddr::from_ptr(&raw const STACK);
                stack_start + DOUBLE_FAULT_STACK_SIZE as u64
            };
            TSS.privilege_stack_table[0] = {
                static mut BOOT_STACK: [u8; BOOT_KERNEL_STACK_SIZE] = [0; BOOT_KERNEL_STACK_SIZE];

                let stack_start = VirtAddr::from_ptr(&raw const BOOT_STACK);
                stack_start + BOOT_KERNEL_STACK_SIZE as u64
            };

            gdt.add_entry(Descriptor::tss_segment(&*(&raw const TSS)))
        };

        // The selectors returned by `add_entry` have RPL=0, so rebuild the
        // user pair with RPL=3 for Ring 3 execution.
        let user_data_entry = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_entry = gdt.add_entry(Descriptor::user_code_segment());

        let user_data_selector =
            SegmentSelector::new(user_data_entry.index(), PrivilegeLevel::Ring3);
        let user_code_selector =
            SegmentSelector::new(user_code_entry.index(), PrivilegeLevel::Ring3);

        (
            gdt,
            Selectors {
                kernel_code_selector,
                kernel_data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The syscall machinery derives user CS/SS from a base selector; the
    /// GDT must place user data exactly below user code for that to work.
    #[test_case]
    fn test_selector_layout_matches_fast_call_contract() {
        assert_eq!(kernel_code_selector().0, 0x08, "kernel code must be 0x08.");
        assert_eq!(kernel_data_selector().0, 0x10, "kernel data must be 0x10.");
        assert_eq!(user_data_selector().0, 0x2B, "user data must be 0x28 | RPL 3.");
        assert_eq!(user_code_selector().0, 0x33, "user code must be 0x30 | RPL 3.");
    }
}
