//! Task State Segment: privilege-transition stack (RSP0) and the IST
//! stacks for double fault / NMI / machine check, none of which may run on
//! a stack that might itself be the cause of the fault.

use lazy_static::lazy_static;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const IST_STACK_SIZE: usize = 16 * 1024;
pub const PRIVILEGE_STACK_SIZE: usize = 16 * 1024;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;
pub const MACHINE_CHECK_IST_INDEX: u16 = 2;

#[repr(align(16))]
struct Stack([u8; IST_STACK_SIZE]);

impl Stack {
    const fn new() -> Self {
        Stack([0; IST_STACK_SIZE])
    }
}

static mut DOUBLE_FAULT_STACK: Stack = Stack::new();
static mut NMI_STACK: Stack = Stack::new();
static mut MACHINE_CHECK_STACK: Stack = Stack::new();
static mut PRIVILEGE_STACK: Stack = Stack::new();

lazy_static! {
    /// Shared across CPUs for now; a per-CPU TSS array is the natural
    /// extension once `percpu` grows beyond a single bring-up CPU.
    pub static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::from_ptr(unsafe { &DOUBLE_FAULT_STACK }) + IST_STACK_SIZE;
        tss.interrupt_stack_table[NMI_IST_INDEX as usize] =
            VirtAddr::from_ptr(unsafe { &NMI_STACK }) + IST_STACK_SIZE;
        tss.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize] =
            VirtAddr::from_ptr(unsafe { &MACHINE_CHECK_STACK }) + IST_STACK_SIZE;
        tss.privilege_stack_table[0] =
            VirtAddr::from_ptr(unsafe { &PRIVILEGE_STACK }) + PRIVILEGE_STACK_SIZE;
        tss
    };
}

pub unsafe fn init_tss() {
    let _ = &*TSS;
}

/// Point RSP0 at `stack_top`, the kernel stack of the thread about to run.
/// Called from the scheduler's context-switch path so a subsequent
/// syscall/interrupt from that thread lands on its own kernel stack.
///
/// # Safety
/// Must be called with interrupts disabled; `stack_top` must be the top of
/// a live, writable kernel stack.
pub unsafe fn set_kernel_stack(stack_top: VirtAddr) {
    let tss = &TSS as *const TaskStateSegment as *mut TaskStateSegment;
    (*tss).privilege_stack_table[0] = stack_top;
}

pub fn get_kernel_stack() -> VirtAddr {
    TSS.privilege_stack_table[0]
}

#[cfg(debug_assertions)]
pub fn validate_tss() -> Result<(), &'static str> {
    let checks = [
        TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize],
        TSS.interrupt_stack_table[NMI_IST_INDEX as usize],
        TSS.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize],
        TSS.privilege_stack_table[0],
    ];
    for stack in checks {
        if stack.is_null() {
            return Err("TSS stack entry is null");
        }
        if stack.as_u64() % 16 != 0 {
            return Err("TSS stack entry is not 16-byte aligned");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacks_are_sized_and_aligned() {
        let stack = Stack::new();
        assert_eq!(core::mem::size_of::<Stack>(), IST_STACK_SIZE);
        assert_eq!(&stack as *const _ as usize % 16, 0);
    }

    #[test]
    fn tss_entries_are_populated() {
        assert!(!TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize].is_null());
        assert!(!TSS.interrupt_stack_table[NMI_IST_INDEX as usize].is_null());
        assert!(!TSS.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize].is_null());
        assert!(!TSS.privilege_stack_table[0].is_null());
    }
}
