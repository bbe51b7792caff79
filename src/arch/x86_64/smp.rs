//! CPU bring-up, logical level only. Discovering APIC IDs via the ACPI MADT
//! and running the real-mode INIT-SIPI-SIPI trampoline are both out of
//! scope (ACPI discovery and device-adjacent register pokes are out of
//! scope); what the scheduler actually needs is "N CPUs exist, each with a
//! `CpuLocal`", so that's what this provides. A real bring-up path would
//! plug into `init_cpu` exactly the way the BSP path below does.

use x86_64::VirtAddr;

static mut BSP_STACK: [u8; super::percpu::KERNEL_STACK_SIZE] = [0; super::percpu::KERNEL_STACK_SIZE];

/// # Safety
/// Must run once, early, on the bootstrap processor.
pub unsafe fn init_bsp() {
    let stack_top = VirtAddr::from_ptr(core::ptr::addr_of!(BSP_STACK)) + super::percpu::KERNEL_STACK_SIZE as u64;
    super::percpu::init_cpu(0, super::apic::local_apic_id(), stack_top);
}

/// Number of CPUs the scheduler should plan runqueues for. Fixed at 1 (BSP
/// only) until a real discovery/bring-up path exists; `cpu_count` from
/// `BootInfo` is intentionally not trusted here for the same reason.
pub fn cpu_count() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    #[test]
    fn reports_at_least_the_bsp() {
        assert!(super::cpu_count() >= 1);
    }
}
