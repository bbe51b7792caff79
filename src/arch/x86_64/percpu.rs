//! Per-CPU data reached through the GS segment base. `self_ptr` must stay
//! the first field: `mov rax, gs:[0]` is how `CpuLocal::current` gets its
//! pointer without touching any lock.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::VirtAddr;

const IA32_GS_BASE: u32 = 0xC0000101;

pub const KERNEL_STACK_SIZE: usize = 64 * 1024;
pub const MAX_CPUS: usize = 32;

#[derive(Debug, Default)]
#[repr(C)]
pub struct CpuStats {
    pub interrupts: u64,
    pub context_switches: u64,
    pub idle_ticks: u64,
}

/// One instance per CPU, pointed to by that CPU's GS base.
#[repr(C, align(64))]
pub struct CpuLocal {
    self_ptr: *const CpuLocal,
    pub cpu_id: u32,
    pub apic_id: u32,
    pub kernel_stack_top: u64,
    /// Index into the scheduler's thread table of whatever is running here,
    /// 0 meaning "idle thread" (the per-CPU idle cleanup servicer).
    pub current_thread: AtomicU64,
    pub stats: CpuStats,
}

unsafe impl Sync for CpuLocal {}

impl CpuLocal {
    fn new(cpu_id: u32, apic_id: u32, kernel_stack_top: VirtAddr) -> Self {
        CpuLocal {
            self_ptr: core::ptr::null(),
            cpu_id,
            apic_id,
            kernel_stack_top: kernel_stack_top.as_u64(),
            current_thread: AtomicU64::new(0),
            stats: CpuStats::default(),
        }
    }

    #[inline]
    pub fn current() -> &'static CpuLocal {
        unsafe {
            let ptr: *const CpuLocal;
            core::arch::asm!(
                "mov {}, gs:[0]",
                out(reg) ptr,
                options(pure, nomem, nostack, preserves_flags)
            );
            &*ptr
        }
    }

    pub fn current_thread(&self) -> u64 {
        self.current_thread.load(Ordering::Acquire)
    }

    pub fn set_current_thread(&self, id: u64) {
        self.current_thread.store(id, Ordering::Release);
    }
}

static mut CPU_LOCALS: [Option<CpuLocal>; MAX_CPUS] = [const { None }; MAX_CPUS];

/// # Safety
/// Must run exactly once per CPU during boot, after the GDT is loaded and
/// before any code reads `CpuLocal::current`.
pub unsafe fn init_cpu(cpu_id: u32, apic_id: u32, kernel_stack_top: VirtAddr) {
    let slot = &mut CPU_LOCALS[cpu_id as usize];
    *slot = Some(CpuLocal::new(cpu_id, apic_id, kernel_stack_top));
    let cpu_local = slot.as_mut().unwrap();
    cpu_local.self_ptr = cpu_local as *const CpuLocal;
    super::wrmsr(IA32_GS_BASE, cpu_local as *const CpuLocal as u64);
}

/// Looks up the APIC ID of an already-initialized CPU, for code (the
/// scheduler's `sched_cpu`) that needs to target an IPI at a specific
/// logical CPU rather than the caller's own.
pub fn apic_id_for_cpu(cpu_id: u32) -> Option<u32> {
    unsafe { (*core::ptr::addr_of!(CPU_LOCALS))[cpu_id as usize].as_ref().map(|c| c.apic_id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_ptr_is_first_field() {
        let cl = CpuLocal::new(0, 0, VirtAddr::new(0x1000));
        let base = &cl as *const CpuLocal as usize;
        let field = &cl.self_ptr as *const _ as usize;
        assert_eq!(base, field);
    }
}
