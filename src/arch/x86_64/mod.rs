//! x86_64 architecture glue: the boot sequence, CPU/interrupt setup, and
//! the handful of raw instructions (`rdmsr`/`wrmsr`/`invlpg`) the mm and
//! sched subsystems build on. Paging itself lives in `mm::pgtable`, not
//! here — this module stops at "the CPU can take interrupts and run Rust".

pub mod apic;
pub mod context;
pub mod cpu;
pub mod gdt;
pub mod hpet;
pub mod idt;
pub mod percpu;
pub mod pic;
pub mod serial;
pub mod smp;
pub mod trapframe;
pub mod tsc;
pub mod tss;

use x86_64::instructions::interrupts;

#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

#[inline]
pub fn halt_loop() -> ! {
    loop {
        interrupts::disable();
        halt();
    }
}

#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

/// Runs `f` with interrupts disabled, restoring the prior state afterward.
/// Grounds `sync::lock_class`'s spin-mutex critical sections.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    interrupts::without_interrupts(f)
}

#[inline]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    let (high, low): (u32, u32);
    core::arch::asm!(
        "rdmsr",
        in("ecx") msr,
        out("eax") low,
        out("edx") high,
        options(nomem, nostack, preserves_flags)
    );
    ((high as u64) << 32) | (low as u64)
}

#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    core::arch::asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") low,
        in("edx") high,
        options(nomem, nostack, preserves_flags)
    );
}

#[inline]
pub fn invlpg(addr: u64) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Brings the BSP from "bootloader handed us control" to "can take
/// interrupts, has a console, has per-CPU data". Everything after this is
/// the four core subsystems' own init paths (`mm::*::init`, `sched::init`, ...).
///
/// # Safety
/// Must run exactly once, early, with interrupts disabled and a valid stack.
pub unsafe fn arch_early_init() -> Result<(), &'static str> {
    disable_interrupts();

    gdt::init_gdt();
    tss::init_tss();
    idt::init_idt();
    cpu::enable_cpu_features()?;
    serial::init_serial()?;

    pic::init();
    pic::disable();
    apic::init()?;
    tsc::init();
    smp::init_bsp();

    crate::info!("x86_64: gdt/tss/idt/cpu/serial/apic/tsc online");
    Ok(())
}
