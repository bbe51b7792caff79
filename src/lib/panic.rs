//! Kernel panic handler.
//!
//! Per the kernel's error-handling policy: assertions that indicate a
//! kernel-bug condition panic immediately with a snapshot of CPU state,
//! rather than unwinding. `panic = "abort"` in both profiles makes that the
//! only option anyway.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static PANICKING: AtomicBool = AtomicBool::new(false);
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn panic_handler(info: &PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        // A panic inside panic handling; skip straight to halting.
        halt();
    }
    let panic_num = PANIC_COUNT.fetch_add(1, Ordering::SeqCst) + 1;

    x86_64::instructions::interrupts::disable();

    let mut serial = crate::arch::x86_64::serial::writer();
    use core::fmt::Write;
    let _ = writeln!(serial, "\n!!! KERNEL PANIC (#{}) !!!", panic_num);
    if let Some(location) = info.location() {
        let _ = writeln!(
            serial,
            "  at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    let _ = writeln!(serial, "  {}", info.message());
    print_registers(&mut serial);

    crate::lib::printk::dump_to_serial();

    halt();
}

fn print_registers(serial: &mut crate::arch::x86_64::serial::SerialWriter) {
    use core::arch::asm;
    use core::fmt::Write;

    let (rax, rbx, rcx, rdx): (u64, u64, u64, u64);
    let (rsi, rdi, rbp, rsp): (u64, u64, u64, u64);
    unsafe {
        asm!("mov {}, rax", out(reg) rax);
        asm!("mov {}, rbx", out(reg) rbx);
        asm!("mov {}, rcx", out(reg) rcx);
        asm!("mov {}, rdx", out(reg) rdx);
        asm!("mov {}, rsi", out(reg) rsi);
        asm!("mov {}, rdi", out(reg) rdi);
        asm!("mov {}, rbp", out(reg) rbp);
        asm!("mov {}, rsp", out(reg) rsp);
    }
    let _ = writeln!(
        serial,
        "  rax={:016x} rbx={:016x} rcx={:016x} rdx={:016x}\n  rsi={:016x} rdi={:016x} rbp={:016x} rsp={:016x}",
        rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp
    );
}

fn halt() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

pub fn is_panicking() -> bool {
    PANICKING.load(Ordering::Relaxed)
}
