//! Local APIC: the only facts the core subsystems rely on are "EOI ends an
//! interrupt" and "an IPI reaches another CPU's vector". Register-level
//! xAPIC/x2APIC detail is intentionally the bare minimum needed for those
//! two contracts -- APIC register pokes beyond that are out of scope for
//! the core; only the logical contract matters.

use core::ptr::{read_volatile, write_volatile};
use spin::Mutex;
use x86_64::VirtAddr;

const APIC_BASE_ADDR: u64 = 0xFEE0_0000;
const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SPURIOUS: u32 = 0x0F0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_LVT_LINT0: u32 = 0x350;
const REG_LVT_LINT1: u32 = 0x360;
const REG_LVT_ERROR: u32 = 0x370;
const REG_TIMER_INIT: u32 = 0x380;
const REG_TIMER_DIV: u32 = 0x3E0;

const LVT_MASKED: u32 = 1 << 16;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const ICR_DEST_SHORTHAND_NONE: u32 = 0 << 18;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

struct LocalApic {
    base: VirtAddr,
    apic_id: u32,
}

impl LocalApic {
    unsafe fn read(&self, offset: u32) -> u32 {
        read_volatile((self.base.as_u64() + offset as u64) as *const u32)
    }

    unsafe fn write(&self, offset: u32, value: u32) {
        write_volatile((self.base.as_u64() + offset as u64) as *mut u32, value);
    }

    unsafe fn new() -> Self {
        let base = VirtAddr::new(APIC_BASE_ADDR);
        let mut apic_base = super::rdmsr(IA32_APIC_BASE);
        apic_base |= APIC_BASE_ENABLE;
        super::wrmsr(IA32_APIC_BASE, apic_base);

        let mut apic = LocalApic { base, apic_id: 0 };
        apic.apic_id = apic.read(REG_ID) >> 24;

        apic.write(REG_SPURIOUS, (1 << 8) | super::idt::APIC_SPURIOUS_VECTOR as u32);
        apic.write(REG_LVT_TIMER, LVT_MASKED);
        apic.write(REG_LVT_LINT0, LVT_MASKED);
        apic.write(REG_LVT_LINT1, LVT_MASKED);
        apic.write(REG_LVT_ERROR, LVT_MASKED);
        apic.write(REG_EOI, 0);
        apic
    }

    unsafe fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    unsafe fn configure_timer(&self, vector: u8, initial_count: u32, periodic: bool) {
        self.write(REG_TIMER_DIV, 0x03); // divide by 16
        let mut lvt = vector as u32;
        if periodic {
            lvt |= LVT_TIMER_PERIODIC;
        }
        self.write(REG_LVT_TIMER, lvt);
        self.write(REG_TIMER_INIT, initial_count);
    }

    unsafe fn send_ipi(&self, dest_apic_id: u32, vector: u8) {
        self.write(REG_ICR_HIGH, dest_apic_id << 24);
        self.write(REG_ICR_LOW, ICR_DEST_SHORTHAND_NONE | vector as u32);
        while (self.read(REG_ICR_LOW) & ICR_DELIVERY_PENDING) != 0 {
            core::hint::spin_loop();
        }
    }
}

static LOCAL_APIC: Mutex<Option<LocalApic>> = Mutex::new(None);

/// # Safety
/// Must run once per CPU during boot, after the legacy PIC has been masked.
pub unsafe fn init() -> Result<(), &'static str> {
    let features = super::cpu::detect_cpu_features();
    if !features.has_apic {
        return Err("no local APIC");
    }
    let apic = LocalApic::new();
    crate::info!("apic: local APIC id {} online", apic.apic_id);
    *LOCAL_APIC.lock() = Some(apic);
    Ok(())
}

/// Arms the periodic timer backing `sched_timer_tick`. `initial_count` is an
/// opaque reload value; calibrating it to wall-clock time is tsc/hpet's job.
pub fn init_timer(vector: u8, initial_count: u32) {
    if let Some(apic) = LOCAL_APIC.lock().as_ref() {
        unsafe { apic.configure_timer(vector, initial_count, true) };
    }
}

pub fn send_eoi() {
    if let Some(apic) = LOCAL_APIC.lock().as_ref() {
        unsafe { apic.eoi() };
    }
}

/// Cross-CPU reschedule IPI (`sched_cpu`'s delivery mechanism): fire-and-forget,
/// the target's own handler does the actual work.
pub fn send_ipi(dest_apic_id: u32, vector: u8) {
    if let Some(apic) = LOCAL_APIC.lock().as_ref() {
        unsafe { apic.send_ipi(dest_apic_id, vector) };
    }
}

pub fn local_apic_id() -> u32 {
    LOCAL_APIC.lock().as_ref().map(|a| a.apic_id).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    #[test]
    fn uninitialized_calls_are_harmless() {
        super::send_eoi();
        super::send_ipi(0, 0xFE);
        assert_eq!(super::local_apic_id(), 0);
    }
}
