//! HPET: the core only needs one fact from it — a monotonically
//! increasing counter at a known period, used once to calibrate the TSC.
//! Discovering its MMIO base via ACPI is out of scope; callers
//! pass the base address down from whatever did that discovery.

use core::ptr::read_volatile;
use x86_64::VirtAddr;

const REG_CAPABILITIES: u64 = 0x000;
const REG_CONFIG: u64 = 0x010;
const REG_COUNTER: u64 = 0x0F0;

pub struct Hpet {
    base: VirtAddr,
    period_fs: u64,
}

impl Hpet {
    /// # Safety
    /// `base` must be a valid, already-mapped MMIO window for the HPET.
    pub unsafe fn new(base: VirtAddr) -> Self {
        let caps = read_volatile((base.as_u64() + REG_CAPABILITIES) as *const u64);
        let period_fs = caps >> 32;
        let cfg_ptr = (base.as_u64() + REG_CONFIG) as *mut u64;
        core::ptr::write_volatile(cfg_ptr, read_volatile(cfg_ptr) | 1);
        Hpet { base, period_fs }
    }

    pub fn read_counter(&self) -> u64 {
        unsafe { read_volatile((self.base.as_u64() + REG_COUNTER) as *const u64) }
    }

    /// Femtoseconds per tick, used to convert a counter delta to time.
    pub fn period_femtoseconds(&self) -> u64 {
        self.period_fs
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn register_offsets_are_distinct() {
        assert_ne!(super::REG_CAPABILITIES, super::REG_COUNTER);
    }
}
