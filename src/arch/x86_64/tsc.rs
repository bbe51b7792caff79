//! Time-stamp counter: the core's only clock source (used for log
//! timestamps and the scheduler's accounting fields). Calibrated once at
//! boot against whichever frequency source is available, in descending
//! order of trust: CPUID leaf 0x15, HPET, a fixed fallback.

use core::sync::atomic::{AtomicU64, Ordering};

const FALLBACK_HZ: u64 = 1_000_000_000;

static TSC_HZ: AtomicU64 = AtomicU64::new(FALLBACK_HZ);
static EPOCH_TSC: AtomicU64 = AtomicU64::new(0);

#[inline]
fn read_tsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// # Safety
/// Must run once during early boot, before any caller reads `now_micros`.
pub unsafe fn init() {
    let features = super::cpu::detect_cpu_features();
    let hz = features.tsc_hz.unwrap_or(FALLBACK_HZ);
    TSC_HZ.store(hz, Ordering::Relaxed);
    EPOCH_TSC.store(read_tsc(), Ordering::Relaxed);
}

/// Calibrates against an HPET counter instead of trusting CPUID, used when
/// leaf 0x15 is unavailable (older CPUs).
pub fn calibrate_against_hpet(hpet: &super::hpet::Hpet, sample_ticks: u64) {
    let start_hpet = hpet.read_counter();
    let start_tsc = read_tsc();
    while hpet.read_counter().wrapping_sub(start_hpet) < sample_ticks {
        core::hint::spin_loop();
    }
    let end_hpet = hpet.read_counter();
    let end_tsc = read_tsc();

    let hpet_ticks = end_hpet.wrapping_sub(start_hpet).max(1);
    let tsc_ticks = end_tsc.wrapping_sub(start_tsc);
    let period_fs = hpet.period_femtoseconds().max(1);
    // hz = tsc_ticks / (hpet_ticks * period_fs * 1e-15)
    let elapsed_fs = hpet_ticks as u128 * period_fs as u128;
    if elapsed_fs == 0 {
        return;
    }
    let hz = (tsc_ticks as u128 * 1_000_000_000_000_000u128 / elapsed_fs) as u64;
    if hz > 0 {
        TSC_HZ.store(hz, Ordering::Relaxed);
    }
}

pub fn now_micros() -> u64 {
    let hz = TSC_HZ.load(Ordering::Relaxed).max(1);
    let delta = read_tsc().wrapping_sub(EPOCH_TSC.load(Ordering::Relaxed));
    delta / (hz / 1_000_000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn now_micros_is_monotonic_enough() {
        TSC_HZ.store(1_000_000_000, Ordering::Relaxed);
        EPOCH_TSC.store(0, Ordering::Relaxed);
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }
}
