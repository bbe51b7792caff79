//! CPUID feature detection and the control-register writes that turn the
//! required/optional features on. Required: SSE2, APIC. Everything else
//! (NX, SMEP, SMAP, FSGSBASE) is enabled opportunistically.

use raw_cpuid::CpuId;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
use x86_64::registers::model_specific::{Efer, EferFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub vendor: CpuVendor,
    pub has_sse2: bool,
    pub has_apic: bool,
    pub has_nx: bool,
    pub has_smep: bool,
    pub has_smap: bool,
    pub has_fsgsbase: bool,
    pub has_invariant_tsc: bool,
    pub tsc_hz: Option<u64>,
}

pub fn detect_cpu_features() -> CpuFeatures {
    let cpuid = CpuId::new();

    let vendor = match cpuid.get_vendor_info() {
        Some(v) if v.as_str() == "GenuineIntel" => CpuVendor::Intel,
        Some(v) if v.as_str() == "AuthenticAMD" => CpuVendor::Amd,
        _ => CpuVendor::Unknown,
    };

    let feature_info = cpuid.get_feature_info();
    let extended = cpuid.get_extended_feature_info();
    let extended_proc = cpuid.get_extended_processor_and_feature_identifiers();
    let apm = cpuid.get_advanced_power_mgmt_info();

    let tsc_hz = cpuid.get_tsc_info().and_then(|t| {
        let num = t.tsc_frequency()?;
        Some(num)
    });

    CpuFeatures {
        vendor,
        has_sse2: feature_info.as_ref().map_or(false, |f| f.has_sse2()),
        has_apic: feature_info.as_ref().map_or(false, |f| f.has_apic()),
        has_nx: extended_proc.as_ref().map_or(false, |f| f.has_execute_disable()),
        has_smep: extended.as_ref().map_or(false, |f| f.has_smep()),
        has_smap: extended.as_ref().map_or(false, |f| f.has_smap()),
        has_fsgsbase: extended.as_ref().map_or(false, |f| f.has_fsgsbase()),
        has_invariant_tsc: apm.as_ref().map_or(false, |f| f.has_invariant_tsc()),
        tsc_hz,
    }
}

/// # Safety
/// Must run during early boot with interrupts disabled, before any thread
/// touches paging or floating point state.
pub unsafe fn enable_cpu_features() -> Result<(), &'static str> {
    let features = detect_cpu_features();

    if !features.has_sse2 {
        return Err("SSE2 not supported");
    }
    if !features.has_apic {
        return Err("local APIC not supported");
    }

    let mut cr0 = Cr0::read();
    cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
    cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
    Cr0::write(cr0);

    let mut cr4 = Cr4::read();
    cr4.insert(Cr4Flags::OSFXSR);
    cr4.insert(Cr4Flags::OSXMMEXCPT_ENABLE);
    if features.has_smep {
        cr4.insert(Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION);
    }
    if features.has_smap {
        cr4.insert(Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION);
    }
    if features.has_fsgsbase {
        cr4.insert(Cr4Flags::FSGSBASE);
    }
    Cr4::write(cr4);

    if features.has_nx {
        let mut efer = Efer::read();
        efer.insert(EferFlags::NO_EXECUTE_ENABLE);
        Efer::write(efer);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_runs_on_host() {
        let features = detect_cpu_features();
        assert!(features.has_sse2, "test host is expected to have SSE2");
    }
}
