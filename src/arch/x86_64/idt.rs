//! Interrupt Descriptor Table.
//!
//! Vectors 0-31 are CPU exceptions; 32-47 are legacy PIC IRQs (kept as a
//! fallback path, since APIC/IOAPIC register pokes are out of scope
//! but the logical "an interrupt arrives and dispatch happens" contract
//! still needs somewhere to land); 0xFE is the cross-CPU reschedule IPI;
//! 0xFF is the APIC spurious vector.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::tss::{DOUBLE_FAULT_IST_INDEX, MACHINE_CHECK_IST_INDEX, NMI_IST_INDEX};

/// First legacy PIC IRQ vector after remapping past the exception range.
pub const PIC_IRQ_OFFSET: u8 = 32;
/// Local APIC timer, reprogrammed in periodic mode by `apic::init_timer`.
pub const APIC_TIMER_VECTOR: u8 = 0x40;
/// Cross-CPU "re-evaluate your runqueue" request (`sched_cpu`'s IPI path).
pub const IPI_RESCHEDULE_VECTOR: u8 = 0xFE;
pub const APIC_SPURIOUS_VECTOR: u8 = 0xFF;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_exceeded_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);

        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.non_maskable_interrupt.set_stack_index(NMI_IST_INDEX);
            idt.machine_check.set_stack_index(MACHINE_CHECK_IST_INDEX);
        }

        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        idt[APIC_TIMER_VECTOR as usize].set_handler_fn(timer_interrupt_handler);
        idt[IPI_RESCHEDULE_VECTOR as usize].set_handler_fn(reschedule_ipi_handler);
        idt[APIC_SPURIOUS_VECTOR as usize].set_handler_fn(spurious_interrupt_handler);

        idt
    };
}

/// # Safety
/// Must run once per CPU after `gdt::init_gdt`/`tss::init_tss`.
pub unsafe fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    panic!("divide error\n{:#?}", frame);
}

extern "x86-interrupt" fn debug_handler(frame: InterruptStackFrame) {
    crate::warn!("debug exception\n{:#?}", frame);
}

extern "x86-interrupt" fn nmi_handler(frame: InterruptStackFrame) {
    panic!("non-maskable interrupt\n{:#?}", frame);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    crate::info!("breakpoint\n{:#?}", frame);
}

extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    panic!("overflow\n{:#?}", frame);
}

extern "x86-interrupt" fn bound_range_exceeded_handler(frame: InterruptStackFrame) {
    panic!("bound range exceeded\n{:#?}", frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode\n{:#?}", frame);
}

extern "x86-interrupt" fn device_not_available_handler(frame: InterruptStackFrame) {
    panic!("device not available\n{:#?}", frame);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    panic!("double fault (error_code {:#x})\n{:#?}", error_code, frame);
}

extern "x86-interrupt" fn invalid_tss_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("invalid tss (error_code {:#x})\n{:#?}", error_code, frame);
}

extern "x86-interrupt" fn segment_not_present_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("segment not present (error_code {:#x})\n{:#?}", error_code, frame);
}

extern "x86-interrupt" fn stack_segment_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("stack segment fault (error_code {:#x})\n{:#?}", error_code, frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "general protection fault (error_code {:#x}, selector index {})\n{:#?}",
        error_code,
        (error_code >> 3) & 0x1FFF,
        frame
    );
}

/// Translates a #PF straight into the address-space manager's fault path
/// (the address-space manager's mapping-kind lookup). Demand paging of `Anon` mappings
/// and copy-on-write both funnel through here; anything else is fatal.
extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let fault_addr = Cr2::read();
    let present = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);

    match crate::mm::vmalloc::handle_page_fault(fault_addr.as_u64(), present, write) {
        Ok(()) => {}
        Err(e) => panic!(
            "unresolved page fault at {:#x} ({:?}): {}\n{:#?}",
            fault_addr.as_u64(),
            error_code,
            e,
            frame
        ),
    }
}

extern "x86-interrupt" fn x87_floating_point_handler(frame: InterruptStackFrame) {
    panic!("x87 floating point error\n{:#?}", frame);
}

extern "x86-interrupt" fn alignment_check_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("alignment check (error_code {:#x})\n{:#?}", error_code, frame);
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    panic!("machine check\n{:#?}", frame);
}

extern "x86-interrupt" fn simd_floating_point_handler(frame: InterruptStackFrame) {
    panic!("simd floating point error\n{:#?}", frame);
}

extern "x86-interrupt" fn virtualization_handler(frame: InterruptStackFrame) {
    panic!("virtualization exception\n{:#?}", frame);
}

/// Local APIC periodic timer. Drives the scheduler's time-slice accounting
/// and, when the current thread's slice is exhausted, funnels into
/// `sched_again(Preempted)`.
extern "x86-interrupt" fn timer_interrupt_handler(_frame: InterruptStackFrame) {
    crate::sched::sched_timer_tick();
    super::apic::send_eoi();
}

/// IPI_RESCHEDULE target-side handler (`sched_cpu`'s target side): re-examine
/// this CPU's runqueue, nothing more. The sender doesn't wait for a reply.
extern "x86-interrupt" fn reschedule_ipi_handler(_frame: InterruptStackFrame) {
    crate::sched::sched_handle_reschedule_ipi();
    super::apic::send_eoi();
}

extern "x86-interrupt" fn spurious_interrupt_handler(_frame: InterruptStackFrame) {
    super::apic::send_eoi();
}

#[cfg(test)]
mod tests {
    #[test]
    fn vector_layout_is_distinct() {
        use super::*;
        assert_ne!(IPI_RESCHEDULE_VECTOR, APIC_SPURIOUS_VECTOR);
        assert_ne!(APIC_TIMER_VECTOR, IPI_RESCHEDULE_VECTOR);
        assert!(PIC_IRQ_OFFSET < APIC_TIMER_VECTOR);
    }
}
