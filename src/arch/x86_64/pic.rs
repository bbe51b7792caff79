//! Legacy 8259 PIC, kept only long enough to remap and mask it before the
//! local APIC takes over. Register-level detail lives in the `pic8259`
//! crate; this module just owns the remap offsets and the handoff.

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;

pub const PIC1_OFFSET: u8 = 32;
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

const PIC1_DATA: u16 = 0x21;
const PIC2_DATA: u16 = 0xA1;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET) });

/// # Safety
/// Must run once during early boot, before interrupts are enabled.
pub unsafe fn init() {
    PICS.lock().initialize();
}

/// Masks every legacy IRQ line once the APIC is driving interrupts.
pub fn disable() {
    unsafe {
        let mut data1: Port<u8> = Port::new(PIC1_DATA);
        let mut data2: Port<u8> = Port::new(PIC2_DATA);
        data1.write(0xFFu8);
        data2.write(0xFFu8);
    }
}
