//! 16550 UART driver (COM1), the kernel's only console until a real tty
//! line discipline exists (out of scope -- that's owned by
//! the external tty layer, not the core).

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

pub const COM1_PORT: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(COM1_PORT) };
        port.init();
        Mutex::new(port)
    };
}

pub unsafe fn init_serial() -> Result<(), &'static str> {
    let _ = &*SERIAL1;
    Ok(())
}

pub fn write_byte(byte: u8) {
    SERIAL1.lock().send(byte);
}

pub fn write_bytes(s: &[u8]) {
    for &b in s {
        write_byte(b);
    }
}

pub fn read_byte() -> Option<u8> {
    SERIAL1.lock().receive()
}

/// A `core::fmt::Write` handle onto COM1. Logging goes through this rather
/// than holding the `SERIAL1` lock directly so callers compose with
/// `write!`/`writeln!`.
pub struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

pub fn writer() -> SerialWriter {
    SerialWriter
}
