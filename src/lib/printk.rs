//! Kernel logging: a small ring buffer of formatted records plus an
//! immediate echo of Error/Warn to the serial console.
//!
//! Mirrors the structure of a classic `printk`: callers never talk to the
//! UART directly, they go through [`log`], which serializes the record into
//! a fixed-size buffer (no heap allocation, so logging works before the
//! kernel heap is initialized) and only then touches the console.

use core::fmt::{self, Write};
use spin::Mutex;

use super::ringbuf::RingBuffer;

const LOG_MESSAGE_CAP: usize = 200;
const LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

#[derive(Clone, Copy)]
pub struct LogEntry {
    pub timestamp_us: u64,
    pub level: LogLevel,
    message: [u8; LOG_MESSAGE_CAP],
    len: usize,
}

impl LogEntry {
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid utf8>")
    }
}

struct FixedWriter {
    buf: [u8; LOG_MESSAGE_CAP],
    len: usize,
}

impl Write for FixedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if self.len >= LOG_MESSAGE_CAP {
                break;
            }
            self.buf[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}

static LOG_BUFFER: Mutex<RingBuffer<LogEntry, LOG_CAPACITY>> = Mutex::new(RingBuffer::new());

/// Records below this level are dropped entirely (but Error/Warn always
/// pass, see [`log`]). Raised/lowered at boot from [`crate::lib::BootConfig`].
static MIN_LEVEL: Mutex<LogLevel> = Mutex::new(LogLevel::Info);

pub fn set_min_level(level: LogLevel) {
    *MIN_LEVEL.lock() = level;
}

/// Format `args` into a fixed buffer, push it to the ring, and echo
/// Error/Warn records to the serial console immediately.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if level > *MIN_LEVEL.lock() && level != LogLevel::Error && level != LogLevel::Warn {
        return;
    }

    let mut w = FixedWriter {
        buf: [0; LOG_MESSAGE_CAP],
        len: 0,
    };
    let _ = w.write_fmt(args);

    let entry = LogEntry {
        timestamp_us: crate::arch::x86_64::tsc::now_micros(),
        level,
        message: w.buf,
        len: w.len,
    };

    LOG_BUFFER.lock().push(entry);

    if level == LogLevel::Error || level == LogLevel::Warn {
        let mut serial = crate::arch::x86_64::serial::writer();
        let _ = writeln!(serial, "[{}] {}", level.tag(), entry.as_str());
    }
}

/// Dump every buffered record to serial; used from the panic handler so a
/// crash doesn't lose whatever was logged right before it.
pub fn dump_to_serial() {
    let mut buffer = LOG_BUFFER.lock();
    let mut serial = crate::arch::x86_64::serial::writer();
    while let Some(entry) = buffer.pop() {
        let _ = writeln!(serial, "[{}] {}", entry.level.tag(), entry.as_str());
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log!($crate::lib::printk::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log!($crate::lib::printk::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log!($crate::lib::printk::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log!($crate::lib::printk::LogLevel::Debug, $($arg)*) };
}
