//! Ambient kernel infrastructure: logging, error types, panic handling.
//!
//! Kept separate from the four core subsystems (`mm`, `sync`, `sched`,
//! `event`) on purpose — none of those modules should need to know *how*
//! a log line reaches the console, only that `crate::info!(...)` exists.

pub mod build_info;
pub mod debug;
pub mod error;
pub mod panic;
pub mod printk;
pub mod ringbuf;
