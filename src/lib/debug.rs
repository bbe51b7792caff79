//! Debug-only assertion helpers shared by the mutex, scheduler, and VM code.
//!
//! Assertions that indicate a kernel-bug condition panic
//! immediately; they compile to no-ops in release builds, same as the
//! donor's `kassert` convention.

/// Panics with a formatted message if `cond` is false. No-op in release
/// builds (`debug_assertions` off), matching the mutex/lock-class layer's "no-ops in
/// release builds" for lock assertions.
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        if cfg!(debug_assertions) && !($cond) {
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) && !($cond) {
            panic!($($arg)+);
        }
    };
}

pub fn print_stack_trace() {
    crate::error!("stack trace printing not implemented (requires frame pointers)");
}
