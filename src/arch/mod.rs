//! Architecture-specific glue. The four core subsystems (`mm`, `sync`,
//! `sched`, `event`) depend only on the narrow hooks each `arch::<target>`
//! exposes (page-table primitives, context switch, IPI send) — never on
//! anything in here directly.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
