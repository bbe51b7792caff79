//! Scheduler core (L7/L8): per-CPU runqueues, the `sched_again` funnel, and
//! the lockqueue/waitqueue machinery mutexes and kqueues block on.

pub mod queue;
pub mod sched;
pub mod thread;

pub use sched::{
    block_on_lock, enter_interrupt, exit_interrupt, init_cpu, sched_again, sched_cpu, sched_handle_reschedule_ipi, sched_submit_new_thread,
    sched_timer_tick, service_cleanup, sleep_on_channel_timeout, thread_exit, SchedReason,
};
pub use thread::{Affinity, Thread, ThreadState};
