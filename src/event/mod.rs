//! Event notification (L9): the kqueue/knote/filter machinery blocking
//! waits (timers, process exit, user-triggered wakeups) dispatch through,
//! layered on `sync::mutex` and `sched::queue`.

pub mod filter;
pub mod kqueue;

pub use filter::{register_builtin_filters, EvFlags, Filter, FilterData, FilterOps, KEvent, NEVFILT};
pub use kqueue::{kqueue_tick, notify_proc_exit, trigger_user_event, Kqueue};
