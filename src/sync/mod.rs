//! Synchronization primitives (L6): spin and wait mutexes dispatched
//! through a shared lock-class v-table, plus the per-CPU critical-section
//! and claim-tracking support they need.

pub mod critical;
pub mod lock_class;
pub mod mutex;

pub use lock_class::{LockClass, LockFlags, LockHow, LockKind, LockObject, MtxAssert, ThreadId};
pub use mutex::{Mutex, MutexGuard, RawMutex};
