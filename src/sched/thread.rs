//! Thread control blocks.
//!
//! Grounded on sched.c/proc.c's `thread_t`: priority, run state, the CPU
//! it's assigned to, and (while blocked/sleeping) what it's waiting on.
//! The original allocates one `mtx_t` per thread so any CPU can lock a
//! specific thread independently of every other thread; there's no
//! per-thread heap allocation here yet (no `sched::proc`/allocator for
//! TCBs), so all threads instead live in one fixed table behind a single
//! spin mutex. Coarser-grained than the original -- every `with_thread`
//! call briefly locks every other thread's bookkeeping too -- but correct,
//! and revisitable once threads are individually allocated.

use alloc::vec::Vec;

use crate::sched::queue::MAX_THREADS;
use crate::sync::lock_class::ThreadId;
use crate::sync::mutex::Mutex;

pub const NRUNQS: usize = 64;

pub const PRIO_REALTIME_MIN: u8 = 48;
pub const PRIO_REALTIME_MAX: u8 = 120;
pub const PRIO_TIMESHARE_MIN: u8 = 120;
pub const PRIO_TIMESHARE_MAX: u8 = 224;
pub const PRIO_IDLE_MIN: u8 = 224;
pub const PRIO_IDLE_MAX: u8 = 256 - 1;

/// Priority band a thread's numeric priority falls into, used only for
/// classification (creation still takes a raw 0..256 priority).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriorityBand {
    Realtime,
    Timeshare,
    Idle,
}

pub fn band_of(priority: u8) -> PriorityBand {
    if priority < PRIO_REALTIME_MAX {
        PriorityBand::Realtime
    } else if priority < PRIO_TIMESHARE_MAX {
        PriorityBand::Timeshare
    } else {
        PriorityBand::Idle
    }
}

pub const fn runq_index(priority: u8) -> usize {
    (priority / 4) as usize
}

/// Mirrors `TDS_*`: a thread is in exactly one of these states at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot not in use.
    Empty,
    Ready,
    Running,
    /// Waiting on `contested_lock` (a `LockObject::identity()`).
    Blocked,
    /// Waiting on `wait_channel` (a `kqueue`/condvar wait address).
    Sleeping,
    Stopped,
    Exited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    Any,
    Cpu(u32),
}

#[derive(Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub proc_id: u64,
    pub priority: u8,
    pub state: ThreadState,
    pub cpu_id: Option<u32>,
    pub affinity: Affinity,
    pub contested_lock: Option<usize>,
    pub wait_channel: Option<usize>,
    pub first_time: bool,
    pub stopped: bool,
}

impl Thread {
    const fn empty(id: ThreadId) -> Self {
        Thread {
            id,
            proc_id: 0,
            priority: PRIO_TIMESHARE_MIN,
            state: ThreadState::Empty,
            cpu_id: None,
            affinity: Affinity::Any,
            contested_lock: None,
            wait_channel: None,
            first_time: false,
            stopped: false,
        }
    }
}

static TABLE: Mutex<[Thread; MAX_THREADS]> =
    Mutex::new_spin("sched.threads", [const { Thread::empty(0) }; MAX_THREADS]);

/// Reserves a free slot, initializes it to `Ready`-pending (state is set by
/// the caller once it has chosen a CPU via `sched::submit_new_thread`), and
/// returns its id. `None` means the thread table is full.
pub fn create_thread(proc_id: u64, priority: u8, affinity: Affinity) -> Option<ThreadId> {
    let mut table = TABLE.lock();
    // Slots below MAX_CPUS are reserved for each CPU's idle thread.
    let reserved = crate::arch::x86_64::percpu::MAX_CPUS;
    let (index, slot) = table
        .iter_mut()
        .enumerate()
        .skip(reserved)
        .find(|(_, t)| t.state == ThreadState::Empty)?;
    let id = index as ThreadId;
    slot.id = id;
    slot.proc_id = proc_id;
    slot.priority = priority;
    slot.state = ThreadState::Ready;
    slot.cpu_id = None;
    slot.affinity = affinity;
    slot.contested_lock = None;
    slot.wait_channel = None;
    slot.first_time = true;
    slot.stopped = false;
    Some(id)
}

/// Registers CPU `cpu_id`'s permanent idle thread at the slot reserved for
/// it (slot index == cpu id, matching `CpuLocal::current_thread`'s "0 means
/// idle" convention generalized to "slot N is CPU N's idle thread").
pub fn create_idle_thread(cpu_id: u32) -> ThreadId {
    let mut table = TABLE.lock();
    let slot = &mut table[cpu_id as usize];
    slot.id = cpu_id as ThreadId;
    slot.proc_id = 0;
    slot.priority = PRIO_IDLE_MAX;
    slot.state = ThreadState::Ready;
    slot.cpu_id = Some(cpu_id);
    slot.affinity = Affinity::Cpu(cpu_id);
    slot.first_time = true;
    cpu_id as ThreadId
}

pub fn is_idle(id: ThreadId) -> bool {
    (id as usize) < crate::arch::x86_64::percpu::MAX_CPUS
}

pub fn with_thread<R>(id: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> R {
    let mut table = TABLE.lock();
    f(&mut table[id as usize])
}

pub fn state_of(id: ThreadId) -> ThreadState {
    TABLE.lock()[id as usize].state
}

pub fn free_exited(id: ThreadId) {
    let mut table = TABLE.lock();
    table[id as usize] = Thread::empty(id);
}

pub fn snapshot_exited() -> Vec<ThreadId> {
    TABLE.lock().iter().filter(|t| t.state == ThreadState::Exited).map(|t| t.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_thread_assigns_unique_ready_slot() {
        let a = create_thread(1, 130, Affinity::Any).unwrap();
        let b = create_thread(1, 130, Affinity::Any).unwrap();
        assert_ne!(a, b);
        assert_eq!(state_of(a), ThreadState::Ready);
        free_exited(a);
        free_exited(b);
    }

    #[test]
    fn runq_index_divides_by_four() {
        assert_eq!(runq_index(0), 0);
        assert_eq!(runq_index(48), 12);
        assert_eq!(runq_index(252), 63);
    }

    #[test]
    fn band_of_matches_priority_ranges() {
        assert_eq!(band_of(48), PriorityBand::Realtime);
        assert_eq!(band_of(120), PriorityBand::Timeshare);
        assert_eq!(band_of(224), PriorityBand::Idle);
    }

    #[test]
    fn free_exited_resets_slot_to_empty() {
        let id = create_thread(2, 130, Affinity::Any).unwrap();
        with_thread(id, |t| t.state = ThreadState::Exited);
        free_exited(id);
        assert_eq!(state_of(id), ThreadState::Empty);
    }
}
