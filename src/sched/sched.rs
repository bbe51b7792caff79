//! Per-CPU scheduler: 64 priority runqueues, the readymask fast-path, and
//! the `sched_again` funnel every blocking/yielding/exiting path drains
//! through. Grounded on sched.c's `sched_t`/`sched_again`/`sched_cpu`/
//! `sched_submit_new_thread`/`idle_thread_entry`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::idt::IPI_RESCHEDULE_VECTOR;
#[cfg(not(test))]
use crate::arch::x86_64::percpu::CpuLocal;
use crate::arch::x86_64::percpu::{apic_id_for_cpu, MAX_CPUS};
use crate::sync::lock_class::ThreadId;
use crate::sync::mutex::Mutex;

use super::thread::{self, Affinity, ThreadState, NRUNQS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedReason {
    Preempted,
    Yielded,
    Blocked,
    Sleeping,
    Exited,
}

static READYMASK: [AtomicU64; MAX_CPUS] = [const { AtomicU64::new(0) }; MAX_CPUS];

/// `curcpu_is_interrupt`-equivalent: set while servicing an interrupt, so a
/// preemption request can be deferred to interrupt exit instead of
/// re-entering `sched_again` from inside a handler.
static IN_INTERRUPT: [core::sync::atomic::AtomicBool; MAX_CPUS] =
    [const { core::sync::atomic::AtomicBool::new(false) }; MAX_CPUS];
static PREEMPT_PENDING: [core::sync::atomic::AtomicBool; MAX_CPUS] =
    [const { core::sync::atomic::AtomicBool::new(false) }; MAX_CPUS];

struct RunQueues {
    queues: [Vec<ThreadId>; NRUNQS],
    idle: ThreadId,
    cleanup: Vec<ThreadId>,
}

static SCHEDS: [Mutex<Option<RunQueues>>; MAX_CPUS] = [const { Mutex::new_spin("sched.cpu", None) }; MAX_CPUS];

/// Brings up CPU `cpu_id`'s scheduler: allocates its idle thread and empty
/// runqueues. Must run once per CPU before `sched_again`/`sched_submit_*`
/// touch that CPU.
pub fn init_cpu(cpu_id: u32) {
    let idle = thread::create_idle_thread(cpu_id);
    let mut slot = SCHEDS[cpu_id as usize].lock();
    *slot = Some(RunQueues { queues: core::array::from_fn(|_| Vec::new()), idle, cleanup: Vec::new() });
}

#[cfg(not(test))]
fn cpu_index() -> usize {
    CpuLocal::current().cpu_id as usize
}

#[cfg(test)]
fn cpu_index() -> usize {
    0
}

/// `CpuLocal::current()`'s GS read is real hardware only; host unit tests
/// stand in a single fake "current thread" register instead, so
/// `sched_again` (and everything built on it) is exercisable without a CPU.
#[cfg(not(test))]
fn current_thread_id() -> ThreadId {
    CpuLocal::current().current_thread()
}

#[cfg(not(test))]
fn set_current_thread_id(id: ThreadId) {
    CpuLocal::current().set_current_thread(id);
}

#[cfg(test)]
static TEST_CURRENT_THREAD: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
fn current_thread_id() -> ThreadId {
    TEST_CURRENT_THREAD.load(Ordering::Acquire)
}

#[cfg(test)]
fn set_current_thread_id(id: ThreadId) {
    TEST_CURRENT_THREAD.store(id, Ordering::Release);
}

/// Heuristic from `select_cpu_for_thread`: honor affinity first, then the
/// CPU with the fewest *populated priorities* (readymask popcount), which
/// is cheap to compute but only a rough estimate of actual load.
fn select_cpu_for_thread(affinity: Affinity) -> u32 {
    if let Affinity::Cpu(cpu) = affinity {
        return cpu;
    }

    let mut best_cpu = 0u32;
    let mut best_count = u32::MAX;
    for cpu in 0..MAX_CPUS as u32 {
        let mask = READYMASK[cpu as usize].load(Ordering::Relaxed);
        if mask == 0 {
            return cpu;
        }
        let count = mask.count_ones();
        if count < best_count {
            best_count = count;
            best_cpu = cpu;
        }
    }
    best_cpu
}

fn enqueue_ready(cpu: u32, id: ThreadId, priority: u8) {
    let mut sched = SCHEDS[cpu as usize].lock();
    let sched = sched.as_mut().expect("sched_init_cpu not called");
    let i = thread::runq_index(priority);
    sched.queues[i].push(id);
    READYMASK[cpu as usize].fetch_or(1 << i, Ordering::AcqRel);
}

/// Places a brand-new thread on a CPU for the first time, choosing that CPU
/// per `select_cpu_for_thread`.
pub fn sched_submit_new_thread(id: ThreadId) {
    let (priority, affinity) = thread::with_thread(id, |t| {
        t.state = ThreadState::Ready;
        (t.priority, t.affinity)
    });
    let cpu = select_cpu_for_thread(affinity);
    thread::with_thread(id, |t| t.cpu_id = Some(cpu));
    enqueue_ready(cpu, id, priority);
}

/// Re-adds an already-known thread (one that just yielded/was preempted) to
/// its CPU's runqueue.
fn sched_submit_ready_thread(id: ThreadId) {
    let (priority, cpu) = thread::with_thread(id, |t| {
        t.state = ThreadState::Ready;
        (t.priority, t.cpu_id)
    });
    let cpu = cpu.unwrap_or_else(|| select_cpu_for_thread(Affinity::Any));
    thread::with_thread(id, |t| t.cpu_id = Some(cpu));
    enqueue_ready(cpu, id, priority);
}

fn next_thread(cpu: u32) -> ThreadId {
    let mut sched = SCHEDS[cpu as usize].lock();
    let sched = sched.as_mut().expect("sched_init_cpu not called");

    let mask = READYMASK[cpu as usize].load(Ordering::Acquire);
    if mask != 0 {
        let i = mask.trailing_zeros() as usize;
        if let Some(id) = pop_runq(sched, cpu, i) {
            return id;
        }
    }

    for i in 0..NRUNQS {
        if !sched.queues[i].is_empty() {
            if let Some(id) = pop_runq(sched, cpu, i) {
                return id;
            }
        }
    }

    sched.idle
}

fn pop_runq(sched: &mut RunQueues, cpu: u32, i: usize) -> Option<ThreadId> {
    let id = if sched.queues[i].is_empty() { None } else { Some(sched.queues[i].remove(0)) };
    if sched.queues[i].is_empty() {
        READYMASK[cpu as usize].fetch_and(!(1 << i), Ordering::AcqRel);
    }
    id
}

fn add_to_cleanup_queue(cpu: u32, id: ThreadId) {
    let mut sched = SCHEDS[cpu as usize].lock();
    sched.as_mut().expect("sched_init_cpu not called").cleanup.push(id);
}

/// Services the deferred-cleanup list: frees the TCBs of threads that have
/// fully exited. Called by the idle thread's loop in the real scheduler;
/// exposed standalone so tests (and, later, the idle-thread entry point)
/// can drive it directly.
pub fn service_cleanup(cpu: u32) {
    let exited: Vec<ThreadId> = {
        let mut sched = SCHEDS[cpu as usize].lock();
        let sched = sched.as_mut().expect("sched_init_cpu not called");
        core::mem::take(&mut sched.cleanup)
    };
    for id in exited {
        thread::free_exited(id);
    }
}

/// The single funnel every suspension path drains through: `sched_cpu`,
/// the timer tick, and the reschedule IPI all call this with `Preempted`;
/// `block_on_lock`/`sleep_on_channel_timeout`/`thread_exit` call it with
/// `Blocked`/`Sleeping`/`Exited` after setting up the matching bookkeeping
/// on the calling thread. Transitions `curthread`'s state per `reason`,
/// picks the next thread to run, and hands off. The actual register/stack
/// swap is `arch::x86_64::context::switch_thread`'s job; everything here is
/// the logical side of the handoff (ready-state tracking, wait-channel
/// bookkeeping, exit accounting).
pub fn sched_again(reason: SchedReason) {
    let cpu = cpu_index();
    if reason == SchedReason::Preempted && IN_INTERRUPT[cpu].load(Ordering::Acquire) {
        PREEMPT_PENDING[cpu].store(true, Ordering::Release);
        return;
    }

    let old_id = current_thread_id();
    let new_id = next_thread(cpu as u32);

    if thread::is_idle(new_id) {
        if new_id == old_id {
            // Idle thread tried to yield but nothing else is ready.
            return;
        }
        if matches!(reason, SchedReason::Preempted | SchedReason::Yielded) {
            // Nothing better to run than what's already executing; stay put.
            return;
        }
    }

    match reason {
        SchedReason::Preempted => {
            debug_assert!(!IN_INTERRUPT[cpu].load(Ordering::Acquire));
            sched_submit_ready_thread(old_id);
        }
        SchedReason::Yielded => {
            let stopped = thread::with_thread(old_id, |t| t.stopped);
            if !stopped {
                sched_submit_ready_thread(old_id);
            } else {
                thread::with_thread(old_id, |t| t.state = ThreadState::Ready);
            }
        }
        SchedReason::Blocked => {
            thread::with_thread(old_id, |t| {
                t.state = ThreadState::Blocked;
                debug_assert!(t.proc_id == 0 || t.contested_lock.is_some(), "blocked thread has no contested lock set");
            });
        }
        SchedReason::Sleeping => {
            thread::with_thread(old_id, |t| {
                t.state = ThreadState::Sleeping;
                debug_assert!(t.wait_channel.is_some(), "sleeping thread has no wait channel set");
            });
        }
        SchedReason::Exited => {
            thread::with_thread(old_id, |t| t.state = ThreadState::Exited);
            add_to_cleanup_queue(cpu as u32, old_id);
        }
    }

    thread::with_thread(new_id, |t| {
        t.state = ThreadState::Running;
        t.first_time = false;
    });
    set_current_thread_id(new_id);
}

/// Parks the calling thread on `lock_id`'s lockqueue: records `lock_id` as
/// its `contested_lock`, funnels through `sched_again(Blocked)`, then waits
/// for `sched::queue::wake_one` to flag it before clearing the contested
/// lock and returning. The thread id is captured once, before
/// `sched_again` runs, since `sched_again` overwrites "the current thread"
/// bookkeeping as part of the handoff.
pub fn block_on_lock(lock_id: usize) {
    let id = current_thread_id();
    thread::with_thread(id, |t| t.contested_lock = Some(lock_id));
    sched_again(SchedReason::Blocked);
    super::queue::wait_on(lock_id, id);
    thread::with_thread(id, |t| {
        t.contested_lock = None;
        t.state = ThreadState::Running;
    });
}

/// Analogous to `block_on_lock` for a `kqueue`/condvar wait channel, with a
/// tick budget (`None` waits forever, matching `wait_on_timeout`). Returns
/// `true` if woken, `false` if the budget ran out first.
pub fn sleep_on_channel_timeout(channel: usize, ticks: Option<u64>) -> bool {
    let id = current_thread_id();
    thread::with_thread(id, |t| t.wait_channel = Some(channel));
    sched_again(SchedReason::Sleeping);
    let woken = super::queue::wait_on_timeout(channel, id, ticks);
    thread::with_thread(id, |t| {
        t.wait_channel = None;
        t.state = ThreadState::Running;
    });
    woken
}

/// The exit side of the funnel: marks the calling thread `Exited` and
/// queues its TCB on its CPU's cleanup list for `service_cleanup` to free.
pub fn thread_exit() {
    sched_again(SchedReason::Exited);
}

/// Local `sched_again` if `cpu` is the caller's own, otherwise an
/// IPI_RESCHEDULE fire-and-forget to make that CPU re-examine its own
/// runqueue.
pub fn sched_cpu(cpu: u32, reason: SchedReason) {
    if cpu as usize == cpu_index() {
        sched_again(reason);
        return;
    }
    match apic_id_for_cpu(cpu) {
        Some(apic_id) => crate::arch::x86_64::apic::send_ipi(apic_id, IPI_RESCHEDULE_VECTOR),
        None => crate::error!("sched_cpu: no such CPU#{}", cpu),
    }
}

/// Timer-interrupt hook: accounts the tick and, once a
/// timeslice-expiry policy is layered on top, will funnel into
/// `sched_again(Preempted)`. The slice-accounting policy itself is a
/// scheduling-class concern this core doesn't fix, so for now this just
/// keeps the funnel reachable from `idt::timer_interrupt_handler`.
pub fn sched_timer_tick() {
    let cpu = cpu_index();
    if PREEMPT_PENDING[cpu].swap(false, Ordering::AcqRel) {
        sched_again(SchedReason::Preempted);
    }
}

/// IPI_RESCHEDULE target-side handler: just re-examine this CPU's own
/// runqueue, exactly like a local preemption.
pub fn sched_handle_reschedule_ipi() {
    sched_again(SchedReason::Preempted);
}

pub fn enter_interrupt() {
    IN_INTERRUPT[cpu_index()].store(true, Ordering::Release);
}

pub fn exit_interrupt() {
    let cpu = cpu_index();
    IN_INTERRUPT[cpu].store(false, Ordering::Release);
    if PREEMPT_PENDING[cpu].swap(false, Ordering::AcqRel) {
        sched_again(SchedReason::Preempted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_cpu_for_thread_honors_affinity() {
        assert_eq!(select_cpu_for_thread(Affinity::Cpu(3)), 3);
    }

    #[test]
    fn runqueue_push_pop_clears_readymask_when_empty() {
        init_cpu(0);
        enqueue_ready(0, 5, 100);
        let i = thread::runq_index(100);
        assert_ne!(READYMASK[0].load(Ordering::Relaxed) & (1 << i), 0);

        let mut sched = SCHEDS[0].lock();
        let sched = sched.as_mut().unwrap();
        let popped = pop_runq(sched, 0, i);
        assert_eq!(popped, Some(5));
        assert_eq!(READYMASK[0].load(Ordering::Relaxed) & (1 << i), 0);
    }

    #[test]
    fn sched_again_blocked_sets_state_and_keeps_contested_lock() {
        init_cpu(0);
        let id = thread::create_thread(3, 130, Affinity::Cpu(0)).unwrap();
        set_current_thread_id(id);

        thread::with_thread(id, |t| t.contested_lock = Some(0xBEEF));
        sched_again(SchedReason::Blocked);

        assert_eq!(thread::state_of(id), ThreadState::Blocked);
        thread::with_thread(id, |t| assert_eq!(t.contested_lock, Some(0xBEEF)));

        thread::with_thread(id, |t| t.contested_lock = None);
        thread::free_exited(id);
        set_current_thread_id(0);
    }

    #[test]
    fn sched_again_sleeping_sets_state_and_keeps_wait_channel() {
        init_cpu(0);
        let id = thread::create_thread(3, 130, Affinity::Cpu(0)).unwrap();
        set_current_thread_id(id);

        thread::with_thread(id, |t| t.wait_channel = Some(0xCAFE));
        sched_again(SchedReason::Sleeping);

        assert_eq!(thread::state_of(id), ThreadState::Sleeping);
        thread::with_thread(id, |t| assert_eq!(t.wait_channel, Some(0xCAFE)));

        thread::with_thread(id, |t| t.wait_channel = None);
        thread::free_exited(id);
        set_current_thread_id(0);
    }

    #[test]
    fn thread_exit_queues_for_cleanup_and_service_cleanup_frees_the_slot() {
        init_cpu(0);
        let id = thread::create_thread(3, 130, Affinity::Cpu(0)).unwrap();
        set_current_thread_id(id);

        thread_exit();
        assert_eq!(thread::state_of(id), ThreadState::Exited);

        service_cleanup(0);
        assert_eq!(thread::state_of(id), ThreadState::Empty);
        set_current_thread_id(0);
    }
}
