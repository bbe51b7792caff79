//! Spin and wait mutexes over the shared `RawMutex` state machine.
//!
//! Grounded on mutex.c: a single owner-or-null word packs the state bits
//! into its low 3 bits (`MTX_UNOWNED`/`MTX_LOCKED`/`MTX_DESTROYED`/
//! `MTX_RECURSED`), `lo.data` counts recursion depth, and the two lock
//! kinds share every assertion and the destroy path. The only difference
//! between the two is what happens on contention: a spin mutex burns CPU
//! on a CAS retry loop with exponential-ish backoff, a wait mutex parks the
//! calling thread on the owner's lockqueue.
//!
//! One deviation from the C original: the owner word there is a `thread_t*`
//! with the state bits stolen from pointer alignment. There is no allocated
//! `thread_t` yet (`sched::thread` hasn't been written), so the owner here
//! is the `ThreadId` (`u64`) percpu data already uses, shifted left to make
//! room for the same three state bits.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(test))]
use crate::arch::x86_64::percpu::CpuLocal;
use crate::sync::critical::{critical_enter, critical_exit, spin_claims_add, spin_claims_remove, wait_claims_add, wait_claims_remove};
use crate::sync::lock_class::{LockClass, LockFlags, LockHow, LockKind, LockObject, MtxAssert, ThreadId};

const MTX_UNOWNED: u64 = 0x00;
const MTX_LOCKED: u64 = 0x01;
const MTX_DESTROYED: u64 = 0x02;
const MTX_RECURSED: u64 = 0x04;
const MTX_STATE_MASK: u64 = 0x07;

const fn new_mtx_lock(owner: ThreadId, state: u64) -> u64 {
    (owner << 3) | (state & MTX_STATE_MASK)
}

const fn mtx_lock_owner(word: u64) -> ThreadId {
    word >> 3
}

/// `CpuLocal::current()` reads the GS-relative per-CPU block, which only
/// exists once `percpu::init_cpu` has run on real hardware. Host unit tests
/// never bring that up, so `curthread` is pinned to thread 0 under
/// `cfg(test)` instead of touching the segment register.
#[cfg(not(test))]
fn curthread() -> ThreadId {
    CpuLocal::current().current_thread()
}

#[cfg(test)]
fn curthread() -> ThreadId {
    0
}

/// The lock-kind-agnostic state machine. `Mutex<T>` wraps one of these
/// around the protected data; code that only needs to block/assert/inspect
/// ownership (lockqueues, kqueues) can go through `&dyn LockClass` instead.
pub struct RawMutex {
    lock: AtomicU64,
    lo: LockObject,
}

impl RawMutex {
    pub const fn new(name: &'static str, kind: LockKind, flags: LockFlags) -> Self {
        RawMutex { lock: AtomicU64::new(MTX_UNOWNED), lo: LockObject::new(name, kind, flags) }
    }

    pub fn lock_object(&self) -> &LockObject {
        &self.lo
    }

    fn assert_not_destroyed(&self) {
        debug_assert_ne!(self.lock.load(Ordering::Relaxed), MTX_DESTROYED, "use of destroyed mutex {}", self.lo.name);
    }

    fn assert_kind(&self, kind: LockKind, who: &str) {
        debug_assert_eq!(self.lo.kind, kind, "{}() on wrong lock kind for {}", who, self.lo.name);
    }

    /// Marks the mutex permanently unusable. Any further lock/unlock is a
    /// bug and panics via `assert_not_destroyed`.
    pub fn destroy(&self) {
        debug_assert_ne!(self.lock.load(Ordering::Relaxed), MTX_DESTROYED, "_mtx_destroy() on already-destroyed mutex {}", self.lo.name);
        self.lo.recursion.store(0, Ordering::Relaxed);
        self.lock.store(MTX_DESTROYED, Ordering::Release);
    }

    // ---- spin ----

    pub fn spin_try_lock(&self, file: &'static str, line: u32) -> bool {
        self.assert_kind(LockKind::Spin, "spin_try_lock");
        self.assert_not_destroyed();

        let td = curthread();
        critical_enter();
        spin_claims_add(self.lo.identity(), file, line);

        if td != 0 && mtx_lock_owner(self.lock.load(Ordering::Relaxed)) == td {
            debug_assert!(self.lo.flags.contains(LockFlags::RECURSABLE), "recursive spin_lock on non-recursive mutex {}", self.lo.name);
            self.lock.fetch_or(MTX_RECURSED, Ordering::Relaxed);
            self.lo.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let desired = new_mtx_lock(td, MTX_LOCKED);
        if self.lock.compare_exchange(MTX_UNOWNED, desired, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            self.lo.recursion.store(1, Ordering::Relaxed);
            return true;
        }

        spin_claims_remove(self.lo.identity());
        critical_exit();
        false
    }

    pub fn spin_lock(&self, file: &'static str, line: u32) {
        self.assert_kind(LockKind::Spin, "spin_lock");
        self.assert_not_destroyed();

        let td = curthread();
        critical_enter();
        spin_claims_add(self.lo.identity(), file, line);

        if td != 0 && mtx_lock_owner(self.lock.load(Ordering::Relaxed)) == td {
            debug_assert!(self.lo.flags.contains(LockFlags::RECURSABLE), "recursive spin_lock on non-recursive mutex {}", self.lo.name);
            self.lock.fetch_or(MTX_RECURSED, Ordering::Relaxed);
            self.lo.recursion.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let desired = new_mtx_lock(td, MTX_LOCKED);
        let mut spins: u32 = 0;
        loop {
            if self.lock.compare_exchange_weak(MTX_UNOWNED, desired, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                break;
            }
            while self.lock.load(Ordering::Relaxed) != MTX_UNOWNED {
                core::hint::spin_loop();
                spins = spins.wrapping_add(1);
                debug_assert!(spins < SPIN_DEADLOCK_THRESHOLD, "spin mutex deadlock on {} [{}:{}]", self.lo.name, file, line);
            }
        }
        self.lo.recursion.store(1, Ordering::Relaxed);
    }

    pub fn spin_unlock(&self, _file: &'static str, _line: u32) {
        self.assert_kind(LockKind::Spin, "spin_unlock");
        self.assert_not_destroyed();
        debug_assert_eq!(mtx_lock_owner(self.lock.load(Ordering::Relaxed)), curthread(), "spin_unlock() by non-owner on {}", self.lo.name);

        let depth = self.lo.recursion.fetch_sub(1, Ordering::Relaxed) - 1;
        let word = self.lock.load(Ordering::Relaxed);
        if word & MTX_RECURSED != 0 && depth > 0 {
            debug_assert!(self.lo.flags.contains(LockFlags::RECURSABLE));
            if depth == 1 {
                self.lock.fetch_and(!MTX_RECURSED, Ordering::Relaxed);
            }
            return;
        }

        debug_assert_eq!(depth, 0, "spin_unlock() expected 0 recursion depth on {}", self.lo.name);
        self.lock.store(MTX_UNOWNED, Ordering::Release);
        spin_claims_remove(self.lo.identity());
        critical_exit();
    }

    // ---- wait ----

    pub fn wait_try_lock(&self, file: &'static str, line: u32) -> bool {
        self.assert_kind(LockKind::Wait, "wait_try_lock");
        self.assert_not_destroyed();
        wait_claims_add(self.lo.identity(), file, line);

        let td = curthread();
        if td != 0 && mtx_lock_owner(self.lock.load(Ordering::Relaxed)) == td {
            debug_assert!(self.lo.flags.contains(LockFlags::RECURSABLE), "recursive wait_lock on non-recursive mutex {}", self.lo.name);
            self.lock.fetch_or(MTX_RECURSED, Ordering::Relaxed);
            self.lo.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let desired = new_mtx_lock(td, MTX_LOCKED);
        if self.lock.compare_exchange(MTX_UNOWNED, desired, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            self.lo.recursion.store(1, Ordering::Relaxed);
            return true;
        }

        wait_claims_remove(self.lo.identity());
        false
    }

    /// Blocks until the lock is acquired. On contention this records the
    /// lock as the calling thread's `contested_lock` and funnels through
    /// `sched::block_on_lock`, which hands off via `sched_again(Blocked)`
    /// before parking on `sched::queue`'s lockqueue; the CAS is retried
    /// each time the thread is woken.
    pub fn wait_lock(&self, file: &'static str, line: u32) {
        self.assert_kind(LockKind::Wait, "wait_lock");
        self.assert_not_destroyed();
        wait_claims_add(self.lo.identity(), file, line);

        let td = curthread();
        if td != 0 && mtx_lock_owner(self.lock.load(Ordering::Relaxed)) == td {
            debug_assert!(self.lo.flags.contains(LockFlags::RECURSABLE), "recursive wait_lock on non-recursive mutex {}", self.lo.name);
            self.lock.fetch_or(MTX_RECURSED, Ordering::Relaxed);
            self.lo.recursion.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let desired = new_mtx_lock(td, MTX_LOCKED);
        loop {
            if self.lock.compare_exchange_weak(MTX_UNOWNED, desired, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                self.lo.recursion.store(1, Ordering::Relaxed);
                return;
            }
            crate::sched::block_on_lock(self.lo.identity());
        }
    }

    pub fn wait_unlock(&self, _file: &'static str, _line: u32) {
        self.assert_kind(LockKind::Wait, "wait_unlock");
        self.assert_not_destroyed();
        let owner = mtx_lock_owner(self.lock.load(Ordering::Relaxed));
        debug_assert_eq!(owner, curthread(), "wait_unlock() by {} on mutex {} owned by {}", curthread(), self.lo.name, owner);

        let depth = self.lo.recursion.fetch_sub(1, Ordering::Relaxed) - 1;
        let word = self.lock.load(Ordering::Relaxed);
        if word & MTX_RECURSED != 0 && depth > 0 {
            debug_assert!(self.lo.flags.contains(LockFlags::RECURSABLE));
            if depth == 1 {
                self.lock.fetch_and(!MTX_RECURSED, Ordering::Relaxed);
            }
            return;
        }

        debug_assert_eq!(depth, 0, "wait_unlock() expected 0 recursion depth on {}", self.lo.name);
        self.lock.store(MTX_UNOWNED, Ordering::Release);
        wait_claims_remove(self.lo.identity());
        crate::sched::queue::wake_one(self.lo.identity());
    }

    pub fn owner(&self) -> Option<ThreadId> {
        let owner = mtx_lock_owner(self.lock.load(Ordering::Relaxed));
        if owner == 0 {
            None
        } else {
            Some(owner)
        }
    }

    pub fn assert(&self, what: MtxAssert, file: &'static str, line: u32) {
        let word = self.lock.load(Ordering::Relaxed);
        let owner = mtx_lock_owner(word);
        match what {
            MtxAssert::Unlocked => debug_assert_eq!(word, MTX_UNOWNED, "mutex {} locked, {}:{}", self.lo.name, file, line),
            MtxAssert::Locked => debug_assert!(word & MTX_LOCKED != 0, "mutex {} unlocked, {}:{}", self.lo.name, file, line),
            MtxAssert::Owned => debug_assert!(word & MTX_LOCKED != 0 && owner == curthread(), "mutex {} not owned, {}:{}", self.lo.name, file, line),
            MtxAssert::NotOwned => debug_assert!(owner != curthread(), "mutex {} owned, {}:{}", self.lo.name, file, line),
            MtxAssert::Recursed => debug_assert!(word & MTX_LOCKED != 0 && self.lo.recursion_depth() > 0, "mutex {} not recursed, {}:{}", self.lo.name, file, line),
            MtxAssert::NotRecursed => debug_assert!(word & MTX_LOCKED != 0 && self.lo.recursion_depth() == 1, "mutex {} recursed, {}:{}", self.lo.name, file, line),
        }
    }
}

const SPIN_DEADLOCK_THRESHOLD: u32 = 100_000_000;

impl LockClass for RawMutex {
    fn lock_object(&self) -> &LockObject {
        &self.lo
    }

    fn lc_lock(&self, how: LockHow, file: &'static str, line: u32) {
        let LockHow::Excl = how;
        match self.lo.kind {
            LockKind::Spin => self.spin_lock(file, line),
            LockKind::Wait => self.wait_lock(file, line),
        }
    }

    fn lc_unlock(&self, file: &'static str, line: u32) {
        match self.lo.kind {
            LockKind::Spin => self.spin_unlock(file, line),
            LockKind::Wait => self.wait_unlock(file, line),
        }
    }

    fn lc_assert(&self, what: MtxAssert, file: &'static str, line: u32) {
        self.assert(what, file, line)
    }

    fn lc_owner(&self) -> Option<ThreadId> {
        self.owner()
    }
}

/// A mutex-protected value. `kind` picks whether contention spins or parks.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new_spin(name: &'static str, value: T) -> Self {
        Mutex { raw: RawMutex::new(name, LockKind::Spin, LockFlags::empty()), data: UnsafeCell::new(value) }
    }

    pub const fn new_wait(name: &'static str, value: T) -> Self {
        Mutex { raw: RawMutex::new(name, LockKind::Wait, LockFlags::empty()), data: UnsafeCell::new(value) }
    }

    pub const fn new_recursive_wait(name: &'static str, value: T) -> Self {
        Mutex { raw: RawMutex::new(name, LockKind::Wait, LockFlags::RECURSABLE), data: UnsafeCell::new(value) }
    }

    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let loc = core::panic::Location::caller();
        match self.raw.lo.kind {
            LockKind::Spin => self.raw.spin_lock(loc.file(), loc.line()),
            LockKind::Wait => self.raw.wait_lock(loc.file(), loc.line()),
        }
        MutexGuard { mutex: self }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let loc = core::panic::Location::caller();
        let ok = match self.raw.lo.kind {
            LockKind::Spin => self.raw.spin_try_lock(loc.file(), loc.line()),
            LockKind::Wait => self.raw.wait_try_lock(loc.file(), loc.line()),
        };
        ok.then_some(MutexGuard { mutex: self })
    }

    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn destroy(&self) {
        self.raw.destroy();
    }

    /// Safe because `&mut self` proves exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    #[track_caller]
    fn drop(&mut self) {
        let loc = core::panic::Location::caller();
        match self.mutex.raw.lo.kind {
            LockKind::Spin => self.mutex.raw.spin_unlock(loc.file(), loc.line()),
            LockKind::Wait => self.mutex.raw.wait_unlock(loc.file(), loc.line()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_mutex_trylock_unlock_returns_to_unowned() {
        let raw = RawMutex::new("test.spin", LockKind::Spin, LockFlags::empty());
        assert!(raw.spin_try_lock(file!(), line!()));
        assert_eq!(raw.lock.load(Ordering::Relaxed) & MTX_STATE_MASK, MTX_LOCKED);
        raw.spin_unlock(file!(), line!());
        assert_eq!(raw.lock.load(Ordering::Relaxed), MTX_UNOWNED);
    }

    #[test]
    fn wait_mutex_trylock_contended_fails() {
        let raw = RawMutex::new("test.wait", LockKind::Wait, LockFlags::empty());
        assert!(raw.wait_try_lock(file!(), line!()));
        // Force a foreign owner to simulate contention without a real thread.
        raw.lock.store(new_mtx_lock(99, MTX_LOCKED), Ordering::Relaxed);
        assert!(!raw.wait_try_lock(file!(), line!()));
    }

    #[test]
    fn recursive_wait_mutex_balances_after_equal_unlocks() {
        let m: Mutex<u32> = Mutex::new_recursive_wait("test.recursive", 0);
        let g1 = m.lock();
        let g2 = m.lock();
        let g3 = m.lock();
        assert_eq!(m.raw.lo.recursion_depth(), 3);
        drop(g3);
        drop(g2);
        drop(g1);
        assert_eq!(m.raw.lock.load(Ordering::Relaxed), MTX_UNOWNED);
        assert_eq!(m.raw.lo.recursion_depth(), 0);
    }

    #[test]
    fn guard_deref_reads_and_writes_protected_value() {
        let m: Mutex<u32> = Mutex::new_spin("test.value", 41);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn destroyed_mutex_state_is_sentinel() {
        let raw = RawMutex::new("test.destroy", LockKind::Spin, LockFlags::empty());
        raw.destroy();
        assert_eq!(raw.lock.load(Ordering::Relaxed), MTX_DESTROYED);
    }
}
