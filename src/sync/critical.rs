//! Per-CPU critical-section nesting and the debug spin-claim list.
//!
//! Grounded on mutex.c's `spinlock_enter`/`spinlock_exit` (bump a per-thread
//! spin count and raise/lower the critical level) and the
//! `SPIN_CLAIMS_ADD`/`SPIN_CLAIMS_REMOVE` macros that record file:line of
//! every spin-mutex acquisition on `curcpu_spin_claims`. `sched::thread`
//! doesn't exist yet, so the nesting counter lives here per-CPU instead of
//! on a thread control block; once threads exist this can move there
//! without changing `RawMutex`'s call sites.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86_64::percpu::MAX_CPUS;

static CRITICAL_NESTING: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Host unit tests never run `percpu::init_cpu`, so `CpuLocal::current`'s
/// GS-relative read has nothing valid to dereference; pin to CPU 0 there.
#[cfg(not(test))]
fn current_cpu_id() -> usize {
    crate::arch::x86_64::percpu::CpuLocal::current().cpu_id as usize
}

#[cfg(test)]
fn current_cpu_id() -> usize {
    0
}

/// Enter a critical section: preemption is logically disabled on this CPU
/// until a matching `critical_exit`.
pub fn critical_enter() {
    CRITICAL_NESTING[current_cpu_id()].fetch_add(1, Ordering::AcqRel);
}

pub fn critical_exit() {
    let prev = CRITICAL_NESTING[current_cpu_id()].fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "critical_exit() with no critical section held");
}

pub fn in_critical() -> bool {
    CRITICAL_NESTING[current_cpu_id()].load(Ordering::Acquire) > 0
}

/// One recorded spin-mutex acquisition: the lock's identity plus where it
/// was taken.
#[cfg(feature = "claims")]
#[derive(Clone, Copy, Debug)]
pub struct Claim {
    pub lock_identity: usize,
    pub file: &'static str,
    pub line: u32,
}

#[cfg(feature = "claims")]
const CLAIM_CAPACITY: usize = 8;

#[cfg(feature = "claims")]
#[derive(Clone, Copy, Debug)]
pub struct ClaimList {
    slots: [Option<Claim>; CLAIM_CAPACITY],
}

#[cfg(feature = "claims")]
impl ClaimList {
    const fn empty() -> Self {
        ClaimList { slots: [None; CLAIM_CAPACITY] }
    }

    fn add(&mut self, lock_identity: usize, file: &'static str, line: u32) {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(Claim { lock_identity, file, line });
                return;
            }
        }
        // A CPU holding more than CLAIM_CAPACITY nested spinlocks at once is
        // a bug elsewhere; drop the claim rather than panic in a debug aid.
    }

    fn remove(&mut self, lock_identity: usize) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(c) if c.lock_identity == lock_identity) {
                *slot = None;
                return;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Claim> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

#[cfg(feature = "claims")]
static mut SPIN_CLAIMS: [ClaimList; MAX_CPUS] = [ClaimList::empty(); MAX_CPUS];

/// # Safety
/// Only ever touched by the owning CPU (mirrors `curcpu_spin_claims`), so no
/// lock is needed, but callers must not be preempted onto another CPU mid
/// access (true for all current call sites: interrupts are not re-entrant
/// into the claim list and there is no user-mode migration yet).
#[cfg(feature = "claims")]
fn this_cpu_claims() -> &'static mut ClaimList {
    unsafe { &mut (*core::ptr::addr_of_mut!(SPIN_CLAIMS))[current_cpu_id()] }
}

#[cfg(feature = "claims")]
pub fn spin_claims_add(lock_identity: usize, file: &'static str, line: u32) {
    this_cpu_claims().add(lock_identity, file, line);
}

#[cfg(feature = "claims")]
pub fn spin_claims_remove(lock_identity: usize) {
    this_cpu_claims().remove(lock_identity);
}

#[cfg(not(feature = "claims"))]
pub fn spin_claims_add(_lock_identity: usize, _file: &'static str, _line: u32) {}

#[cfg(not(feature = "claims"))]
pub fn spin_claims_remove(_lock_identity: usize) {}

/// Wait-claims (per-thread, not per-CPU) are left unimplemented here for the
/// same reason the original leaves `WAIT_CLAIMS_ADD`/`REMOVE` expanding to
/// nothing: there is no thread control block yet to hang the list off of.
/// `sched::thread` should add a `wait_claims: ClaimList` field and call
/// these two directly instead of going through a per-CPU table.
pub fn wait_claims_add(_lock_identity: usize, _file: &'static str, _line: u32) {}
pub fn wait_claims_remove(_lock_identity: usize) {}

#[cfg(all(test, feature = "claims"))]
mod tests {
    use super::*;

    #[test]
    fn claim_list_add_remove_roundtrip() {
        let mut list = ClaimList::empty();
        list.add(0x1000, "a.rs", 10);
        list.add(0x2000, "b.rs", 20);
        assert_eq!(list.iter().count(), 2);
        list.remove(0x1000);
        assert_eq!(list.iter().count(), 1);
        assert_eq!(list.iter().next().unwrap().lock_identity, 0x2000);
    }

    #[test]
    fn claim_list_overflow_is_dropped_not_panicking() {
        let mut list = ClaimList::empty();
        for i in 0..(CLAIM_CAPACITY + 4) {
            list.add(i, "a.rs", i as u32);
        }
        assert_eq!(list.iter().count(), CLAIM_CAPACITY);
    }
}
