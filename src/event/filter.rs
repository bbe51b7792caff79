//! Filter v-table and built-in filters for the event-notification model.
//!
//! Grounded on kevent.c's `filter_ops[NEVFILT]` registry and `f_attach`/
//! `f_detach`/`f_event` triple. The original's filters watch real objects
//! (vnodes, pipes, processes) reached through drivers and the VFS that
//! aren't part of this core; `Timer`, `Proc`, and `User` are implemented
//! here because they're self-contained (Timer only needs a tick source,
//! Proc only needs `sched::thread`, User is purely software-triggered).
//! `Read`/`Write`/`Signal`/`Vnode` stay as `Filter` discriminants with no
//! registered ops -- wiring them in is a driver/VFS concern.

use bitflags::bitflags;

use crate::sched::thread::{state_of, ThreadState};
use crate::sync::lock_class::ThreadId;
use crate::sync::mutex::Mutex;

pub const NEVFILT: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Filter {
    Read = 0,
    Write = 1,
    Timer = 2,
    Signal = 3,
    Vnode = 4,
    Proc = 5,
    User = 6,
}

impl Filter {
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EvFlags: u16 {
        const ADD     = 1 << 0;
        const DELETE  = 1 << 1;
        const ENABLE  = 1 << 2;
        const DISABLE = 1 << 3;
        const ONESHOT = 1 << 4;
        const CLEAR   = 1 << 5;
        const RECEIPT = 1 << 6;
        const ERROR   = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct KEvent {
    pub ident: usize,
    pub filter: Filter,
    pub flags: EvFlags,
    pub fflags: u32,
    pub data: i64,
    pub udata: u64,
}

/// Per-knote filter-private state. The original stores this behind an
/// opaque `kn->filt_ops_data` pointer; since the filter set here is small
/// and fixed, an enum replaces the void* plus its allocator.
#[derive(Clone, Copy, Debug)]
pub enum FilterData {
    None,
    Timer { remaining_ticks: u64, interval_ticks: u64 },
    Proc,
    User,
}

pub type AttachResult = Result<FilterData, i32>;

pub trait FilterOps: Sync {
    fn attach(&self, kev: &KEvent) -> AttachResult;
    fn detach(&self, _data: &mut FilterData) {}
    /// Evaluate readiness. `hint` is filter-specific: elapsed ticks for
    /// Timer, an exited thread id for Proc, a trigger value for User, and
    /// `0` for the plain re-poll `kqueue_wait` does before delivery.
    fn event(&self, kev: &mut KEvent, data: &mut FilterData, hint: i64) -> bool;
}

static FILTER_OPS: Mutex<[Option<&'static dyn FilterOps>; NEVFILT]> = Mutex::new_spin("kevent.filter_ops", [None; NEVFILT]);

/// Registers `ops` for `filter`. Panics on double-registration, mirroring
/// `register_filter_ops`'s `panic("filter already registered")`.
pub fn register_filter_ops(filter: Filter, ops: &'static dyn FilterOps) {
    let mut table = FILTER_OPS.lock();
    let slot = &mut table[filter.index()];
    assert!(slot.is_none(), "filter ops already registered for {:?}", filter);
    *slot = Some(ops);
}

pub fn get_filter_ops(filter: Filter) -> Option<&'static dyn FilterOps> {
    FILTER_OPS.lock()[filter.index()]
}

const ERR_ESRCH: i32 = -3;

struct TimerFilter;
struct ProcFilter;
struct UserFilter;

impl FilterOps for TimerFilter {
    fn attach(&self, kev: &KEvent) -> AttachResult {
        let interval = kev.data.max(0) as u64;
        Ok(FilterData::Timer { remaining_ticks: interval, interval_ticks: interval })
    }

    fn event(&self, kev: &mut KEvent, data: &mut FilterData, hint: i64) -> bool {
        let FilterData::Timer { remaining_ticks, interval_ticks } = data else { return false };
        if hint == 0 {
            // Plain re-poll: report whatever the last tick pass left behind.
            return *remaining_ticks == 0;
        }
        let elapsed = hint as u64;
        if *remaining_ticks > elapsed {
            *remaining_ticks -= elapsed;
            return false;
        }
        kev.data += 1;
        *remaining_ticks = if kev.flags.contains(EvFlags::ONESHOT) || *interval_ticks == 0 { 0 } else { *interval_ticks };
        true
    }
}

impl FilterOps for ProcFilter {
    fn attach(&self, kev: &KEvent) -> AttachResult {
        if state_of(kev.ident as ThreadId) == ThreadState::Empty {
            return Err(ERR_ESRCH);
        }
        Ok(FilterData::Proc)
    }

    fn event(&self, kev: &mut KEvent, _data: &mut FilterData, hint: i64) -> bool {
        if hint < 0 || hint as u64 != kev.ident as u64 {
            return false;
        }
        kev.data = hint;
        true
    }
}

impl FilterOps for UserFilter {
    fn attach(&self, _kev: &KEvent) -> AttachResult {
        Ok(FilterData::User)
    }

    fn event(&self, kev: &mut KEvent, _data: &mut FilterData, hint: i64) -> bool {
        if hint == 0 {
            return false;
        }
        kev.fflags |= hint as u32;
        true
    }
}

static TIMER_FILTER: TimerFilter = TimerFilter;
static PROC_FILTER: ProcFilter = ProcFilter;
static USER_FILTER: UserFilter = UserFilter;

/// Registers the built-in filters. Unlike `register_filter_ops`, repeat
/// calls are harmless no-ops rather than a panic, since this is bootstrap
/// plumbing that may legitimately run more than once (once per test, for
/// instance) rather than a one-shot driver registration.
pub fn register_builtin_filters() {
    let mut table = FILTER_OPS.lock();
    if table[Filter::Timer.index()].is_none() {
        table[Filter::Timer.index()] = Some(&TIMER_FILTER as &dyn FilterOps);
    }
    if table[Filter::Proc.index()].is_none() {
        table[Filter::Proc.index()] = Some(&PROC_FILTER as &dyn FilterOps);
    }
    if table[Filter::User.index()].is_none() {
        table[Filter::User.index()] = Some(&USER_FILTER as &dyn FilterOps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_filter_fires_after_interval_and_reloads() {
        register_builtin_filters();
        let mut kev = KEvent { ident: 1, filter: Filter::Timer, flags: EvFlags::empty(), fflags: 0, data: 5, udata: 0 };
        let ops = get_filter_ops(Filter::Timer).unwrap();
        let mut data = ops.attach(&kev).unwrap();
        assert!(!ops.event(&mut kev, &mut data, 3));
        assert!(ops.event(&mut kev, &mut data, 2));
        assert_eq!(kev.data, 6);
        let FilterData::Timer { remaining_ticks, .. } = data else { panic!() };
        assert_eq!(remaining_ticks, 5);
    }

    #[test]
    fn timer_filter_oneshot_does_not_reload() {
        register_builtin_filters();
        let mut kev = KEvent { ident: 2, filter: Filter::Timer, flags: EvFlags::ONESHOT, fflags: 0, data: 1, udata: 0 };
        let ops = get_filter_ops(Filter::Timer).unwrap();
        let mut data = ops.attach(&kev).unwrap();
        assert!(ops.event(&mut kev, &mut data, 1));
        let FilterData::Timer { remaining_ticks, .. } = data else { panic!() };
        assert_eq!(remaining_ticks, 0);
    }

    #[test]
    fn user_filter_fires_only_on_nonzero_trigger() {
        register_builtin_filters();
        let mut kev = KEvent { ident: 7, filter: Filter::User, flags: EvFlags::empty(), fflags: 0, data: 0, udata: 0 };
        let ops = get_filter_ops(Filter::User).unwrap();
        let mut data = ops.attach(&kev).unwrap();
        assert!(!ops.event(&mut kev, &mut data, 0));
        assert!(ops.event(&mut kev, &mut data, 0x4));
        assert_eq!(kev.fflags, 0x4);
    }
}
