//! kqueue / knote / knlist: registration, activation, and
//! timed waiting, grounded on kevent.c's `kqueue_register`/
//! `knlist_activate_notes`/`kqueue_wait`.
//!
//! The original gives every watched object (a vnode, a pipe, a process) its
//! own `struct knlist` pointing back at whichever lock protects that
//! object, so one object's knotes can be shared across many kqueues. None
//! of those objects exist in this core, so the two built-in lists folded
//! into a single `Kqueue` -- `attached` (not currently firing) and `active`
//! (ready for delivery) -- stand in for both the per-object knlist and the
//! per-kqueue active list at once. `Timer`/`Proc`/`User` knotes are
//! effectively "attached to the kqueue itself" rather than to an external
//! object's knlist, which is the piece of fidelity this simplification
//! costs.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::sync::lock_class::ThreadId;
use crate::sync::mutex::Mutex;

use super::filter::{get_filter_ops, EvFlags, Filter, FilterData, FilterOps};
pub use super::filter::KEvent;

const ERR_ENOENT: i32 = -2;
const ERR_EINVAL: i32 = -22;

struct Knote {
    event: KEvent,
    filt_ops: &'static dyn FilterOps,
    data: FilterData,
}

/// A list of knotes sharing a home (either "not yet firing" or "ready for
/// delivery"). Plain `Vec` scan-and-remove in place of the original's
/// intrusive doubly-linked list; knote counts per kqueue are small enough
/// that this doesn't matter.
struct Knlist {
    notes: Vec<Knote>,
}

impl Knlist {
    const fn new() -> Self {
        Knlist { notes: Vec::new() }
    }

    fn find(&self, ident: usize, filter: Filter) -> Option<usize> {
        self.notes.iter().position(|kn| kn.event.ident == ident && kn.event.filter == filter)
    }
}

struct KqueueState {
    attached: Knlist,
    active: Knlist,
}

pub struct Kqueue {
    state: Mutex<KqueueState>,
}

static LIVE_KQUEUES: Mutex<Vec<Weak<Kqueue>>> = Mutex::new_spin("kevent.registry", Vec::new());

impl Kqueue {
    pub fn new() -> Arc<Kqueue> {
        let kq = Arc::new(Kqueue {
            state: Mutex::new_wait("kqueue", KqueueState { attached: Knlist::new(), active: Knlist::new() }),
        });
        LIVE_KQUEUES.lock().push(Arc::downgrade(&kq));
        kq
    }

    fn wait_key(&self) -> usize {
        self as *const _ as usize
    }

    /// `kqueue_register`: handles EV_DELETE, EV_ADD, and in-place updates,
    /// then re-evaluates the (possibly new) knote once so a condition
    /// that's already true is delivered without waiting for the next
    /// activation.
    pub fn register(&self, kev: &KEvent) -> Result<(), i32> {
        {
            let mut state = self.state.lock();
            let existing = state
                .attached
                .find(kev.ident, kev.filter)
                .map(|i| (false, i))
                .or_else(|| state.active.find(kev.ident, kev.filter).map(|i| (true, i)));

            if kev.flags.contains(EvFlags::DELETE) {
                let Some((in_active, idx)) = existing else { return Err(ERR_ENOENT) };
                let list = if in_active { &mut state.active } else { &mut state.attached };
                let mut kn = list.notes.remove(idx);
                kn.filt_ops.detach(&mut kn.data);
                return Ok(());
            }

            match existing {
                None => {
                    if !kev.flags.contains(EvFlags::ADD) {
                        return Err(ERR_ENOENT);
                    }
                    let Some(ops) = get_filter_ops(kev.filter) else { return Err(ERR_EINVAL) };
                    let data = ops.attach(kev)?;
                    state.attached.notes.push(Knote { event: *kev, filt_ops: ops, data });
                }
                Some((in_active, idx)) => {
                    let list = if in_active { &mut state.active } else { &mut state.attached };
                    let kn = &mut list.notes[idx];
                    if kev.flags.contains(EvFlags::ENABLE) {
                        kn.event.flags.remove(EvFlags::DISABLE);
                    }
                    if kev.flags.contains(EvFlags::DISABLE) {
                        kn.event.flags.insert(EvFlags::DISABLE);
                    }
                    if kev.flags.contains(EvFlags::CLEAR) {
                        kn.event.flags.insert(EvFlags::CLEAR);
                    }
                    kn.event.udata = kev.udata;
                    kn.event.fflags = kev.fflags;
                }
            }
        }

        self.activate_matching(kev.filter, Some(kev.ident), 0);
        Ok(())
    }

    /// `knlist_activate_notes`: re-evaluates every attached knote matching
    /// `filter` (and `ident`, when given) against `hint`; the ones that
    /// fire move from `attached` to `active` and the kqueue's waiters are
    /// woken. Returns how many fired.
    fn activate_matching(&self, filter: Filter, ident: Option<usize>, hint: i64) -> usize {
        let mut activated = 0;
        {
            let mut state = self.state.lock();
            let mut i = 0;
            while i < state.attached.notes.len() {
                let kn = &mut state.attached.notes[i];
                let matches = kn.event.filter == filter && ident.map_or(true, |id| kn.event.ident == id);
                if matches && kn.filt_ops.event(&mut kn.event, &mut kn.data, hint) {
                    let kn = state.attached.notes.remove(i);
                    state.active.notes.push(kn);
                    activated += 1;
                } else {
                    i += 1;
                }
            }
        }
        if activated > 0 {
            crate::sched::queue::wake_all(self.wait_key());
        }
        activated
    }

    /// `kqueue_wait`: applies `changes` (honoring EV_RECEIPT error
    /// reporting), then drains ready events into `events`, blocking with
    /// `timeout_ticks` (`None` = forever, `Some(0)` = poll) if nothing was
    /// immediately ready.
    pub fn wait(&self, changes: &mut [KEvent], events: &mut [KEvent], timeout_ticks: Option<u64>) -> Result<usize, i32> {
        let mut receipt_count = 0;
        for kev in changes.iter_mut() {
            if let Err(errno) = self.register(kev) {
                if kev.flags.contains(EvFlags::RECEIPT) {
                    kev.flags = EvFlags::ERROR;
                    kev.data = -errno as i64;
                    receipt_count += 1;
                } else {
                    return Err(errno);
                }
            }
        }
        if receipt_count > 0 {
            return Ok(receipt_count);
        }
        if events.is_empty() {
            return Ok(0);
        }

        loop {
            let count = self.drain_active(events);
            if count > 0 || timeout_ticks == Some(0) {
                return Ok(count);
            }
            if !crate::sched::sleep_on_channel_timeout(self.wait_key(), timeout_ticks) {
                return Ok(0);
            }
        }
    }

    /// Re-checks every active knote; fired ones are copied into `events`
    /// (one-shot ones detached and dropped, clear-mode ones zeroed),
    /// everything else -- ready or not -- goes back to `attached` so it's
    /// considered again on the next activation or drain.
    fn drain_active(&self, events: &mut [KEvent]) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        let mut i = 0;
        while i < state.active.notes.len() && count < events.len() {
            if state.active.notes[i].event.flags.contains(EvFlags::DISABLE) {
                i += 1;
                continue;
            }

            let fire = {
                let kn = &mut state.active.notes[i];
                kn.filt_ops.event(&mut kn.event, &mut kn.data, 0)
            };
            let mut kn = state.active.notes.remove(i);

            if !fire {
                state.attached.notes.push(kn);
                continue;
            }

            events[count] = kn.event;
            count += 1;
            if kn.event.flags.contains(EvFlags::ONESHOT) {
                kn.filt_ops.detach(&mut kn.data);
            } else {
                if kn.event.flags.contains(EvFlags::CLEAR) {
                    kn.event.data = 0;
                }
                state.attached.notes.push(kn);
            }
        }
        count
    }
}

fn for_each_live_kqueue(mut f: impl FnMut(&Kqueue)) {
    let mut registry = LIVE_KQUEUES.lock();
    registry.retain(|w| w.strong_count() > 0);
    for w in registry.iter() {
        if let Some(kq) = w.upgrade() {
            f(&kq);
        }
    }
}

/// Drives every live kqueue's Timer knotes forward by `elapsed_ticks`.
/// Meant to be called from the scheduler's timer-tick path once a real
/// tick source is wired in; exposed standalone so it can be driven
/// directly until then.
pub fn kqueue_tick(elapsed_ticks: u64) {
    for_each_live_kqueue(|kq| {
        kq.activate_matching(Filter::Timer, None, elapsed_ticks as i64);
    });
}

/// Notifies every live kqueue's Proc knotes that thread `tid` exited.
/// The natural caller is `sched::sched`'s `SchedReason::Exited` path, not
/// wired in yet since that would couple the scheduler to kqueues.
pub fn notify_proc_exit(tid: ThreadId) {
    for_each_live_kqueue(|kq| {
        kq.activate_matching(Filter::Proc, None, tid as i64);
    });
}

/// Software-triggers User knotes watching `ident`, like `NOTE_TRIGGER`.
pub fn trigger_user_event(ident: usize, fflags: u32) {
    for_each_live_kqueue(|kq| {
        kq.activate_matching(Filter::User, Some(ident), fflags as i64);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::filter::register_builtin_filters;

    fn add_kev(ident: usize, filter: Filter, flags: EvFlags, data: i64) -> KEvent {
        KEvent { ident, filter, flags: flags | EvFlags::ADD, fflags: 0, data, udata: 0 }
    }

    #[test]
    fn register_add_then_delete_round_trips() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let kev = add_kev(42, Filter::User, EvFlags::empty(), 0);
        kq.register(&kev).unwrap();
        assert_eq!(kq.state.lock().attached.notes.len(), 1);

        let del = KEvent { ident: 42, filter: Filter::User, flags: EvFlags::DELETE, fflags: 0, data: 0, udata: 0 };
        kq.register(&del).unwrap();
        assert_eq!(kq.state.lock().attached.notes.len(), 0);
    }

    #[test]
    fn register_delete_without_existing_knote_is_enoent() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let del = KEvent { ident: 1, filter: Filter::User, flags: EvFlags::DELETE, fflags: 0, data: 0, udata: 0 };
        assert_eq!(kq.register(&del), Err(ERR_ENOENT));
    }

    #[test]
    fn register_unknown_filter_is_einval() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let kev = add_kev(1, Filter::Read, EvFlags::empty(), 0);
        assert_eq!(kq.register(&kev), Err(ERR_EINVAL));
    }

    #[test]
    fn trigger_user_event_moves_knote_to_active_and_wait_delivers_it() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let kev = add_kev(99, Filter::User, EvFlags::empty(), 0);
        kq.register(&kev).unwrap();
        assert_eq!(kq.state.lock().active.notes.len(), 0);

        trigger_user_event(99, 0x1);
        assert_eq!(kq.state.lock().active.notes.len(), 1);

        let mut events = [KEvent { ident: 0, filter: Filter::User, flags: EvFlags::empty(), fflags: 0, data: 0, udata: 0 }; 1];
        let n = kq.wait(&mut [], &mut events, Some(0)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fflags, 0x1);
    }

    #[test]
    fn oneshot_knote_is_not_returned_to_attached_after_delivery() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let kev = add_kev(7, Filter::User, EvFlags::ONESHOT, 0);
        kq.register(&kev).unwrap();
        trigger_user_event(7, 0x2);

        let mut events = [KEvent { ident: 0, filter: Filter::User, flags: EvFlags::empty(), fflags: 0, data: 0, udata: 0 }; 1];
        let n = kq.wait(&mut [], &mut events, Some(0)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(kq.state.lock().attached.notes.len(), 0);
        assert_eq!(kq.state.lock().active.notes.len(), 0);
    }

    #[test]
    fn ev_receipt_reports_error_in_changelist_without_failing_wait() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let mut changes = [KEvent { ident: 1, filter: Filter::Read, flags: EvFlags::ADD | EvFlags::RECEIPT, fflags: 0, data: 0, udata: 0 }];
        let mut events: [KEvent; 0] = [];
        let n = kq.wait(&mut changes, &mut events, Some(0)).unwrap();
        assert_eq!(n, 1);
        assert!(changes[0].flags.contains(EvFlags::ERROR));
        assert_eq!(changes[0].data, 22);
    }

    #[test]
    fn poll_with_zero_timeout_returns_immediately_when_nothing_ready() {
        register_builtin_filters();
        let kq = Kqueue::new();
        let mut events = [KEvent { ident: 0, filter: Filter::User, flags: EvFlags::empty(), fflags: 0, data: 0, udata: 0 }; 1];
        let n = kq.wait(&mut [], &mut events, Some(0)).unwrap();
        assert_eq!(n, 0);
    }
}
