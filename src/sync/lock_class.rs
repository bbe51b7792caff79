//! Lock-class v-table: the polymorphic description of a lockable object.
//!
//! The original kernel represents this as a `struct lock_class` of raw
//! function pointers (`lc_lock`/`lc_unlock`/`lc_assert`/`lc_owner`) so that
//! lockqueues, kqueues, and assertions can all operate on "some lockable
//! thing" without knowing whether it is a spin or wait mutex. Here the same
//! uniformity comes from a trait object: `&dyn LockClass` is the v-table,
//! `RawMutex` is the one type that currently implements it.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

/// Stand-in for `thread_t *` until `sched::thread` exists. Zero means "no
/// thread" (idle / unowned), matching `CpuLocal::current_thread`'s encoding.
pub type ThreadId = u64;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        const INITIALIZED = 1 << 0;
        const DEBUG        = 1 << 1;
        const NOCLAIMS     = 1 << 2;
        const RECURSABLE   = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Spin,
    Wait,
}

/// Mirrors `MA_UNLOCKED`/`MA_LOCKED`/`MA_OWNED`/... from the original's
/// `_mtx_assert`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MtxAssert {
    Unlocked,
    Locked,
    Owned,
    NotOwned,
    Recursed,
    NotRecursed,
}

/// Only exclusive locking exists here; kept as an enum (rather than a bare
/// bool) so a future rwlock lock-class has somewhere to add `Shared`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockHow {
    Excl,
}

/// Header embedded in every lockable object: name, kind, option flags, and
/// the current recursion depth (`lo.data` in the original).
#[derive(Debug)]
pub struct LockObject {
    pub name: &'static str,
    pub kind: LockKind,
    pub flags: LockFlags,
    pub(crate) recursion: AtomicU64,
}

impl LockObject {
    pub const fn new(name: &'static str, kind: LockKind, flags: LockFlags) -> Self {
        LockObject {
            name,
            kind,
            flags: LockFlags::from_bits_truncate(flags.bits() | LockFlags::INITIALIZED.bits()),
            recursion: AtomicU64::new(0),
        }
    }

    pub fn recursion_depth(&self) -> u64 {
        self.recursion.load(Ordering::Relaxed)
    }

    /// Identity used by claim-list bookkeeping; stable because every
    /// `LockObject` this crate creates lives inside a `static` or otherwise
    /// pinned `Mutex<T>`.
    pub fn identity(&self) -> usize {
        self as *const _ as usize
    }
}

/// Uniform operations a lockqueue or kqueue can perform on any lockable
/// object without knowing its concrete lock kind.
pub trait LockClass: Sync {
    fn lock_object(&self) -> &LockObject;
    fn lc_lock(&self, how: LockHow, file: &'static str, line: u32);
    fn lc_unlock(&self, file: &'static str, line: u32);
    fn lc_assert(&self, what: MtxAssert, file: &'static str, line: u32);
    fn lc_owner(&self) -> Option<ThreadId>;
}
