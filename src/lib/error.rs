//! Kernel-wide error types.
//!
//! Core primitives never throw: they return a `KernelResult<T>` and let the
//! caller decide. Assertions that indicate a kernel-bug condition panic
//! immediately instead of returning an error (see `kassert!` in
//! [`crate::lib::debug`]).

use core::fmt;

/// High-level failure causes, used where a caller wants to match on intent
/// rather than a raw POSIX code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Busy,
    AddressInUse,
    Interrupted,
    WouldBlock,
    TimedOut,
    NotSupported,
    BadAddress,
    NotInitialized,
    NoDevice,
}

impl From<KernelError> for Errno {
    fn from(e: KernelError) -> Errno {
        match e {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EPERM,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::AlreadyExists => Errno::EEXIST,
            KernelError::Busy => Errno::EBUSY,
            KernelError::AddressInUse => Errno::EADDRINUSE,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::TimedOut => Errno::ETIMEDOUT,
            KernelError::NotSupported => Errno::ENOTSUP,
            KernelError::BadAddress => Errno::EFAULT,
            KernelError::NotInitialized => Errno::ENXIO,
            KernelError::NoDevice => Errno::ENODEV,
        }
    }
}

/// POSIX-style error numbers, the wire format every syscall and core
/// primitive returns (as `-errno`, matching the syscall ABI's convention).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOSPC = 28,
    ESPIPE = 29,
    ERANGE = 34,
    ENAMETOOLONG = 36,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ETIMEDOUT = 110,
    EADDRINUSE = 98,
    ENOTSUP = 95,
}

impl Errno {
    /// The value a syscall handler places in RAX: `-errno`.
    pub const fn as_negated_isize(self) -> isize {
        -(self as i32 as isize)
    }

    /// Recover an `Errno` from a syscall return value already negated, i.e.
    /// `-EINVAL`. Returns `None` if `v` does not correspond to a known code.
    pub fn from_negated_i32(v: i32) -> Option<Errno> {
        if v >= 0 {
            return None;
        }
        Errno::from_i32(-v)
    }

    fn from_i32(v: i32) -> Option<Errno> {
        use Errno::*;
        let known = [
            EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD, EAGAIN,
            ENOMEM, EACCES, EFAULT, EBUSY, EEXIST, ENODEV, ENOTDIR, EISDIR, EINVAL, ENFILE,
            EMFILE, ENOSPC, ESPIPE, ERANGE, ENAMETOOLONG, ENOSYS, ENOTEMPTY, ETIMEDOUT,
            EADDRINUSE, ENOTSUP,
        ];
        known.into_iter().find(|&e| e as i32 == v)
    }

    pub const fn description(self) -> &'static str {
        use Errno::*;
        match self {
            EPERM => "operation not permitted",
            ENOENT => "no such entry",
            ESRCH => "no such process",
            EINTR => "interrupted",
            EIO => "i/o error",
            ENXIO => "no such device or address",
            E2BIG => "argument list too long",
            ENOEXEC => "exec format error",
            EBADF => "bad descriptor",
            ECHILD => "no child processes",
            EAGAIN => "would block",
            ENOMEM => "out of memory",
            EACCES => "permission denied",
            EFAULT => "bad address",
            EBUSY => "device or resource busy",
            EEXIST => "already exists",
            ENODEV => "no such device",
            ENOTDIR => "not a directory",
            EISDIR => "is a directory",
            EINVAL => "invalid argument",
            ENFILE => "too many open files system-wide",
            EMFILE => "too many open files",
            ENOSPC => "no space left",
            ESPIPE => "illegal seek",
            ERANGE => "result out of range",
            ENAMETOOLONG => "name too long",
            ENOSYS => "function not implemented",
            ENOTEMPTY => "directory not empty",
            ETIMEDOUT => "timed out",
            EADDRINUSE => "address already in use",
            ENOTSUP => "not supported",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// The return type of every core primitive in this crate.
pub type KernelResult<T> = core::result::Result<T, Errno>;
