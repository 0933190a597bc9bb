//! Error taxonomy for the kernel core.
//!
//! Every fallible entry point returns [`KernelResult`]. The variants mirror
//! the POSIX errno set named in the port-layer contract; there is
//! deliberately no catch-all `Other` variant, since every failure this crate
//! can produce is one of these kinds (see the error handling design: a
//! construction-time contract violation is a `panic!`, not a `KernelError`).

use core::fmt;

/// A kernel-level failure, one of the POSIX errno codes this crate surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// `EPERM` — the call is not permitted in the current context (e.g. from
    /// interrupt/handler mode).
    Perm,
    /// `EINVAL` — an argument violates a documented precondition.
    Inval,
    /// `EMSGSIZE` — a message is larger than the queue's per-message capacity.
    MsgSize,
    /// `EAGAIN` — a non-blocking call found the resource unavailable.
    Again,
    /// `EINTR` — a blocking call was cancelled before it completed.
    Intr,
    /// `ETIMEDOUT` — a timed blocking call's deadline elapsed first.
    TimedOut,
    /// `EDEADLK` — the call would deadlock the caller against itself.
    DeadLock,
    /// `ESRCH` — the referenced thread does not exist.
    NoSuchThread,
    /// `ENOTRECOVERABLE` — an invariant was violated; indicates a bug.
    NotRecoverable,
}

/// Shorthand for this crate's `Result` type.
pub type KernelResult<T = ()> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::Perm => "operation not permitted",
            KernelError::Inval => "invalid argument",
            KernelError::MsgSize => "message too long for queue",
            KernelError::Again => "resource temporarily unavailable",
            KernelError::Intr => "interrupted",
            KernelError::TimedOut => "timed out",
            KernelError::DeadLock => "resource deadlock would occur",
            KernelError::NoSuchThread => "no such thread",
            KernelError::NotRecoverable => "state not recoverable",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
impl std::error::Error for KernelError {}
