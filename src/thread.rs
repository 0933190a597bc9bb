//! Thread lifecycle, scheduling priority, and the per-thread signal-flag
//! mailbox.
//!
//! A `Thread` never lives behind a pointer the caller owns directly — the
//! [`crate::scheduler`] singleton owns every thread's storage in a
//! fixed-capacity slot array, and callers interact with threads through the
//! small, `Copy` [`ThreadHandle`]. This mirrors the teacher's own split
//! between `Thread` (owned storage) and a `ThreadId` used everywhere else.

use core::fmt;

use crate::error::{KernelError, KernelResult};
use crate::port::port;
use crate::scheduler;

/// Upper bound on live threads. Sized for a memory-constrained device;
/// raise it if your board needs more concurrent threads.
pub const MAX_THREADS: usize = 64;

/// A stable, small identifier for a thread. Indexes the scheduler's slot
/// array, so it never changes for a thread's whole lifetime — the Rust
/// stand-in for "Identity: stable address" in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Lifecycle state. See the state machine table this type implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    Ready,
    Running,
    Suspended,
    Terminated,
    Destroyed,
}

/// Scheduling priority. Higher numeric value runs first.
///
/// `NONE` is a sentinel that must never be stored on a live thread;
/// `IDLE` sits one level below the lowest user-assignable priority and is
/// reserved for the reaper/idle thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(i8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const HIGHEST: Priority = Priority(31);
    pub const IDLE: Priority = Priority(-1);
    /// Sentinel: never valid on a live thread, only ever returned as an
    /// error value from a failing priority getter.
    pub const NONE: Priority = Priority(i8::MIN);

    pub const fn new(level: i8) -> Self {
        Priority(level)
    }

    pub const fn get(self) -> i8 {
        self.0
    }

}

/// Why the last `suspend()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    Ok,
    Interrupted,
    TimedOut,
}

/// Selects how [`sig_wait`] evaluates the requested bits against the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigWaitMode {
    /// All requested bits must be set.
    All,
    /// At least one requested bit must be set (or, when `mask == 0`, any bit
    /// at all).
    Any,
}

/// Backing storage for a thread's stack.
///
/// The source's "either caller-provided or dynamically allocated" duality,
/// expressed as an owned enum instead of an `owns_storage` flag next to a
/// raw pointer.
pub enum Stack {
    Owned(alloc::boxed::Box<[u8]>),
    Borrowed(&'static mut [u8]),
}

impl Stack {
    pub fn len(&self) -> usize {
        match self {
            Stack::Owned(b) => b.len(),
            Stack::Borrowed(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: &'static str,
    pub(crate) state: ThreadState,
    pub(crate) priority: Priority,
    pub(crate) stack: Stack,
    pub(crate) sig_mask: u32,
    pub(crate) wakeup_reason: WakeupReason,
    pub(crate) exit_value: Option<i32>,
    pub(crate) joiner: Option<ThreadId>,
    pub(crate) detached: bool,
    /// Set while linked on an [`crate::wait_list::IntrusiveWaitList`]; used
    /// only to assert the "no double enrollment" invariant.
    pub(crate) enrolled_on_wait_list: bool,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: &'static str, priority: Priority, stack: Stack) -> Self {
        Thread {
            id,
            name,
            state: ThreadState::Ready,
            priority,
            stack,
            sig_mask: 0,
            wakeup_reason: WakeupReason::Ok,
            exit_value: None,
            joiner: None,
            detached: false,
            enrolled_on_wait_list: false,
        }
    }
}

/// A small, `Copy` reference to a scheduler-owned thread. This is the public
/// surface applications use; it never outlives the fact that its id is a
/// valid slot (operations on a stale id fail with [`KernelError::NoSuchThread`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(pub(crate) ThreadId);

impl ThreadHandle {
    /// Spawns a thread with a heap-allocated stack of `stack_bytes` bytes.
    ///
    /// Preconditions (violations panic — construction-time contract
    /// violations are fatal, not a `Result`, per the error handling design):
    /// not called from handler mode; `priority != Priority::NONE`.
    pub fn spawn(
        name: &'static str,
        priority: Priority,
        stack_bytes: usize,
        entry: impl FnOnce() -> i32 + Send + 'static,
    ) -> ThreadHandle {
        let stack = Stack::Owned(alloc::vec![0u8; stack_bytes].into_boxed_slice());
        Self::spawn_with_stack(name, priority, stack, entry)
    }

    /// Spawns a thread backed by caller-provided storage instead of an
    /// allocation.
    pub fn spawn_borrowed_stack(
        name: &'static str,
        priority: Priority,
        stack: &'static mut [u8],
        entry: impl FnOnce() -> i32 + Send + 'static,
    ) -> ThreadHandle {
        Self::spawn_with_stack(name, priority, Stack::Borrowed(stack), entry)
    }

    fn spawn_with_stack(
        name: &'static str,
        priority: Priority,
        stack: Stack,
        entry: impl FnOnce() -> i32 + Send + 'static,
    ) -> ThreadHandle {
        assert!(
            !port().in_handler_mode(),
            "Thread::spawn is not callable from interrupt context"
        );
        assert!(
            priority != Priority::NONE,
            "Thread::spawn requires a priority other than Priority::NONE"
        );
        let id = scheduler::register(name, priority, stack, alloc::boxed::Box::new(entry));
        log::debug!("{name} ({id}) spawned at priority {}", priority.get());
        ThreadHandle(id)
    }

    /// The thread currently running on this processor.
    pub fn current() -> ThreadHandle {
        ThreadHandle(scheduler::current_id())
    }

    pub fn id(&self) -> ThreadId {
        self.0
    }

    /// Reads the thread's scheduling priority. `EPERM` from handler mode;
    /// `ESRCH` if the thread no longer exists. The source returns a
    /// synthetic `priority::error` sentinel from a non-`Result` getter for
    /// the same failure; this crate surfaces it as `Err` instead, matching
    /// every other fallible entry point.
    pub fn priority(&self) -> KernelResult<Priority> {
        if port().in_handler_mode() {
            return Err(KernelError::Perm);
        }
        scheduler::with_thread(self.0, |t| t.priority).ok_or(KernelError::NoSuchThread)
    }

    /// Changes the thread's scheduling priority. Observed by the scheduler
    /// at the next scheduling decision, not necessarily immediately.
    pub fn set_priority(&self, priority: Priority) -> KernelResult<()> {
        if port().in_handler_mode() {
            return Err(KernelError::Perm);
        }
        if priority == Priority::NONE {
            return Err(KernelError::Inval);
        }
        scheduler::with_thread_mut(self.0, |t| t.priority = priority)
            .ok_or(KernelError::NoSuchThread)
    }

    /// Blocks the caller until this thread terminates, writing its exit
    /// value into `out` if given. Joining oneself is `EDEADLK`.
    pub fn join(&self, out: Option<&mut i32>) -> KernelResult<()> {
        if self.0 == ThreadHandle::current().0 {
            return Err(KernelError::DeadLock);
        }
        loop {
            let already_done = scheduler::with_critical_section(|cs| {
                scheduler::with_thread_mut_cs(cs, self.0, |t| {
                    if t.state == ThreadState::Terminated || t.state == ThreadState::Destroyed {
                        Some(t.exit_value.unwrap_or(0))
                    } else {
                        t.joiner = Some(ThreadHandle::current().0);
                        None
                    }
                })
            })
            .ok_or(KernelError::NoSuchThread)?;

            if let Some(exit_value) = already_done {
                if let Some(slot) = out {
                    *slot = exit_value;
                }
                return Ok(());
            }

            suspend();
            if interrupted() {
                return Err(KernelError::Intr);
            }
        }
    }

    /// Marks the thread non-joinable; its storage is reclaimed as soon as it
    /// terminates instead of waiting for a joiner.
    pub fn detach(&self) {
        let _ = scheduler::with_thread_mut(self.0, |t| t.detached = true);
    }

    /// Forcibly transitions the thread to `Inactive`. No user-resource
    /// cleanup is performed.
    pub fn kill(&self) {
        scheduler::kill(self.0);
    }

    /// `cancel()`: wakes the thread with reason `Interrupted` if it is
    /// currently suspended. Returns `Ok` unconditionally, matching the
    /// stub contract — this crate attaches no POSIX cleanup-handler
    /// semantics to it (an explicit non-goal).
    pub fn interrupt(&self) -> KernelResult<()> {
        scheduler::wakeup_with_reason(self.0, WakeupReason::Interrupted);
        Ok(())
    }

    /// `sig_raise`: ORs `mask` into the mailbox and wakes the thread.
    /// Callable from interrupt context.
    pub fn sig_raise(&self, mask: u32) -> KernelResult<u32> {
        if mask == 0 {
            return Err(KernelError::Inval);
        }
        let old = scheduler::with_critical_section(|cs| {
            scheduler::with_thread_mut_cs(cs, self.0, |t| {
                let old = t.sig_mask;
                t.sig_mask |= mask;
                old
            })
        })
        .ok_or(KernelError::NoSuchThread)?;
        scheduler::wakeup_with_reason(self.0, WakeupReason::Ok);
        Ok(old)
    }

    /// `sig_clear`: ANDs `!mask` into the mailbox. Not callable from
    /// interrupt context.
    pub fn sig_clear(&self, mask: u32) -> KernelResult<u32> {
        if mask == 0 {
            return Err(KernelError::Inval);
        }
        if port().in_handler_mode() {
            return Err(KernelError::Perm);
        }
        scheduler::with_thread_mut(self.0, |t| {
            let old = t.sig_mask;
            t.sig_mask &= !mask;
            old
        })
        .ok_or(KernelError::NoSuchThread)
    }

    /// `sig_get`: returns `sig_mask & mask` (the whole mask when `mask ==
    /// 0`), optionally clearing the selected bits. Not callable from
    /// interrupt context — only `sig_raise` is in the ISR-safe whitelist.
    pub fn sig_get(&self, mask: u32, clear: bool) -> KernelResult<u32> {
        if port().in_handler_mode() {
            return Err(KernelError::Perm);
        }
        scheduler::with_thread_mut(self.0, |t| {
            let selected = if mask == 0 { t.sig_mask } else { t.sig_mask & mask };
            if clear {
                t.sig_mask &= !selected;
            }
            selected
        })
        .ok_or(KernelError::NoSuchThread)
    }
}

fn mask_hit(sig_mask: u32, mask: u32) -> u32 {
    if mask == 0 {
        sig_mask
    } else {
        sig_mask & mask
    }
}

fn mask_satisfied(sig_mask: u32, mask: u32, mode: SigWaitMode) -> bool {
    if mask == 0 {
        // "any nonzero bit", independent of mode.
        return sig_mask != 0;
    }
    match mode {
        SigWaitMode::All => (sig_mask & mask) == mask,
        SigWaitMode::Any => mask_hit(sig_mask, mask) != 0,
    }
}

/// Blocks the calling thread until its own signal mailbox satisfies `mode`
/// against `mask`, then clears the matched bits and returns the pre-clear
/// snapshot.
///
/// Only the owning thread ever waits on its own mailbox, so this does not
/// enroll on a shared [`crate::wait_list::IntrusiveWaitList`] — it suspends
/// directly and re-evaluates on every resume, exactly like a `sig_wait`
/// retry loop around `try_sig_wait`.
pub fn sig_wait(mask: u32, mode: SigWaitMode) -> KernelResult<u32> {
    loop {
        match try_sig_wait(mask, mode) {
            Ok(snapshot) => return Ok(snapshot),
            Err(KernelError::Again) => {}
            Err(e) => return Err(e),
        }
        suspend();
        if interrupted() {
            return Err(KernelError::Intr);
        }
    }
}

/// Single-shot, non-blocking check of the calling thread's own mailbox.
///
/// On success, the returned value is the full mailbox snapshot *before*
/// clearing (not just the requested bits) — only the bits that actually
/// matched `mask` are cleared, matching the source's "pre-clear snapshot /
/// remaining mask" contract.
pub fn try_sig_wait(mask: u32, mode: SigWaitMode) -> KernelResult<u32> {
    let current = ThreadHandle::current().0;
    scheduler::with_thread_mut(current, |t| {
        if mask_satisfied(t.sig_mask, mask, mode) {
            let snapshot = t.sig_mask;
            let hit = mask_hit(t.sig_mask, mask);
            t.sig_mask &= !hit;
            Some(snapshot)
        } else {
            None
        }
    })
    .flatten()
    .ok_or(KernelError::Again)
}

/// As [`sig_wait`] but bounded by `ticks` (`0` is treated as `1`).
pub fn timed_sig_wait(mask: u32, mode: SigWaitMode, ticks: u64) -> KernelResult<u32> {
    let ticks = ticks.max(1);
    let deadline = port().now_ticks().wrapping_add(ticks);
    loop {
        match try_sig_wait(mask, mode) {
            Ok(snapshot) => return Ok(snapshot),
            Err(KernelError::Again) => {}
            Err(e) => return Err(e),
        }
        let now = port().now_ticks();
        if now.wrapping_sub(deadline) < (u64::MAX / 2) {
            // now has reached or passed deadline (modular comparison)
            return Err(KernelError::TimedOut);
        }
        let remaining = deadline.wrapping_sub(now);
        scheduler::suspend_current_timeout(remaining.max(1));
        if interrupted() {
            return Err(KernelError::Intr);
        }
    }
}

/// Callable only by the thread itself. Idempotent: a second call on an
/// already-terminated thread returns silently without running `entry` again
/// (there is nothing left to run — this is only reached via the
/// `invoke_with_exit` proxy or an explicit call from within `entry`).
pub fn exit(value: i32) -> ! {
    scheduler::exit_current(value)
}

/// Suspends the calling thread until [`wakeup`] (or an equivalent, such as
/// `sig_raise` or `interrupt`) is called on it. Not callable from interrupt
/// context.
pub fn suspend() {
    assert!(!port().in_handler_mode(), "suspend() is not callable from interrupt context");
    scheduler::suspend_current();
}

/// Marks `target` ready with reason `Ok`. Interrupt-safe.
pub fn wakeup(target: ThreadId) {
    scheduler::wakeup_with_reason(target, WakeupReason::Ok);
}

/// Whether the calling thread's last suspension ended due to interruption
/// rather than a normal wakeup. Consumed by the caller on the next loop
/// iteration of a wait.
pub fn interrupted() -> bool {
    let current = ThreadHandle::current().0;
    scheduler::with_thread(current, |t| t.wakeup_reason == WakeupReason::Interrupted)
        .unwrap_or(false)
}

/// Whether the calling thread's last suspension timed out.
pub fn timed_out() -> bool {
    let current = ThreadHandle::current().0;
    scheduler::with_thread(current, |t| t.wakeup_reason == WakeupReason::TimedOut)
        .unwrap_or(false)
}

/// Marks `id` as linked on a wait list. Asserts the "a thread is linked on
/// at most one wait list at any observable moment" invariant.
pub(crate) fn mark_enrolled_on_wait_list(id: ThreadId) {
    scheduler::with_thread_mut(id, |t| {
        debug_assert!(!t.enrolled_on_wait_list, "thread enrolled on two wait lists at once");
        t.enrolled_on_wait_list = true;
    });
}

/// Idempotent: safe to call even if the thread was already detached (e.g.
/// by `wakeup_one`, with the guard detaching again on drop).
pub(crate) fn mark_detached_from_wait_list(id: ThreadId) {
    scheduler::with_thread_mut(id, |t| {
        t.enrolled_on_wait_list = false;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::install_sim_port;

    #[test]
    fn priority_ordering_is_total() {
        assert!(Priority::IDLE < Priority::LOWEST);
        assert!(Priority::LOWEST < Priority::HIGHEST);
    }

    #[test]
    fn spawn_runs_entry_and_join_observes_exit_value() {
        install_sim_port();
        let handle = ThreadHandle::spawn("worker", Priority::new(10), 16 * 1024, || 42);
        let mut out = 0i32;
        handle.join(Some(&mut out)).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn join_self_is_deadlock() {
        install_sim_port();
        let handle = ThreadHandle::current();
        assert_eq!(handle.join(None), Err(KernelError::DeadLock));
    }

    #[test]
    fn sig_raise_is_idempotent() {
        install_sim_port();
        let handle = ThreadHandle::current();
        handle.sig_raise(0b0011).unwrap();
        handle.sig_raise(0b0011).unwrap();
        assert_eq!(handle.sig_get(0, false).unwrap(), 0b0011);
    }

    #[test]
    fn sig_get_clear_symmetry() {
        install_sim_port();
        let handle = ThreadHandle::current();
        handle.sig_raise(0b0101).unwrap();
        assert_eq!(handle.sig_get(0b0101, true).unwrap(), 0b0101);
        assert_eq!(handle.sig_get(0b0101, true).unwrap(), 0);
    }

    #[test]
    fn sig_wait_all_vs_any() {
        install_sim_port();
        let handle = ThreadHandle::current();
        handle.sig_raise(0b0011).unwrap();
        // Not all of 0b0101 are set yet (bit 2 missing).
        assert_eq!(try_sig_wait(0b0101, SigWaitMode::All), Err(KernelError::Again));
        handle.sig_raise(0b0100).unwrap();
        let snapshot = try_sig_wait(0b0101, SigWaitMode::All).unwrap();
        assert_eq!(snapshot, 0b0111);
        assert_eq!(handle.sig_get(0, false).unwrap(), 0b0010);
    }

    #[test]
    fn try_sig_wait_mask_zero_means_any_nonzero_bit_regardless_of_mode() {
        install_sim_port();
        let handle = ThreadHandle::current();
        // Empty mailbox: `mask == 0` must not be trivially satisfied for
        // `All`, only for an actually nonzero mailbox.
        assert_eq!(try_sig_wait(0, SigWaitMode::All), Err(KernelError::Again));
        assert_eq!(try_sig_wait(0, SigWaitMode::Any), Err(KernelError::Again));
        handle.sig_raise(0b0001).unwrap();
        assert_eq!(try_sig_wait(0, SigWaitMode::All).unwrap(), 0b0001);
    }
}
