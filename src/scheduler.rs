//! The global scheduler singleton: thread storage, the terminated-thread
//! reaper list, and the handful of mutators every other component in this
//! crate goes through.
//!
//! Grounded on the teacher's `scheduler/mod.rs` (`static SCHEDULER:
//! Mutex<Option<Scheduler>>`, `Scheduler{threads, ready_queue,
//! next_thread_id}`) for the overall singleton shape. This rewrite
//! deliberately does not adopt the sibling `sched_core.rs`/`traits.rs`
//! pluggable-policy split (`Box<dyn Scheduler>`): the spec names one fixed
//! priority-plus-FIFO policy, so the extra indirection has nothing to buy.
//! The ready-queue lookup is a linear scan over a `heapless::Vec`, matching
//! the teacher's own accepted-linear-scan approach for small thread counts.

use core::cell::RefCell;

use alloc::boxed::Box;
use heapless::Vec as HVec;

use crate::port::port;
use crate::thread::{Priority, Stack, Thread, ThreadHandle, ThreadId, ThreadState, WakeupReason, MAX_THREADS};

pub(crate) struct Scheduler {
    slots: [Option<Thread>; MAX_THREADS],
    /// Threads that have transitioned to `Terminated` but not yet been
    /// destroyed by the reaper. Drained by [`reap`] / [`idle_step`].
    terminated: HVec<ThreadId, MAX_THREADS>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            slots: [const { None }; MAX_THREADS],
            terminated: HVec::new(),
        }
    }

    fn alloc_slot(&self) -> usize {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .unwrap_or_else(|| panic!("rorqual_kernel_core: MAX_THREADS ({MAX_THREADS}) exceeded"))
    }

    fn destroy_slot(&mut self, id: ThreadId) {
        self.slots[id.0] = None;
    }
}

static SCHEDULER: critical_section::Mutex<RefCell<Scheduler>> =
    critical_section::Mutex::new(RefCell::new(Scheduler::new()));

/// Runs `f` with a critical-section witness, for call sites (like `Thread`)
/// that need to perform several scheduler operations atomically.
pub(crate) fn with_critical_section<R>(f: impl FnOnce(critical_section::CriticalSection<'_>) -> R) -> R {
    critical_section::with(f)
}

pub(crate) fn with_thread<R>(id: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    critical_section::with(|cs| {
        SCHEDULER.borrow(cs).borrow().slots[id.0].as_ref().map(f)
    })
}

pub(crate) fn with_thread_mut<R>(id: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    critical_section::with(|cs| with_thread_mut_cs(cs, id, f))
}

pub(crate) fn with_thread_mut_cs<R>(
    cs: critical_section::CriticalSection<'_>,
    id: ThreadId,
    f: impl FnOnce(&mut Thread) -> R,
) -> Option<R> {
    SCHEDULER.borrow(cs).borrow_mut().slots[id.0].as_mut().map(f)
}

/// Registers a new thread and hands its body off to the port. See
/// [`Thread`]'s constructor contract in the module docs.
pub(crate) fn register(
    name: &'static str,
    priority: Priority,
    stack: Stack,
    entry: Box<dyn FnOnce() -> i32 + Send + 'static>,
) -> ThreadId {
    assert!(!stack.is_empty(), "Thread::spawn requires a non-empty stack");
    let id = critical_section::with(|cs| {
        let mut sched = SCHEDULER.borrow(cs).borrow_mut();
        let idx = sched.alloc_slot();
        let id = ThreadId(idx);
        sched.slots[idx] = Some(Thread::new(id, name, priority, stack));
        id
    });

    let body = alloc::boxed::Box::new(move || {
        // invoke_with_exit: a normal return is indistinguishable from an
        // explicit exit(return_value).
        let rc = entry();
        exit_current(rc);
    });
    port().start_thread(id, body);
    id
}

/// The thread identity of the calling execution context.
///
/// On real hardware there is exactly one such context per processor, and
/// the port's context-switch code is responsible for keeping it in sync
/// with whichever thread it last dispatched to. Under test, each OS thread
/// (the test harness's own, and each simulated kernel thread spawned by
/// `Port::start_thread`) is lazily assigned its own identity on first use,
/// so concurrently-running `#[test]` functions don't share one "current
/// thread" — see `port::sim`'s per-OS-thread `CURRENT` cell.
pub(crate) fn current_id() -> ThreadId {
    #[cfg(test)]
    {
        if let Some(id) = crate::port::sim::current_for_this_os_thread() {
            return id;
        }
        let id = critical_section::with(|cs| {
            let mut sched = SCHEDULER.borrow(cs).borrow_mut();
            let idx = sched.alloc_slot();
            let id = ThreadId(idx);
            sched.slots[idx] = Some(Thread::new(
                id,
                "ambient",
                Priority::LOWEST,
                Stack::Owned(alloc::vec![0u8; 1].into_boxed_slice()),
            ));
            sched.slots[idx].as_mut().unwrap().state = ThreadState::Running;
            id
        });
        crate::port::sim::set_current_for_this_os_thread(id);
        id
    }
    #[cfg(not(test))]
    {
        // Populated by the port's context-switch code via `set_current`.
        critical_section::with(|cs| *CURRENT_THREAD_ID.borrow(cs).borrow())
    }
}

#[cfg(not(test))]
static CURRENT_THREAD_ID: critical_section::Mutex<RefCell<ThreadId>> =
    critical_section::Mutex::new(RefCell::new(ThreadId(0)));

/// Called by the port's context-switch code on real hardware when it
/// dispatches to `id`. Not used under test (see [`current_id`]).
#[cfg(not(test))]
pub fn set_current(id: ThreadId) {
    critical_section::with(|cs| *CURRENT_THREAD_ID.borrow(cs).borrow_mut() = id);
}

/// Forcibly transitions `id` to `Inactive`. No user-resource cleanup.
pub(crate) fn kill(id: ThreadId) {
    critical_section::with(|cs| {
        with_thread_mut_cs(cs, id, |t| {
            if t.state != ThreadState::Destroyed {
                t.state = ThreadState::Inactive;
            }
        })
    });
}

/// Marks `id` ready with the given reason and resumes its thread of
/// execution. Interrupt-safe (matches `wakeup`/`sig_raise`'s ISR-safe
/// contract): never blocks, only flips state and pokes the port.
pub(crate) fn wakeup_with_reason(id: ThreadId, reason: WakeupReason) {
    let existed = critical_section::with(|cs| {
        with_thread_mut_cs(cs, id, |t| {
            t.wakeup_reason = reason;
            t.state = ThreadState::Ready;
        })
        .is_some()
    });
    if existed {
        port().unblock(id);
    }
}

/// Suspends the calling thread unconditionally until woken.
pub(crate) fn suspend_current() {
    let id = current_id();
    critical_section::with(|cs| {
        with_thread_mut_cs(cs, id, |t| t.state = ThreadState::Suspended);
    });
    port().block_current(id);
    critical_section::with(|cs| {
        with_thread_mut_cs(cs, id, |t| t.state = ThreadState::Running);
    });
}

/// Suspends the calling thread until woken or `ticks` tick periods elapse.
/// Returns `true` if woken first, `false` if the deadline won.
pub(crate) fn suspend_current_timeout(ticks: u64) -> bool {
    let id = current_id();
    critical_section::with(|cs| {
        with_thread_mut_cs(cs, id, |t| t.state = ThreadState::Suspended);
    });
    let woken = port().block_current_timeout(id, ticks);
    critical_section::with(|cs| {
        with_thread_mut_cs(cs, id, |t| {
            t.state = ThreadState::Running;
            if !woken {
                t.wakeup_reason = WakeupReason::TimedOut;
            }
        });
    });
    woken
}

/// Callable only by the thread itself (`Port::start_thread`'s wrapper is
/// the only caller on the happy path). Idempotent: a thread that is already
/// `Terminated`/`Destroyed` returns rather than running any cleanup twice.
pub(crate) fn exit_current(value: i32) -> ! {
    let id = current_id();
    let outcome = critical_section::with(|cs| {
        let mut sched = SCHEDULER.borrow(cs).borrow_mut();
        match sched.slots[id.0].as_mut() {
            Some(t) if t.state != ThreadState::Terminated && t.state != ThreadState::Destroyed => {
                t.state = ThreadState::Terminated;
                t.exit_value = Some(value);
                let joiner = t.joiner;
                let detached = t.detached;
                let _ = sched.terminated.push(id);
                Some((joiner, detached))
            }
            _ => None,
        }
    });

    if let Some((joiner, detached)) = outcome {
        if let Some(joiner) = joiner {
            wakeup_with_reason(joiner, WakeupReason::Ok);
        } else if detached {
            // Eager reclamation: nothing can still observe this thread's
            // exit value, so there is no need to wait for the idle
            // reaper's next pass.
            reap_one(id);
        }
        log::debug!("{id} exited with code {value}");
    }

    // "After this point the thread never runs again": park the underlying
    // execution context forever rather than letting it fall off the end of
    // the closure. On real hardware this is unreachable (the port's
    // context switch never dispatches to a terminated thread again); under
    // test, the backing OS thread simply blocks forever instead of
    // tearing down the whole test process.
    #[cfg(test)]
    loop {
        std::thread::park();
    }
    #[cfg(not(test))]
    loop {
        port().wait_for_interrupt();
    }
}

/// Destroys a single terminated thread, freeing its slot. Safe to call
/// once nothing will ever read its `exit_value` again (the joiner has
/// collected it, or the thread was detached).
pub(crate) fn reap_one(id: ThreadId) {
    critical_section::with(|cs| {
        let mut sched = SCHEDULER.borrow(cs).borrow_mut();
        if let Some(pos) = sched.terminated.iter().position(|&t| t == id) {
            sched.terminated.swap_remove(pos);
        }
        sched.destroy_slot(id);
    });
}

/// Drains the terminated-thread list, destroying every entry. This is the
/// idle thread's reaper pass (§4.5); `join`/`detach` reclaim eagerly, so in
/// practice this only matters for threads nobody ever joined or detached.
pub fn reap() {
    let drained: HVec<ThreadId, MAX_THREADS> = critical_section::with(|cs| {
        let mut sched = SCHEDULER.borrow(cs).borrow_mut();
        core::mem::take(&mut sched.terminated)
    });
    for id in drained {
        critical_section::with(|cs| {
            SCHEDULER.borrow(cs).borrow_mut().destroy_slot(id);
        });
    }
}

/// The idle thread's loop body: reap, then idle-wait-for-interrupt. A
/// board-support binary runs this at `Priority::IDLE` (or one level below
/// it when the `idle-priority-below-idle` feature is enabled).
pub fn idle_step() {
    reap();
    port().wait_for_interrupt();
}

/// Stack size for [`spawn_idle_thread`], the Rust-native form of the
/// source's `idle_stack_size_bytes` compile-time option.
pub const IDLE_STACK_BYTES: usize = 4096;

/// The idle thread's scheduling priority: [`Priority::IDLE`] by default, or
/// one level below it when the `idle-priority-below-idle` feature is
/// enabled (on by default, matching the source) — the Rust-native form of
/// its `thread_idle_priority_below_idle` option.
pub fn idle_priority() -> Priority {
    #[cfg(feature = "idle-priority-below-idle")]
    {
        Priority::new(Priority::IDLE.get() - 1)
    }
    #[cfg(not(feature = "idle-priority-below-idle"))]
    {
        Priority::IDLE
    }
}

/// Spawns the reaper/idle thread. A board-support binary calls this once
/// during boot, after [`crate::port::set_port`]. Not available when
/// `port-native-scheduler` delegates scheduling to a native RTOS port,
/// which supplies its own idle thread.
#[cfg(not(feature = "port-native-scheduler"))]
pub fn spawn_idle_thread() -> ThreadHandle {
    ThreadHandle::spawn("idle", idle_priority(), IDLE_STACK_BYTES, || loop {
        idle_step();
    })
}
