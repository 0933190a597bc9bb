//! FIFO wait lists and the scoped enrollment guard used by every blocking
//! call on [`crate::message_queue::MessageQueue`].
//!
//! Grounded on the teacher's `scheduler/io_wait.rs` `WaitQueue`
//! (`waiting_threads: Vec<ThreadId>`, `add_waiter`/`remove_waiter`/
//! `wake_all`), generalized to a capacity-bounded `heapless::Deque` so
//! enrollment never allocates, and paired with an RAII guard per the
//! source's "intrusive waiters on stack frames" design note: a real
//! pointer-linked intrusive list isn't expressible without `unsafe`, so the
//! list stores the small `Copy` `ThreadId` instead, and the guard is the
//! safe substitute for the source's call-frame-local linked node.

use heapless::Deque;

use crate::thread::{self, ThreadId, MAX_THREADS};

/// FIFO of threads blocked on the same condition. All operations are meant
/// to be called under the caller's critical section.
pub struct IntrusiveWaitList {
    waiters: Deque<ThreadId, MAX_THREADS>,
}

impl IntrusiveWaitList {
    pub const fn new() -> Self {
        IntrusiveWaitList {
            waiters: Deque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    fn enqueue(&mut self, id: ThreadId) {
        self.waiters
            .push_back(id)
            .unwrap_or_else(|_| panic!("wait list capacity exceeded (> {MAX_THREADS} threads)"));
    }

    fn remove(&mut self, id: ThreadId) {
        let mut rest = Deque::new();
        while let Some(front) = self.waiters.pop_front() {
            if front != id {
                let _ = rest.push_back(front);
            }
        }
        self.waiters = rest;
    }

    /// Detaches the head waiter and marks it ready with reason `Ok`.
    /// No-op on an empty list.
    pub fn wakeup_one(&mut self) {
        if let Some(id) = self.waiters.pop_front() {
            thread::mark_detached_from_wait_list(id);
            crate::scheduler::wakeup_with_reason(id, thread::WakeupReason::Ok);
            log::trace!("{id} woken from wait list");
        }
    }

    /// Drains the list, marking every waiter ready with reason `Ok`.
    pub fn wakeup_all(&mut self) {
        let mut woken = 0usize;
        while let Some(id) = self.waiters.pop_front() {
            thread::mark_detached_from_wait_list(id);
            crate::scheduler::wakeup_with_reason(id, thread::WakeupReason::Ok);
            woken += 1;
        }
        if woken > 0 {
            log::trace!("{woken} waiter(s) woken from wait list");
        }
    }

    pub fn clear(&mut self) {
        self.waiters = Deque::new();
    }
}

impl Default for IntrusiveWaitList {
    fn default() -> Self {
        Self::new()
    }
}

/// Enrolls the calling thread on `list` for the lifetime of this value;
/// detaches it (idempotently) on drop. The struct itself lives on the
/// blocking call's stack frame, exactly where the source's intrusive node
/// used to live — this is the memory-safe substitute the design notes call
/// for.
///
/// The enrolling critical section is expected to have already ended by the
/// time the guard is dropped (the whole point is to release the section
/// across the suspension point), so `Drop` re-enters a critical section of
/// its own rather than borrowing the caller's.
pub struct Guard<'a> {
    list: &'a critical_section::Mutex<core::cell::RefCell<IntrusiveWaitList>>,
    id: ThreadId,
}

impl<'a> Guard<'a> {
    /// Enqueues the calling thread on `list`. Must be called under the
    /// caller's critical section (pass it as `cs` to prove it).
    pub fn new(
        cs: critical_section::CriticalSection<'_>,
        list: &'a critical_section::Mutex<core::cell::RefCell<IntrusiveWaitList>>,
        id: ThreadId,
    ) -> Self {
        list.borrow(cs).borrow_mut().enqueue(id);
        thread::mark_enrolled_on_wait_list(id);
        log::trace!("{id} enrolled on wait list");
        Guard { list, id }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        critical_section::with(|cs| {
            self.list.borrow(cs).borrow_mut().remove(self.id);
        });
        thread::mark_detached_from_wait_list(self.id);
        log::trace!("{} detached from wait list", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::install_sim_port;
    use core::cell::RefCell;

    static LIST: critical_section::Mutex<RefCell<IntrusiveWaitList>> =
        critical_section::Mutex::new(RefCell::new(IntrusiveWaitList::new()));

    #[test]
    fn guard_enrolls_and_detaches() {
        install_sim_port();
        let id = crate::thread::ThreadHandle::current().id();
        {
            let _guard = critical_section::with(|cs| Guard::new(cs, &LIST, id));
            critical_section::with(|cs| {
                assert_eq!(LIST.borrow(cs).borrow().len(), 1);
            });
        }
        critical_section::with(|cs| {
            assert!(LIST.borrow(cs).borrow().is_empty());
        });
    }

    #[test]
    fn wakeup_one_is_fifo() {
        install_sim_port();
        critical_section::with(|cs| {
            let mut list = LIST.borrow(cs).borrow_mut();
            list.clear();
            list.enqueue(ThreadId(100));
            list.enqueue(ThreadId(101));
        });
        critical_section::with(|cs| LIST.borrow(cs).borrow_mut().wakeup_one());
        critical_section::with(|cs| {
            assert_eq!(LIST.borrow(cs).borrow().len(), 1);
        });
    }
}
