//! The boundary to everything this crate treats as an external collaborator:
//! handler-mode detection, the idle-wait-for-interrupt primitive, the raw
//! tick counter, and the actual mechanism that parks and resumes a thread of
//! execution (a real context switch on hardware; a condition variable over
//! a real OS thread under test).
//!
//! `critical_section_enter/leave` is deliberately *not* part of this trait:
//! it must be registered once, globally, via `critical_section::set_impl!`,
//! not dispatched per call through a vtable — the `critical_section` crate
//! already owns that contract.

use core::cell::RefCell;

use alloc::boxed::Box;

use crate::thread::ThreadId;

/// The runtime contract a board-support crate must supply.
pub trait Port: Sync {
    /// True while executing in an interrupt service routine.
    fn in_handler_mode(&self) -> bool;

    /// Put the CPU to sleep until the next interrupt. Used by the idle
    /// thread between reaper passes.
    fn wait_for_interrupt(&self);

    /// Creates a fresh thread of execution that will run `body` — this is
    /// the "prime the stack with a synthetic frame" step from the source's
    /// constructor note. `body` already embeds the `invoke_with_exit`
    /// proxy (it calls the user entry, then reports the exit value), so
    /// this method's only job is to make it run somewhere: a primed stack
    /// frame on real hardware, a genuine OS thread under test.
    fn start_thread(&self, id: ThreadId, body: Box<dyn FnOnce() + Send + 'static>);

    /// Parks the calling thread of execution until [`Port::unblock`] is
    /// called for `id`. Must never be called while a critical section is
    /// held by the caller — see the module docs on reentrancy.
    fn block_current(&self, id: ThreadId);

    /// As [`Port::block_current`], but also returns after `ticks` tick
    /// periods elapse. Returns `true` if [`Port::unblock`] ran first,
    /// `false` if the deadline was reached instead. This backs every timed
    /// wait in the crate (`TickClock::sleep_for`, `timed_send`, …).
    fn block_current_timeout(&self, id: ThreadId, ticks: u64) -> bool;

    /// Resumes a thread of execution previously parked via
    /// [`Port::block_current`] or [`Port::block_current_timeout`].
    /// Interrupt-safe.
    fn unblock(&self, id: ThreadId);

    /// Monotonic tick counter.
    fn now_ticks(&self) -> u64;
}

static PORT: critical_section::Mutex<RefCell<Option<&'static dyn Port>>> =
    critical_section::Mutex::new(RefCell::new(None));

/// Registers the board's `Port` implementation. Call exactly once during
/// boot, before any thread, queue, or clock operation.
pub fn set_port(port: &'static dyn Port) {
    critical_section::with(|cs| {
        *PORT.borrow(cs).borrow_mut() = Some(port);
    });
}

/// Fetches the registered port. Only ever held across the short
/// critical section that reads the pointer — callers use the returned
/// reference outside any critical section for anything that can block.
pub(crate) fn port() -> &'static dyn Port {
    let found = critical_section::with(|cs| *PORT.borrow(cs).borrow());
    found.expect("rorqual_kernel_core::port::set_port was never called")
}

#[cfg(test)]
pub mod sim {
    //! `std`-backed `Port` used by every test in this crate. Each kernel
    //! thread is backed by a real OS thread; `block_current`/`unblock` park
    //! and resume it with a `Condvar`, so the wait/wake protocol is
    //! exercised under genuine concurrency instead of single-stepped by
    //! hand.
    //!
    //! Grounded on the host test backend shape of `r3_port_std`: a portable
    //! kernel's logic runs unmodified against real OS threads standing in
    //! for hardware threads of execution.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Condvar, Mutex as StdMutex, Once};
    use std::time::{Duration, Instant};

    struct ParkCell {
        ready: StdMutex<bool>,
        cv: Condvar,
    }

    pub struct SimPort {
        cells: StdMutex<HashMap<ThreadId, Arc<ParkCell>>>,
        start: StdMutex<Option<Instant>>,
        tick: Duration,
    }

    impl SimPort {
        pub const fn new(tick: Duration) -> Self {
            SimPort {
                cells: StdMutex::new(HashMap::new()),
                start: StdMutex::new(None),
                tick,
            }
        }

        fn cell_for(&self, id: ThreadId) -> Arc<ParkCell> {
            let mut cells = self.cells.lock().unwrap();
            cells
                .entry(id)
                .or_insert_with(|| {
                    Arc::new(ParkCell {
                        ready: StdMutex::new(false),
                        cv: Condvar::new(),
                    })
                })
                .clone()
        }
    }

    impl Port for SimPort {
        fn in_handler_mode(&self) -> bool {
            false
        }

        fn wait_for_interrupt(&self) {
            std::thread::sleep(self.tick);
        }

        fn start_thread(&self, id: ThreadId, body: Box<dyn FnOnce() + Send + 'static>) {
            std::thread::Builder::new()
                .name(format!("{id}"))
                .spawn(move || {
                    CURRENT.with(|c| c.set(Some(id)));
                    body();
                })
                .expect("failed to spawn simulated kernel thread");
        }

        fn block_current(&self, id: ThreadId) {
            let cell = self.cell_for(id);
            let mut ready = cell.ready.lock().unwrap();
            while !*ready {
                ready = cell.cv.wait(ready).unwrap();
            }
            *ready = false;
        }

        fn block_current_timeout(&self, id: ThreadId, ticks: u64) -> bool {
            let cell = self.cell_for(id);
            let dur = self.tick.saturating_mul(ticks.min(u32::MAX as u64) as u32);
            let ready = cell.ready.lock().unwrap();
            let (mut ready, timeout) = cell.cv.wait_timeout_while(ready, dur, |r| !*r).unwrap();
            let woken = *ready && !timeout.timed_out();
            *ready = false;
            woken
        }

        fn unblock(&self, id: ThreadId) {
            let cell = self.cell_for(id);
            let mut ready = cell.ready.lock().unwrap();
            *ready = true;
            cell.cv.notify_all();
        }

        fn now_ticks(&self) -> u64 {
            let mut start = self.start.lock().unwrap();
            let start = *start.get_or_insert_with(Instant::now);
            (start.elapsed().as_nanos() / self.tick.as_nanos().max(1)) as u64
        }
    }

    static SIM_PORT: SimPort = SimPort::new(Duration::from_millis(1));
    static INSTALL: Once = Once::new();

    /// Installs [`SIM_PORT`] as the process-wide port, idempotently. Call at
    /// the top of every test that touches thread/clock/queue behavior.
    pub fn install_sim_port() {
        INSTALL.call_once(|| set_port(&SIM_PORT));
    }

    std::thread_local! {
        /// Maps *this OS thread* to its kernel identity. A single global
        /// "current thread" variable (as the real, single-core target
        /// uses) would make unrelated `#[test]` functions — which `cargo
        /// test` runs on concurrent OS threads by default — stomp on each
        /// other. Per-OS-thread storage keeps each test (and each
        /// simulated kernel thread, which already gets its own OS thread
        /// in `start_thread`) isolated, while still modeling "exactly one
        /// current thread" from that OS thread's point of view.
        pub(crate) static CURRENT: core::cell::Cell<Option<ThreadId>> = const { core::cell::Cell::new(None) };
    }

    /// The kernel identity of the calling OS thread, if one has been
    /// assigned (by `start_thread`, or by `scheduler::current_id`'s
    /// lazy-registration fallback for ambient test/driver threads).
    pub(crate) fn current_for_this_os_thread() -> Option<ThreadId> {
        CURRENT.with(|c| c.get())
    }

    pub(crate) fn set_current_for_this_os_thread(id: ThreadId) {
        CURRENT.with(|c| c.set(Some(id)));
    }
}
