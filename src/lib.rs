//! The concurrency and synchronization substrate of the Rorqual kernel:
//! the thread object with its lifecycle and signal-flag mailbox, and a
//! priority-ordered message queue built on top of it.
//!
//! Everything this crate treats as an external collaborator — the context
//! switch, the interrupt-entry port, the tick clock driver — is reached
//! through the [`Port`](port::Port) trait, which a board-support crate
//! implements and registers once via [`port::set_port`]. This crate never
//! touches hardware directly.
//!
//! # Modules
//!
//! - [`error`] — the POSIX-flavored error taxonomy every fallible entry
//!   point returns.
//! - [`port`] — the runtime contract required from the board-support layer.
//! - [`clock`] — the monotonic tick counter and its two suspension helpers.
//! - [`wait_list`] — FIFO wait lists and the scoped enrollment guard every
//!   blocking call builds on.
//! - [`thread`] — thread lifecycle, priority, join/detach/exit/kill, and
//!   the per-thread signal-flag mailbox.
//! - [`scheduler`] — the global thread registry, current-thread tracking,
//!   and the idle/reaper loop.
//! - [`message_queue`] — the bounded, priority-ordered message queue.
//!
//! `#[cfg(test)]` links `std` so the whole crate can be exercised against
//! [`port::sim`], a `Condvar`-backed `Port` that runs each kernel thread on
//! a real OS thread.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod clock;
pub mod error;
pub mod message_queue;
pub mod port;
pub mod scheduler;
pub mod thread;
pub mod wait_list;

pub use error::{KernelError, KernelResult};
pub use port::Port;
pub use thread::{Priority, SigWaitMode, ThreadId};

/// Re-exported only when this crate's own bounded queue is in play. With
/// `port-native-message-queue` enabled, the board-support crate delegates to
/// a native RTOS message queue instead and re-exports that type in its
/// place — this crate's [`message_queue::MessageQueue`] stays unused.
#[cfg(not(feature = "port-native-message-queue"))]
pub use message_queue::MessageQueue;

/// Re-exported only when this crate's own portable thread implementation is
/// in play. With `port-native-thread` enabled, the board-support crate
/// delegates to a native RTOS thread type and re-exports that in its
/// place — this crate's [`thread::ThreadHandle`] stays unused.
#[cfg(not(feature = "port-native-thread"))]
pub use thread::ThreadHandle;
