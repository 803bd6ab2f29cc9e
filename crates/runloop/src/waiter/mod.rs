//! Pluggable blocking primitives for the event queue
//!
//! An [`IoWaiter`] is how a queue blocks its dispatch thread when no event
//! is eligible: "sleep until notified or until a deadline, optionally also
//! waking on file-descriptor readiness". Three implementations exist:
//!
//! - [`CondvarWaiter`] — condition variable only, no fd support; the default.
//! - [`EpollWaiter`] — epoll plus an eventfd used purely as a wakeup signal
//!   (Linux). Installed lazily when the first fd listener is registered.
//! - [`PlatformWaiter`] — delegates blocking to a host-OS looper through a
//!   [`LooperBackend`] strategy installed at startup (Linux).
//!
//! Queues upgrade from the condvar waiter to an fd-capable one on demand and
//! never downgrade, except when a waiter reports an unrecoverable failure,
//! in which case the queue falls back to a fresh condvar waiter and drops
//! all fd listeners.

mod condvar;
#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
mod platform;

pub use condvar::CondvarWaiter;
#[cfg(target_os = "linux")]
pub use epoll::EpollWaiter;
#[cfg(target_os = "linux")]
pub use platform::{install_looper_backend, looper_backend, LooperBackend, PlatformWaiter};

use crate::queue::QueueState;
use bitflags::bitflags;
use parking_lot::MutexGuard;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

bitflags! {
    /// Abstract file-descriptor readiness bits, independent of the backing
    /// multiplexer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdEvents: u32 {
        /// Data available to read
        const INPUT = 0b0001;
        /// Ready to accept writes
        const OUTPUT = 0b0010;
        /// Peer hung up
        const SHUTDOWN = 0b0100;
        /// Error condition on the descriptor
        const EXCEPTION = 0b1000;
    }
}

/// Callback invoked with `(fd, events)` when a registered descriptor reports
/// readiness, shutdown, or an error. Always invoked with the queue lock
/// released, so it may post back into the queue.
pub type FdEventCallback = Arc<dyn Fn(RawFd, FdEvents) + Send + Sync>;

/// Blocking primitive owned by an event queue.
///
/// `notify_one`/`notify_all` must be safe to call with zero waiters. Callers
/// hold the queue lock while notifying, which closes the lost-wakeup window
/// for condvar-backed implementations; fd-backed implementations use a
/// sticky wake signal instead.
pub trait IoWaiter: Send + Sync {
    /// Block until notified or until `timeout` elapses; `None` blocks
    /// indefinitely.
    ///
    /// The caller passes the held queue guard in; the implementation unlocks
    /// before blocking and re-locks before returning. Returns `false` only
    /// when the blocking primitive itself failed unrecoverably.
    fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, QueueState>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, QueueState>, bool);

    /// Wake one waiting thread; no-op when nobody waits
    fn notify_one(&self);

    /// Wake all waiting threads; no-op when nobody waits
    fn notify_all(&self);

    /// Whether this waiter can watch file descriptors
    fn supports_fd_listening(&self) -> bool {
        false
    }

    /// Register interest in `events` on `fd`
    fn add_fd(&self, _fd: RawFd, _events: FdEvents) -> bool {
        false
    }

    /// Drop interest in `fd`
    fn remove_fd(&self, _fd: RawFd) {}

    /// Install the callback that receives readiness reports
    fn set_fd_event_callback(&self, _callback: FdEventCallback) {}
}
