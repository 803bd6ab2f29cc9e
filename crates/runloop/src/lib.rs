//! runloop — embeddable, priority-aware event loop and task dispatch
//!
//! Components post immediate, delayed, absolute-time, and synchronous
//! (blocking) work onto a per-thread run queue with strict ordering and
//! fairness guarantees, optional file-descriptor readiness integration, and
//! safe cross-thread posting into a loop owned by another thread.
//!
//! - **[`Event`]**: one unit of work — an id/param pair or a task callback,
//!   pooled to avoid allocation churn (`event` module)
//! - **[`EventQueue`]**: priority sub-queues sorted by handle time, with an
//!   anti-starvation cap and an idle lane (`queue` module)
//! - **[`IoWaiter`]**: pluggable blocking — condition variable, epoll, or a
//!   host-OS looper backend (`waiter` module)
//! - **[`EventRunner`]**: one dispatch thread per queue, with deferred
//!   non-blocking thread reclamation (`runner` and `collector` modules)
//! - **[`Handler`]**: the posting/processing facade bound to a runner
//!   (`handler` module)
//!
//! # Example
//!
//! ```
//! use runloop::{EventRunner, Handler, Priority};
//!
//! // A dedicated dispatch thread, reclaimed in the background on drop
//! let runner = EventRunner::create_named("worker").unwrap();
//! let handler = Handler::new(runner);
//!
//! // Blocks until the task has run on the dispatch thread
//! handler
//!     .post_sync_task(|| println!("hello from the loop"), Priority::Immediate)
//!     .unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod collector;
pub mod dump;
pub mod error;
pub mod event;
pub mod handler;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod waiter;

pub use collector::{CollectorGuard, ThreadCollector};
pub use dump::{Dumper, LogDumper, StringDumper};
pub use error::{Error, Result};
pub use event::{Event, EventId, EventWaiter, TaskCallback};
pub use handler::{EventProcessor, Handler};
pub use queue::{EventQueue, FdListener, Priority};
pub use registry::RunnerRegistry;
pub use runner::{EventRunner, TimeoutCallback};
pub use waiter::{CondvarWaiter, FdEventCallback, FdEvents, IoWaiter};
#[cfg(target_os = "linux")]
pub use waiter::{
    install_looper_backend, looper_backend, EpollWaiter, LooperBackend, PlatformWaiter,
};
