//! Event runner: one queue, one dispatch thread
//!
//! A runner owns exactly one [`EventQueue`] and drives it from exactly one
//! thread at a time. Two flavors exist:
//!
//! - **Deposited** (`create(true)` / `create_named`): the runner spawns a
//!   dedicated thread that enters the loop immediately. The thread is
//!   deposited with the [`ThreadCollector`] so neither `drop` nor shutdown
//!   ever joins it on the caller's stack. Explicit `run`/`stop` are
//!   rejected.
//! - **Caller-driven** (`create(false)`): the queue runs on whatever thread
//!   calls [`run`](EventRunner::run); [`stop`](EventRunner::stop) finishes
//!   the queue from anywhere.
//!
//! Handler callbacks bound to one runner execute strictly sequentially on
//! its dispatch thread.

use crate::collector::ThreadCollector;
use crate::dump::Dumper;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::registry::RunnerRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const DEFAULT_THREAD_NAME: &str = "runloop-runner";

/// Diagnostic callback invoked with the measured latency when a configured
/// threshold is exceeded
pub type TimeoutCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Owns an event queue and its dispatch thread
pub struct EventRunner {
    queue: Arc<EventQueue>,
    /// True when a dedicated thread (spawned or host-loop) drives the queue
    deposited: bool,
    running: AtomicBool,
    thread_name: Option<String>,
    delivery_timeout: Mutex<Option<Duration>>,
    distribute_timeout: Mutex<Option<Duration>>,
    /// Fallback threshold when the specific ones are unset
    timeout: Mutex<Option<Duration>>,
    timeout_callback: Mutex<Option<TimeoutCallback>>,
}

impl EventRunner {
    fn bare(queue: Arc<EventQueue>, deposited: bool, thread_name: Option<String>) -> Self {
        Self {
            queue,
            deposited,
            running: AtomicBool::new(false),
            thread_name,
            delivery_timeout: Mutex::new(None),
            distribute_timeout: Mutex::new(None),
            timeout: Mutex::new(None),
            timeout_callback: Mutex::new(None),
        }
    }

    /// Create a runner. With `in_new_thread` a dedicated, collector-managed
    /// thread starts dispatching immediately; otherwise the caller drives
    /// the queue through [`run`](EventRunner::run).
    pub fn create(in_new_thread: bool) -> Result<Arc<Self>> {
        if in_new_thread {
            Self::create_named(DEFAULT_THREAD_NAME)
        } else {
            Ok(Arc::new(Self::bare(Arc::new(EventQueue::new()), false, None)))
        }
    }

    /// Create a dedicated-thread runner with a human-readable thread name
    pub fn create_named(name: &str) -> Result<Arc<Self>> {
        let runner = Arc::new(Self::bare(
            Arc::new(EventQueue::new()),
            true,
            Some(name.to_string()),
        ));
        // Running from the caller's perspective as soon as create returns;
        // synchronous sends must not race the thread's startup
        runner.running.store(true, Ordering::Release);

        let weak = Arc::downgrade(&runner);
        let loop_queue = runner.queue.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::thread_main(weak, loop_queue))
            .expect("failed to spawn runner thread");

        // Deposit so stopping/dropping never joins on the caller's stack
        let exit_queue = runner.queue.clone();
        ThreadCollector::global().deposit(handle, Box::new(move || exit_queue.finish()));
        Ok(runner)
    }

    /// The runner bound to the calling thread.
    ///
    /// Inside a run loop this is the loop's runner. On a registered
    /// host-loop thread a platform-backed runner is constructed and bound
    /// lazily. Anywhere else, `None`.
    pub fn current() -> Option<Arc<Self>> {
        if let Some(runner) = RunnerRegistry::current_runner() {
            return Some(runner);
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(backend) = crate::waiter::looper_backend() {
                if backend.is_loop_thread() {
                    match crate::waiter::PlatformWaiter::new(backend) {
                        Ok(waiter) => {
                            let queue = Arc::new(EventQueue::with_waiter(Arc::new(waiter)));
                            let runner = Arc::new(Self::bare(
                                queue,
                                true,
                                Some("host-loop".to_string()),
                            ));
                            // Pumped by the host loop, so it counts as
                            // running from the start
                            runner.running.store(true, Ordering::Release);
                            RunnerRegistry::retain_runner(runner.clone());
                            tracing::debug!("bound runner to host loop thread");
                            return Some(runner);
                        }
                        Err(err) => {
                            tracing::error!("cannot bind runner to host loop: {}", err);
                            return None;
                        }
                    }
                }
            }
        }
        None
    }

    /// Drive the queue on the calling thread until
    /// [`stop`](EventRunner::stop) finishes it.
    ///
    /// Rejected on deposited runners and when another `run` is active.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        if self.deposited {
            tracing::warn!("run() on a runner that manages its own thread");
            return Err(Error::RunnerNoPermit);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("run() while already running");
            return Err(Error::RunnerAlreadyRunning);
        }

        self.queue.prepare();
        let previous = RunnerRegistry::bind_runner(Arc::downgrade(self));
        Self::run_loop(&self.queue);
        RunnerRegistry::restore_runner(previous);
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Finish the queue so the active `run` returns promptly.
    ///
    /// No-op (with a warning) when the runner is not running; rejected on
    /// deposited runners, which stop through drop/collector instead.
    pub fn stop(&self) -> Result<()> {
        if self.deposited {
            tracing::warn!("stop() on a runner that manages its own thread");
            return Err(Error::RunnerNoPermit);
        }
        if !self.running.load(Ordering::Acquire) {
            tracing::warn!("stop() on a runner that is not running");
            return Ok(());
        }
        self.queue.finish();
        Ok(())
    }

    /// Entry point of a dedicated runner thread
    fn thread_main(runner: Weak<EventRunner>, queue: Arc<EventQueue>) {
        RunnerRegistry::bind_runner(runner.clone());
        tracing::debug!("runner thread entering dispatch loop");

        Self::run_loop(&queue);

        if let Some(runner) = runner.upgrade() {
            runner.running.store(false, Ordering::Release);
        }
        RunnerRegistry::restore_runner(None);
        tracing::debug!("runner thread exiting");
        ThreadCollector::global().reclaim_current_thread();
    }

    /// Pop events until the queue reports finished, handing each to its
    /// owning handler
    fn run_loop(queue: &EventQueue) {
        while let Some(event) = queue.get_event() {
            // An event whose owner died between insert and dispatch is
            // dropped on the spot, which releases it
            if let Some(handler) = event.owner() {
                handler.distribute_event(event);
            }
        }
    }

    /// The queue this runner dispatches
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Whether a dispatch loop is currently driving the queue
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Threshold for send-to-dispatch latency diagnostics
    pub fn delivery_timeout(&self) -> Option<Duration> {
        self.delivery_timeout.lock().or(*self.timeout.lock())
    }

    /// Configure the send-to-dispatch latency threshold
    pub fn set_delivery_timeout(&self, timeout: Option<Duration>) {
        *self.delivery_timeout.lock() = timeout;
    }

    /// Threshold for time-inside-callback diagnostics
    pub fn distribute_timeout(&self) -> Option<Duration> {
        self.distribute_timeout.lock().or(*self.timeout.lock())
    }

    /// Configure the time-inside-callback threshold
    pub fn set_distribute_timeout(&self, timeout: Option<Duration>) {
        *self.distribute_timeout.lock() = timeout;
    }

    /// Configure the fallback threshold used where the specific ones are
    /// unset
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    /// Callback invoked when any threshold is exceeded, unless the handler
    /// overrides it
    pub fn timeout_callback(&self) -> Option<TimeoutCallback> {
        self.timeout_callback.lock().clone()
    }

    /// Install the runner-wide threshold callback
    pub fn set_timeout_callback(&self, callback: TimeoutCallback) {
        *self.timeout_callback.lock() = Some(callback);
    }

    /// Describe runner and queue state to a diagnostic sink
    pub fn dump(&self, dumper: &mut dyn Dumper) {
        dumper.dump(&format!(
            "runner: deposited={} running={} thread={}",
            self.deposited,
            self.is_running(),
            self.thread_name.as_deref().unwrap_or("<caller>")
        ));
        self.queue.dump(dumper);
    }
}

impl Drop for EventRunner {
    fn drop(&mut self) {
        if self.deposited {
            // The dedicated thread unblocks, exits, and is joined by the
            // collector; the caller never waits here
            self.queue.finish();
        }
        self.queue.close();
    }
}
