//! Handler: the user-facing sending and processing facade
//!
//! A [`Handler`] is bound to one runner for its whole life. It wraps
//! requests into events, posts and removes them, performs synchronous sends
//! with deadlock avoidance, and runs the processing side on the dispatch
//! thread: task events execute their callback, id/param events go to the
//! handler's [`EventProcessor`].
//!
//! Events hold only weak references to their handler, so a handler never
//! outlives its usefulness just because work is queued; dropping a handler
//! purges its remaining events through
//! [`EventQueue::remove_orphan`](crate::queue::EventQueue::remove_orphan).

use crate::error::{Error, Result};
use crate::event::{Event, EventId};
use crate::queue::{FdListener, Priority};
use crate::registry::RunnerRegistry;
use crate::runner::{EventRunner, TimeoutCallback};
use crate::waiter::FdEvents;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interpretation hook for id/param events; the default ignores them.
///
/// Handlers that only post tasks never need one.
pub trait EventProcessor: Send + Sync {
    /// Called on the dispatch thread for every non-task event
    fn process_event(&self, _event: &Event) {}
}

/// Posts events onto a runner and processes them when they come up
pub struct Handler {
    runner: Arc<EventRunner>,
    processor: Option<Arc<dyn EventProcessor>>,
    delivery_timeout_callback: Mutex<Option<TimeoutCallback>>,
    distribute_timeout_callback: Mutex<Option<TimeoutCallback>>,
}

impl Handler {
    /// Create a handler bound to `runner` with no processor
    pub fn new(runner: Arc<EventRunner>) -> Arc<Handler> {
        Arc::new(Self {
            runner,
            processor: None,
            delivery_timeout_callback: Mutex::new(None),
            distribute_timeout_callback: Mutex::new(None),
        })
    }

    /// Create a handler whose id/param events go to `processor`
    pub fn with_processor(
        runner: Arc<EventRunner>,
        processor: Arc<dyn EventProcessor>,
    ) -> Arc<Handler> {
        Arc::new(Self {
            runner,
            processor: Some(processor),
            delivery_timeout_callback: Mutex::new(None),
            distribute_timeout_callback: Mutex::new(None),
        })
    }

    /// The handler whose event is currently being distributed on the
    /// calling thread
    pub fn current() -> Option<Arc<Handler>> {
        RunnerRegistry::current_handler()
    }

    /// The runner this handler posts onto
    pub fn runner(&self) -> &Arc<EventRunner> {
        &self.runner
    }

    /// Queue `event` for dispatch after `delay`.
    ///
    /// Stamps the send and handle times, records this handler as the weak
    /// owner, and inserts. On failure the event is dropped and released; no
    /// cleanup is required of the caller.
    pub fn send_event(
        self: &Arc<Self>,
        mut event: Event,
        delay: Duration,
        priority: Priority,
    ) -> Result<()> {
        let now = Instant::now();
        event.set_send_time(now);
        event.set_handle_time(now + delay);
        event.set_owner(Arc::downgrade(self));
        self.runner.queue().insert(event, priority)
    }

    /// Queue `event` for dispatch at the absolute `task_time`.
    ///
    /// A deadline already in the past degrades to an immediate send at the
    /// same priority.
    pub fn send_timing_event(
        self: &Arc<Self>,
        event: Event,
        task_time: Instant,
        priority: Priority,
    ) -> Result<()> {
        let now = Instant::now();
        if task_time <= now {
            tracing::debug!("timing event deadline already past, sending immediately");
        }
        self.send_event(event, task_time.saturating_duration_since(now), priority)
    }

    /// Queue `event` and block until it has been processed and released.
    ///
    /// IDLE priority is rejected (an idle sync send could block forever),
    /// as is a runner whose loop is not running. Called from the target
    /// runner's own dispatch thread, the event executes inline instead of
    /// deadlocking.
    pub fn send_sync_event(self: &Arc<Self>, mut event: Event, priority: Priority) -> Result<()> {
        if priority == Priority::Idle {
            tracing::warn!("synchronous send cannot use IDLE priority");
            return Err(Error::InvalidParam);
        }
        if !self.runner.is_running() {
            tracing::warn!("synchronous send to a runner that is not running");
            return Err(Error::NoRunner);
        }

        if let Some(current) = EventRunner::current() {
            if Arc::ptr_eq(&current, &self.runner) {
                // Already on the dispatch thread: run it in place
                let now = Instant::now();
                event.set_send_time(now);
                event.set_handle_time(now);
                event.set_owner(Arc::downgrade(self));
                self.distribute_event(event);
                return Ok(());
            }
        }

        let waiter = event.create_waiter();
        self.send_event(event, Duration::ZERO, priority)?;
        waiter.wait();
        Ok(())
    }

    /// Post a task at the given delay and priority, named after the caller
    /// location
    #[track_caller]
    pub fn post_task(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
        priority: Priority,
    ) -> Result<()> {
        self.post_named_task(task, Location::caller().to_string(), delay, priority)
    }

    /// Post a task with an explicit name, used later by
    /// [`remove_task`](Handler::remove_task)
    pub fn post_named_task(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        name: impl Into<String>,
        delay: Duration,
        priority: Priority,
    ) -> Result<()> {
        self.send_event(Event::with_task(task, name), delay, priority)
    }

    /// Post a task at IMMEDIATE priority with no delay
    #[track_caller]
    pub fn post_immediate_task(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.post_named_task(
            task,
            Location::caller().to_string(),
            Duration::ZERO,
            Priority::Immediate,
        )
    }

    /// Post a task at HIGH priority
    #[track_caller]
    pub fn post_high_priority_task(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<()> {
        self.post_named_task(task, Location::caller().to_string(), delay, Priority::High)
    }

    /// Post a task dispatched only when the queue is otherwise idle
    #[track_caller]
    pub fn post_idle_task(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<()> {
        self.post_named_task(task, Location::caller().to_string(), delay, Priority::Idle)
    }

    /// Post a task and block until it has run
    #[track_caller]
    pub fn post_sync_task(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        priority: Priority,
    ) -> Result<()> {
        self.send_sync_event(
            Event::with_task(task, Location::caller().to_string()),
            priority,
        )
    }

    /// Post a task for an absolute deadline
    #[track_caller]
    pub fn post_timing_task(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        task_time: Instant,
        priority: Priority,
    ) -> Result<()> {
        self.send_timing_event(
            Event::with_task(task, Location::caller().to_string()),
            task_time,
            priority,
        )
    }

    /// Run one event on the calling thread.
    ///
    /// Marks this handler as distributing for the duration, measures the
    /// configured latency diagnostics, then executes the task callback or
    /// hands the event to the processor. Dropping the event afterwards
    /// releases it and wakes a pending synchronous sender.
    pub fn distribute_event(self: &Arc<Self>, mut event: Event) {
        let start = Instant::now();
        let previous = RunnerRegistry::bind_distributing_handler(Arc::downgrade(self));

        if let Some(limit) = self.runner.delivery_timeout() {
            let latency = start.saturating_duration_since(event.send_time());
            if latency > limit {
                tracing::warn!(?latency, "event delivery exceeded the configured threshold");
                if let Some(callback) = self
                    .delivery_timeout_callback
                    .lock()
                    .clone()
                    .or_else(|| self.runner.timeout_callback())
                {
                    callback(latency);
                }
            }
        }

        if let Some(task) = event.take_task() {
            task();
        } else if let Some(processor) = &self.processor {
            processor.process_event(&event);
        }

        if let Some(limit) = self.runner.distribute_timeout() {
            let spent = start.elapsed();
            if spent > limit {
                tracing::warn!(?spent, "event distribution exceeded the configured threshold");
                if let Some(callback) = self
                    .distribute_timeout_callback
                    .lock()
                    .clone()
                    .or_else(|| self.runner.timeout_callback())
                {
                    callback(spent);
                }
            }
        }

        RunnerRegistry::restore_distributing_handler(previous);
    }

    /// Remove every still-queued event this handler sent
    pub fn remove_all_events(self: &Arc<Self>) {
        self.runner.queue().remove_by_owner(self);
    }

    /// Remove this handler's queued events with the given id
    pub fn remove_event(self: &Arc<Self>, id: impl Into<EventId>) {
        self.runner.queue().remove_event(self, &id.into());
    }

    /// Remove this handler's queued events with the given id and parameter
    pub fn remove_event_with_param(self: &Arc<Self>, id: impl Into<EventId>, param: i64) {
        self.runner
            .queue()
            .remove_event_with_param(self, &id.into(), param);
    }

    /// Remove this handler's queued tasks with the given name
    pub fn remove_task(self: &Arc<Self>, name: &str) {
        self.runner.queue().remove_task(self, name);
    }

    /// Whether this handler has a queued event with the given id
    pub fn has_event(self: &Arc<Self>, id: impl Into<EventId>) -> bool {
        self.runner.queue().has_event(self, &id.into())
    }

    /// Whether this handler has a queued event with the given parameter
    pub fn has_event_with_param(self: &Arc<Self>, param: i64) -> bool {
        self.runner.queue().has_event_with_param(self, param)
    }

    /// Watch `fd` for the given readiness events; `listener` hooks run on
    /// the dispatch thread
    pub fn add_fd_listener(
        self: &Arc<Self>,
        fd: RawFd,
        events: FdEvents,
        listener: Arc<dyn FdListener>,
    ) -> Result<()> {
        if fd < 0 || events.is_empty() {
            tracing::warn!(fd, "invalid fd listener arguments");
            return Err(Error::InvalidParam);
        }
        self.runner
            .queue()
            .add_fd_listener(fd, events, listener, Arc::downgrade(self))
    }

    /// Stop watching `fd`
    pub fn remove_fd_listener(&self, fd: RawFd) {
        self.runner.queue().remove_fd_listener(fd);
    }

    /// Whether the runner's queue is idle
    pub fn is_idle(&self) -> bool {
        self.runner.queue().is_idle()
    }

    /// Install the send-to-dispatch latency callback for this handler's
    /// events
    pub fn set_delivery_timeout_callback(&self, callback: TimeoutCallback) {
        *self.delivery_timeout_callback.lock() = Some(callback);
    }

    /// Install the time-inside-callback callback for this handler's events
    pub fn set_distribute_timeout_callback(&self, callback: TimeoutCallback) {
        *self.distribute_timeout_callback.lock() = Some(callback);
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        // Pending events only hold expired weak owners now; purge them and
        // any fd listeners this handler registered
        self.runner.queue().remove_orphan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn running_runner() -> (Arc<EventRunner>, thread::JoinHandle<Result<()>>) {
        let runner = EventRunner::create(false).unwrap();
        let loop_runner = runner.clone();
        let handle = thread::spawn(move || loop_runner.run());
        while !runner.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        (runner, handle)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_post_task_runs_on_dispatch_thread() {
        let (runner, handle) = running_runner();
        let handler = Handler::new(runner.clone());

        let main_thread = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        handler
            .post_task(
                move || {
                    *sink.lock() = Some(thread::current().id());
                },
                Duration::ZERO,
                Priority::Low,
            )
            .unwrap();

        wait_until(Duration::from_secs(2), || seen.lock().is_some());
        assert_ne!(seen.lock().unwrap(), main_thread);

        runner.stop().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_sync_send_from_dispatch_thread_runs_inline() {
        let (runner, handle) = running_runner();
        let handler = Handler::new(runner.clone());

        let verified = Arc::new(AtomicBool::new(false));
        let outer_verified = verified.clone();
        let outer_handler = handler.clone();
        handler
            .post_immediate_task(move || {
                let ran = Arc::new(AtomicBool::new(false));
                let inner_ran = ran.clone();
                // Same runner, same thread: must execute in place and
                // return only after the inline execution completed
                outer_handler
                    .post_sync_task(
                        move || inner_ran.store(true, Ordering::Release),
                        Priority::Immediate,
                    )
                    .unwrap();
                assert!(ran.load(Ordering::Acquire));
                outer_verified.store(true, Ordering::Release);
            })
            .unwrap();

        wait_until(Duration::from_secs(2), || verified.load(Ordering::Acquire));
        runner.stop().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_sync_send_from_other_thread_blocks_until_processed() {
        let (runner, handle) = running_runner();
        let handler = Handler::new(runner.clone());

        let ran = Arc::new(AtomicBool::new(false));
        let task_ran = ran.clone();
        handler
            .post_sync_task(
                move || {
                    thread::sleep(Duration::from_millis(30));
                    task_ran.store(true, Ordering::Release);
                },
                Priority::Low,
            )
            .unwrap();
        // Returned only after the dispatch thread processed and released it
        assert!(ran.load(Ordering::Acquire));

        runner.stop().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_sync_send_rejections() {
        let runner = EventRunner::create(false).unwrap();
        let handler = Handler::new(runner);

        // Loop not running
        let err = handler.post_sync_task(|| {}, Priority::Low).unwrap_err();
        assert_eq!(err, Error::NoRunner);

        let (running, handle) = running_runner();
        let handler = Handler::new(running.clone());
        let err = handler.post_sync_task(|| {}, Priority::Idle).unwrap_err();
        assert_eq!(err, Error::InvalidParam);

        running.stop().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_removing_queued_sync_event_releases_waiter() {
        let runner = EventRunner::create(false).unwrap();
        let handler = Handler::new(runner);

        let mut event = Event::new(3u32, 0);
        let waiter = event.create_waiter();
        handler
            .send_event(event, Duration::from_secs(30), Priority::Low)
            .unwrap();

        let remover = handler.clone();
        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remover.remove_all_events();
        });

        // Removal must release the event, never strand the waiter
        waiter.wait();
        thread.join().unwrap();
    }

    #[test]
    fn test_timing_event_past_deadline_keeps_priority() {
        let runner = EventRunner::create(false).unwrap();
        let handler = Handler::new(runner.clone());

        // LOW first, then a HIGH event whose deadline is already past
        handler
            .send_event(Event::new(1u32, 1), Duration::ZERO, Priority::Low)
            .unwrap();
        handler
            .send_timing_event(
                Event::new(2u32, 2),
                Instant::now() - Duration::from_millis(10),
                Priority::High,
            )
            .unwrap();

        // The degraded-to-immediate event still outranks LOW
        let mut next_wake = None;
        let first = runner.queue().get_expired_event(&mut next_wake).unwrap();
        assert_eq!(first.param(), 2);
    }

    #[test]
    fn test_processor_receives_id_and_param() {
        struct Recorder {
            received: Mutex<Vec<(EventId, i64)>>,
        }
        impl EventProcessor for Recorder {
            fn process_event(&self, event: &Event) {
                self.received.lock().push((event.id().clone(), event.param()));
            }
        }

        let runner = EventRunner::create(false).unwrap();
        let recorder = Arc::new(Recorder {
            received: Mutex::new(Vec::new()),
        });
        let handler = Handler::with_processor(runner.clone(), recorder.clone());

        handler
            .send_event(Event::new(77u32, 42), Duration::ZERO, Priority::Low)
            .unwrap();

        let mut next_wake = None;
        let event = runner.queue().get_expired_event(&mut next_wake).unwrap();
        handler.distribute_event(event);

        assert_eq!(
            recorder.received.lock().as_slice(),
            &[(EventId::Num(77), 42)]
        );
    }

    #[test]
    fn test_delivery_timeout_callback_fires() {
        let runner = EventRunner::create(false).unwrap();
        runner.set_delivery_timeout(Some(Duration::from_millis(1)));
        let handler = Handler::new(runner.clone());

        let reported = Arc::new(Mutex::new(None));
        let sink = reported.clone();
        handler.set_delivery_timeout_callback(Arc::new(move |latency| {
            *sink.lock() = Some(latency);
        }));

        handler
            .send_event(Event::new(1u32, 0), Duration::ZERO, Priority::Low)
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let mut next_wake = None;
        let event = runner.queue().get_expired_event(&mut next_wake).unwrap();
        handler.distribute_event(event);

        let latency = reported.lock().expect("timeout callback not invoked");
        assert!(latency >= Duration::from_millis(10));
    }

    #[test]
    fn test_distribute_timeout_uses_runner_fallback_callback() {
        let runner = EventRunner::create(false).unwrap();
        runner.set_timeout(Some(Duration::from_millis(1)));
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();
        runner.set_timeout_callback(Arc::new(move |_spent| {
            sink.fetch_add(1, Ordering::Release);
        }));

        let handler = Handler::new(runner.clone());
        handler
            .post_named_task(
                || thread::sleep(Duration::from_millis(20)),
                "slow",
                Duration::ZERO,
                Priority::Low,
            )
            .unwrap();

        let mut next_wake = None;
        let event = runner.queue().get_expired_event(&mut next_wake).unwrap();
        handler.distribute_event(event);

        // Delivery and distribution both exceeded the generic threshold
        assert!(fired.load(Ordering::Acquire) >= 1);
    }

    #[test]
    fn test_remove_task_and_events_scoped_to_handler() {
        let runner = EventRunner::create(false).unwrap();
        let handler = Handler::new(runner.clone());
        let other = Handler::new(runner.clone());

        handler
            .post_named_task(|| {}, "mine", Duration::from_secs(10), Priority::Low)
            .unwrap();
        other
            .post_named_task(|| {}, "mine", Duration::from_secs(10), Priority::Low)
            .unwrap();
        handler
            .send_event(Event::new(5u32, 1), Duration::from_secs(10), Priority::Low)
            .unwrap();

        handler.remove_task("mine");
        handler.remove_event(5u32);
        assert!(!handler.has_event(5u32));
        // The other handler's task survives
        assert!(!runner.queue().is_queue_empty());

        other.remove_all_events();
        assert!(runner.queue().is_queue_empty());
    }

    #[test]
    fn test_handler_drop_purges_queued_events() {
        let runner = EventRunner::create(false).unwrap();
        let handler = Handler::new(runner.clone());
        for i in 0..3 {
            handler
                .send_event(Event::new(1u32, i), Duration::from_secs(10), Priority::Low)
                .unwrap();
        }
        assert!(!runner.queue().is_queue_empty());

        drop(handler);
        assert!(runner.queue().is_queue_empty());
    }

    #[test]
    fn test_current_handler_set_during_distribution() {
        let (runner, handle) = running_runner();
        let handler = Handler::new(runner.clone());

        let matched = Arc::new(AtomicBool::new(false));
        let sink = matched.clone();
        let expected = handler.clone();
        handler
            .post_immediate_task(move || {
                if let Some(current) = Handler::current() {
                    sink.store(Arc::ptr_eq(&current, &expected), Ordering::Release);
                }
            })
            .unwrap();

        wait_until(Duration::from_secs(2), || matched.load(Ordering::Acquire));
        runner.stop().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_is_idle_reflects_queue_state() {
        let runner = EventRunner::create(false).unwrap();
        let handler = Handler::new(runner.clone());

        let mut next_wake = None;
        assert!(runner.queue().get_expired_event(&mut next_wake).is_none());
        assert!(handler.is_idle());

        handler
            .send_event(Event::new(1u32, 0), Duration::ZERO, Priority::Low)
            .unwrap();
        assert!(runner.queue().get_expired_event(&mut next_wake).is_some());
        assert!(!handler.is_idle());
    }
}
