//! Priority event queue with fairness and fd integration
//!
//! One [`EventQueue`] belongs to one runner. Producers on any thread insert
//! events; the runner's dispatch thread retrieves them with [`get_event`]
//! (blocking) or [`get_expired_event`] (non-blocking, for externally pumped
//! loops). Four timed sub-queues (VIP, IMMEDIATE, HIGH, LOW) are each kept
//! sorted by handle time; IDLE events live in a separate list that is only
//! drained when nothing timed is eligible.
//!
//! Fairness: picking always prefers the highest eligible priority, unless
//! that sub-queue has already been served `max_handled` times in a row while
//! a lower-priority event was eligible — then the lower one is served and
//! the skipped-over counters reset. This bounds starvation of LOW behind a
//! continuous stream of higher-priority events.
//!
//! All queue state lives behind a single mutex. The blocking primitive (an
//! [`IoWaiter`]) is part of that state and is hot-swapped under the same
//! lock when fd support is first requested.
//!
//! [`get_event`]: EventQueue::get_event
//! [`get_expired_event`]: EventQueue::get_expired_event

use crate::dump::Dumper;
use crate::error::{Error, Result};
use crate::event::{Event, EventId};
use crate::handler::Handler;
use crate::waiter::{CondvarWaiter, FdEvents, IoWaiter};
#[cfg(target_os = "linux")]
use crate::waiter::EpollWaiter;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Number of consecutive picks a sub-queue gets before an eligible
/// lower-priority event must be served
const DEFAULT_MAX_HANDLED: u32 = 5;

/// Number of timed sub-queues (everything except IDLE)
const SUB_QUEUE_COUNT: usize = 4;

/// Dispatch priority of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Ahead of everything else
    Vip = 0,
    /// Ahead of HIGH and LOW
    Immediate = 1,
    /// Ahead of LOW
    High = 2,
    /// Default priority
    Low = 3,
    /// Only dispatched when nothing timed is eligible
    Idle = 4,
}

/// Callbacks fired on the dispatch thread when a watched descriptor reports
/// readiness. Default implementations ignore the report.
pub trait FdListener: Send + Sync {
    /// Data is available to read
    fn on_readable(&self, _fd: RawFd) {}

    /// The descriptor accepts writes
    fn on_writable(&self, _fd: RawFd) {}

    /// The peer hung up
    fn on_shutdown(&self, _fd: RawFd) {}

    /// The descriptor is in an error state
    fn on_exception(&self, _fd: RawFd) {}
}

struct FdListenerRecord {
    listener: Arc<dyn FdListener>,
    events: FdEvents,
    owner: Weak<Handler>,
}

/// One timed sub-queue, sorted ascending by handle time
struct SubQueue {
    events: VecDeque<Event>,
    /// Consecutive picks since a lower-priority event was last served
    handled_count: u32,
    max_handled: u32,
}

impl Default for SubQueue {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            handled_count: 0,
            max_handled: DEFAULT_MAX_HANDLED,
        }
    }
}

/// Everything guarded by the queue mutex. Public only so waiter signatures
/// can name the guarded type; fields are crate-private.
pub struct QueueState {
    sub_queues: [SubQueue; SUB_QUEUE_COUNT],
    idle_events: VecDeque<Event>,
    waiter: Arc<dyn IoWaiter>,
    fd_listeners: FxHashMap<RawFd, FdListenerRecord>,
    /// Deadline the dispatch thread is currently sleeping towards; `None`
    /// while awake or waiting indefinitely
    wake_up_time: Option<Instant>,
    is_idle: bool,
    /// When the queue last transitioned into idle mode
    idle_time: Instant,
    finished: bool,
    /// Flipped false exactly once at teardown; late operations are rejected
    usable: bool,
}

impl QueueState {
    pub(crate) fn with_waiter(waiter: Arc<dyn IoWaiter>) -> Self {
        Self {
            sub_queues: std::array::from_fn(|_| SubQueue::default()),
            idle_events: VecDeque::new(),
            waiter,
            fd_listeners: FxHashMap::default(),
            wake_up_time: None,
            is_idle: false,
            idle_time: Instant::now(),
            finished: false,
            usable: true,
        }
    }
}

/// Thread-safe pending-event store for one runner
pub struct EventQueue {
    state: Mutex<QueueState>,
}

impl EventQueue {
    /// Create a queue blocking on a condition variable; upgraded to an
    /// fd-capable waiter on demand
    pub fn new() -> Self {
        Self::with_waiter(Arc::new(CondvarWaiter::new()))
    }

    /// Create a queue blocking on the given waiter
    pub fn with_waiter(waiter: Arc<dyn IoWaiter>) -> Self {
        Self {
            state: Mutex::new(QueueState::with_waiter(waiter)),
        }
    }

    /// Insert an event at the given priority.
    ///
    /// Callable from any thread. Keeps the priority's sub-queue sorted by
    /// handle time and wakes the dispatch thread only when the new event
    /// precedes the deadline it is sleeping towards. IDLE inserts never wake
    /// anyone.
    pub fn insert(&self, event: Event, priority: Priority) -> Result<()> {
        let mut state = self.state.lock();
        if !state.usable {
            tracing::warn!("insert on a torn-down queue, event dropped");
            return Err(Error::NoRunner);
        }

        let handle_time = event.handle_time();
        if priority == Priority::Idle {
            let position = state
                .idle_events
                .partition_point(|queued| queued.handle_time() <= handle_time);
            state.idle_events.insert(position, event);
            return Ok(());
        }

        let sub_queue = &mut state.sub_queues[priority as usize];
        let position = sub_queue
            .events
            .partition_point(|queued| queued.handle_time() <= handle_time);
        sub_queue.events.insert(position, event);

        let needs_wakeup = state
            .wake_up_time
            .map_or(true, |deadline| handle_time < deadline);
        if needs_wakeup {
            state.waiter.notify_all();
        }
        Ok(())
    }

    /// Retrieve the next eligible event, blocking until one arrives.
    ///
    /// Returns `None` only after [`finish`](EventQueue::finish) (or
    /// teardown) when nothing is eligible immediately; callers stop looping
    /// on `None`.
    pub fn get_event(&self) -> Option<Event> {
        let mut state = self.state.lock();
        loop {
            if !state.usable {
                return None;
            }
            let now = Instant::now();
            let (event, next_wake) = Self::pick_locked(&mut state, now);
            if event.is_some() {
                return event;
            }
            if state.finished {
                return None;
            }

            state.wake_up_time = next_wake;
            let timeout = next_wake.map(|at| at.saturating_duration_since(now));
            let waiter = state.waiter.clone();
            let (mut reacquired, ok) = waiter.wait_for(state, timeout);
            reacquired.wake_up_time = None;
            if !ok {
                tracing::error!(
                    "waiter failed unrecoverably; degrading to condvar waiter, all fd listeners dropped"
                );
                Self::degrade_locked(&mut reacquired);
            }
            state = reacquired;
        }
    }

    /// Retrieve the next eligible event without blocking.
    ///
    /// When nothing is eligible, stores the earliest future wake time in
    /// `next_wake` and returns `None`. Used by loops driven by an external
    /// message pump instead of [`get_event`](EventQueue::get_event).
    pub fn get_expired_event(&self, next_wake: &mut Option<Instant>) -> Option<Event> {
        let mut state = self.state.lock();
        if !state.usable {
            return None;
        }
        let now = Instant::now();
        let (event, wake) = Self::pick_locked(&mut state, now);
        if event.is_none() {
            *next_wake = wake;
        }
        event
    }

    /// Fairness-aware pick. Returns the chosen event plus the earliest
    /// future handle time when nothing was eligible.
    fn pick_locked(state: &mut QueueState, now: Instant) -> (Option<Event>, Option<Instant>) {
        let mut next_wake: Option<Instant> = None;
        let mut chosen: Option<usize> = None;

        for index in 0..SUB_QUEUE_COUNT {
            let front_time = match state.sub_queues[index].events.front() {
                Some(front) => front.handle_time(),
                None => continue,
            };
            if front_time > now {
                next_wake = Some(next_wake.map_or(front_time, |t| t.min(front_time)));
                continue;
            }
            match chosen {
                None => chosen = Some(index),
                Some(higher) => {
                    // The higher sub-queue has monopolized the thread long
                    // enough; serve this one instead
                    let sub = &state.sub_queues[higher];
                    if sub.handled_count >= sub.max_handled {
                        chosen = Some(index);
                    }
                }
            }
        }

        if let Some(index) = chosen {
            for skipped in state.sub_queues[..index].iter_mut() {
                skipped.handled_count = 0;
            }
            state.sub_queues[index].handled_count += 1;
            state.is_idle = false;
            return (state.sub_queues[index].events.pop_front(), next_wake);
        }

        // Nothing timed is eligible: enter idle mode, stamping the entry
        // time only on the transition
        if !state.is_idle {
            state.is_idle = true;
            state.idle_time = now;
        }
        if let Some(front) = state.idle_events.front() {
            let front_handle = front.handle_time();
            if front_handle <= now && front.send_time() <= state.idle_time {
                return (state.idle_events.pop_front(), next_wake);
            }
            if front_handle > now {
                next_wake = Some(next_wake.map_or(front_handle, |t| t.min(front_handle)));
            }
        }
        (None, next_wake)
    }

    /// Swap in a plain condvar waiter after an unrecoverable waiter failure
    fn degrade_locked(state: &mut QueueState) {
        state.fd_listeners.clear();
        state.waiter = Arc::new(CondvarWaiter::new());
    }

    /// Remove every queued event and fd listener whose owning handler has
    /// been destroyed. Called whenever a handler bound to this queue drops.
    pub fn remove_orphan(&self) {
        let (removed_events, removed_listeners) = {
            let mut state = self.state.lock();
            if !state.usable {
                return;
            }
            let events = Self::extract_matching(&mut state, |event| event.owner_expired());

            let dead: Vec<RawFd> = state
                .fd_listeners
                .iter()
                .filter(|(_, record)| record.owner.strong_count() == 0)
                .map(|(fd, _)| *fd)
                .collect();
            let mut listeners = Vec::new();
            for fd in dead {
                if let Some(record) = state.fd_listeners.remove(&fd) {
                    state.waiter.remove_fd(fd);
                    listeners.push(record);
                }
            }
            (events, listeners)
        };
        // Dropped with the lock released: destructors may re-enter the queue
        drop(removed_events);
        drop(removed_listeners);
    }

    /// Remove every queued event sent by `owner`
    pub fn remove_by_owner(&self, owner: &Arc<Handler>) {
        self.remove_matching(|event| event.owned_by(owner));
    }

    /// Remove `owner`'s non-task events with the given id
    pub fn remove_event(&self, owner: &Arc<Handler>, id: &EventId) {
        self.remove_matching(|event| {
            event.owned_by(owner) && !event.has_task() && event.id() == id
        });
    }

    /// Remove `owner`'s non-task events with the given id and parameter
    pub fn remove_event_with_param(&self, owner: &Arc<Handler>, id: &EventId, param: i64) {
        self.remove_matching(|event| {
            event.owned_by(owner)
                && !event.has_task()
                && event.id() == id
                && event.param() == param
        });
    }

    /// Remove `owner`'s task events with the given name
    pub fn remove_task(&self, owner: &Arc<Handler>, name: &str) {
        self.remove_matching(|event| {
            event.owned_by(owner) && event.has_task() && event.task_name() == name
        });
    }

    /// Predicate removal applied to every sub-queue and the idle list.
    /// Removal releases each removed event to the pool and wakes any
    /// synchronous sender.
    fn remove_matching<F: Fn(&Event) -> bool>(&self, predicate: F) {
        let removed = {
            let mut state = self.state.lock();
            if !state.usable {
                return;
            }
            Self::extract_matching(&mut state, predicate)
        };
        // Dropped with the lock released: releasing an event can run payload
        // destructors that re-enter this queue
        drop(removed);
    }

    /// Pull every event matching `predicate` out of all lists; the caller
    /// drops the result after releasing the queue lock
    fn extract_matching(
        state: &mut QueueState,
        predicate: impl Fn(&Event) -> bool,
    ) -> Vec<Event> {
        let mut removed = Vec::new();
        for sub_queue in &mut state.sub_queues {
            let mut kept = VecDeque::with_capacity(sub_queue.events.len());
            for event in sub_queue.events.drain(..) {
                if predicate(&event) {
                    removed.push(event);
                } else {
                    kept.push_back(event);
                }
            }
            sub_queue.events = kept;
        }
        let mut kept = VecDeque::with_capacity(state.idle_events.len());
        for event in state.idle_events.drain(..) {
            if predicate(&event) {
                removed.push(event);
            } else {
                kept.push_back(event);
            }
        }
        state.idle_events = kept;
        removed
    }

    /// Register a listener for readiness on `fd`.
    ///
    /// Fails if the fd already has a listener, and lazily upgrades the
    /// condvar waiter to the epoll waiter on first use (queues never
    /// downgrade except on waiter failure).
    pub fn add_fd_listener(
        self: &Arc<Self>,
        fd: RawFd,
        events: FdEvents,
        listener: Arc<dyn FdListener>,
        owner: Weak<Handler>,
    ) -> Result<()> {
        if fd < 0 || events.is_empty() {
            tracing::warn!(fd, "invalid fd listener registration");
            return Err(Error::InvalidParam);
        }

        let mut state = self.state.lock();
        if !state.usable {
            return Err(Error::NoRunner);
        }
        if state.fd_listeners.contains_key(&fd) {
            tracing::warn!(fd, "fd already has a listener");
            return Err(Error::FdAlreadyRegistered);
        }

        if !state.waiter.supports_fd_listening() {
            #[cfg(target_os = "linux")]
            {
                let epoll = match EpollWaiter::new() {
                    Ok(waiter) => waiter,
                    Err(err) => {
                        tracing::error!("epoll waiter creation failed: {}", err);
                        return Err(Error::FdListeningNotSupported);
                    }
                };
                let queue = Arc::downgrade(self);
                epoll.set_fd_event_callback(Arc::new(move |fd, events| {
                    if let Some(queue) = queue.upgrade() {
                        queue.handle_fd_event(fd, events);
                    }
                }));
                let old = std::mem::replace(
                    &mut state.waiter,
                    Arc::new(epoll) as Arc<dyn IoWaiter>,
                );
                // A thread blocked in the old waiter migrates to the new one
                // on its next loop iteration
                old.notify_all();
            }
            #[cfg(not(target_os = "linux"))]
            {
                tracing::warn!("fd listening is not supported on this platform");
                return Err(Error::FdListeningNotSupported);
            }
        }

        if !state.waiter.add_fd(fd, events) {
            return Err(Error::FdOperationFailed);
        }
        state.fd_listeners.insert(
            fd,
            FdListenerRecord {
                listener,
                events,
                owner,
            },
        );
        Ok(())
    }

    /// Unregister the listener for `fd`
    pub fn remove_fd_listener(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if !state.usable {
            return;
        }
        if state.fd_listeners.remove(&fd).is_some() {
            state.waiter.remove_fd(fd);
        }
    }

    /// Readiness report from the waiter; re-posts onto the owning handler so
    /// listener hooks run on the dispatch thread. Invoked with the queue
    /// lock released.
    fn handle_fd_event(&self, fd: RawFd, events: FdEvents) {
        let record = {
            let state = self.state.lock();
            state
                .fd_listeners
                .get(&fd)
                .map(|record| (record.listener.clone(), record.owner.clone()))
        };
        let Some((listener, owner)) = record else {
            return;
        };
        let Some(handler) = owner.upgrade() else {
            return;
        };

        let result = handler.post_named_task(
            move || {
                if events.contains(FdEvents::INPUT) {
                    listener.on_readable(fd);
                }
                if events.contains(FdEvents::OUTPUT) {
                    listener.on_writable(fd);
                }
                if events.contains(FdEvents::SHUTDOWN) {
                    listener.on_shutdown(fd);
                }
                if events.contains(FdEvents::EXCEPTION) {
                    listener.on_exception(fd);
                }
            },
            "fd-readiness",
            Duration::ZERO,
            Priority::Immediate,
        );
        if result.is_err() {
            tracing::warn!(fd, "dropping fd readiness report, queue unavailable");
        }
    }

    /// Clear the finished flag so the retrieval loop can run again
    pub fn prepare(&self) {
        let mut state = self.state.lock();
        state.finished = false;
    }

    /// Stop the retrieval loop: sets the finished flag and force-wakes the
    /// waiter so a blocked `get_event` exits promptly
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        state.waiter.notify_all();
    }

    /// Tear the queue down: reject all later operations, drop every pending
    /// event (releasing each exactly once) and every fd listener
    pub(crate) fn close(&self) {
        let (removed_events, removed_listeners) = {
            let mut state = self.state.lock();
            if !state.usable {
                return;
            }
            state.usable = false;
            state.finished = true;
            let events = Self::extract_matching(&mut state, |_| true);
            let fds: Vec<RawFd> = state.fd_listeners.keys().copied().collect();
            for fd in fds {
                state.waiter.remove_fd(fd);
            }
            let listeners: Vec<FdListenerRecord> =
                state.fd_listeners.drain().map(|(_, record)| record).collect();
            state.waiter.notify_all();
            (events, listeners)
        };
        drop(removed_events);
        drop(removed_listeners);
    }

    /// Whether the queue is in idle mode (nothing timed was eligible at the
    /// last pick)
    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle
    }

    /// Whether nothing at all is pending. Pending idle events count as
    /// non-empty.
    pub fn is_queue_empty(&self) -> bool {
        let state = self.state.lock();
        state.sub_queues.iter().all(|sub| sub.events.is_empty()) && state.idle_events.is_empty()
    }

    /// Whether `owner` has a queued non-task event with the given id
    pub fn has_event(&self, owner: &Arc<Handler>, id: &EventId) -> bool {
        self.any_matching(|event| {
            event.owned_by(owner) && !event.has_task() && event.id() == id
        })
    }

    /// Whether `owner` has a queued non-task event with the given parameter
    pub fn has_event_with_param(&self, owner: &Arc<Handler>, param: i64) -> bool {
        self.any_matching(|event| {
            event.owned_by(owner) && !event.has_task() && event.param() == param
        })
    }

    fn any_matching<F: Fn(&Event) -> bool>(&self, predicate: F) -> bool {
        let state = self.state.lock();
        state
            .sub_queues
            .iter()
            .flat_map(|sub| sub.events.iter())
            .chain(state.idle_events.iter())
            .any(predicate)
    }

    /// Describe queue state to a diagnostic sink
    pub fn dump(&self, dumper: &mut dyn Dumper) {
        let state = self.state.lock();
        dumper.dump(&format!(
            "queue: usable={} finished={} idle={}",
            state.usable, state.finished, state.is_idle
        ));
        for (name, sub) in ["vip", "immediate", "high", "low"]
            .iter()
            .zip(state.sub_queues.iter())
        {
            dumper.dump(&format!(
                "  {} pending={} handled_in_a_row={}",
                name, sub.events.len(), sub.handled_count
            ));
        }
        dumper.dump(&format!("  idle pending={}", state.idle_events.len()));
        for (fd, record) in state.fd_listeners.iter() {
            dumper.dump(&format!("  fd {} events={:?}", fd, record.events));
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
