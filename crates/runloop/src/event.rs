//! Event objects and their recycling pool
//!
//! An [`Event`] is one unit of work for a runner: either an identifier plus
//! an integer parameter (interpreted by the owning handler), or a boxed task
//! callback executed directly on the dispatch thread. Events carry their
//! timing metadata, an optional type-checked payload, a weak reference to
//! the handler that sent them, and — for synchronous sends — a condvar-backed
//! waiter that is signalled when the event is released back to the pool.
//!
//! Events are allocated from a bounded process-wide pool so steady-state
//! dispatch does not churn the allocator. Dropping an [`Event`] returns its
//! storage to the pool (or frees it when the pool is full) after clearing
//! every field, so removal, dispatch, and teardown all release exactly once.

use crate::handler::Handler;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Upper bound on pooled event allocations
const EVENT_POOL_CAPACITY: usize = 64;

/// Boxed task callback executed on the dispatch thread
pub type TaskCallback = Box<dyn FnOnce() + Send + 'static>;

/// Event identity: a numeric id or a string name, never both
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    /// Numeric identifier
    Num(u32),
    /// Named identifier
    Named(Box<str>),
}

impl Default for EventId {
    fn default() -> Self {
        EventId::Num(0)
    }
}

impl From<u32> for EventId {
    fn from(id: u32) -> Self {
        EventId::Num(id)
    }
}

impl From<&str> for EventId {
    fn from(name: &str) -> Self {
        EventId::Named(name.into())
    }
}

impl From<String> for EventId {
    fn from(name: String) -> Self {
        EventId::Named(name.into())
    }
}

/// Type-erased payload slot; exactly one object, ownership chosen by the
/// sender
enum Payload {
    Shared(Arc<dyn Any + Send + Sync>),
    Weak(Weak<dyn Any + Send + Sync>),
    Unique(Box<dyn Any + Send>),
}

/// Condvar-backed waiter for synchronous sends.
///
/// The sending thread blocks in [`EventWaiter::wait`] until the event is
/// released back to the pool, which happens after dispatch, after removal
/// from the queue, or at queue teardown.
pub struct EventWaiter {
    finished: Mutex<bool>,
    cond: Condvar,
}

impl EventWaiter {
    fn new() -> Self {
        Self {
            finished: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until the associated event has been released
    pub fn wait(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.cond.wait(&mut finished);
        }
    }

    pub(crate) fn notify(&self) {
        let mut finished = self.finished.lock();
        *finished = true;
        self.cond.notify_all();
    }
}

/// Backing storage for an event, recycled through the pool
struct EventData {
    id: EventId,
    param: i64,
    send_time: Instant,
    handle_time: Instant,
    task: Option<TaskCallback>,
    task_name: String,
    payload: Option<Payload>,
    owner: Option<std::sync::Weak<Handler>>,
    waiter: Option<Arc<EventWaiter>>,
}

impl EventData {
    fn empty() -> Self {
        let now = Instant::now();
        Self {
            id: EventId::default(),
            param: 0,
            send_time: now,
            handle_time: now,
            task: None,
            task_name: String::new(),
            payload: None,
            owner: None,
            waiter: None,
        }
    }

    /// Reset every field so the next acquisition starts from a blank slate
    fn clear(&mut self) {
        let now = Instant::now();
        self.id = EventId::default();
        self.param = 0;
        self.send_time = now;
        self.handle_time = now;
        self.task = None;
        self.task_name.clear();
        self.payload = None;
        self.owner = None;
        self.waiter = None;
    }
}

/// Bounded pool of event storage, process-wide, created on first use
pub(crate) struct EventPool {
    slots: Mutex<Vec<Box<EventData>>>,
}

static POOL: Lazy<EventPool> = Lazy::new(|| EventPool {
    slots: Mutex::new(Vec::with_capacity(EVENT_POOL_CAPACITY)),
});

impl EventPool {
    fn global() -> &'static EventPool {
        &POOL
    }

    fn acquire(&self) -> Box<EventData> {
        self.slots
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(EventData::empty()))
    }

    /// Clear the storage, return it to the pool (or drop it when the pool is
    /// full), then signal any synchronous waiter
    fn release(&self, mut data: Box<EventData>) {
        let waiter = data.waiter.take();
        data.clear();
        {
            let mut slots = self.slots.lock();
            if slots.len() < EVENT_POOL_CAPACITY {
                slots.push(data);
            }
            // else: drop — pool is full
        }
        if let Some(waiter) = waiter {
            waiter.notify();
        }
    }
}

/// A unit of work for an event runner.
///
/// Obtained from the constructors below, filled in by the sending handler,
/// and consumed by the dispatch thread. Dropping an event anywhere releases
/// its storage to the pool and wakes a pending synchronous sender.
pub struct Event {
    data: Option<Box<EventData>>,
}

impl Event {
    fn from_pool() -> Self {
        Self {
            data: Some(EventPool::global().acquire()),
        }
    }

    #[inline]
    fn data(&self) -> &EventData {
        self.data.as_ref().expect("event storage present until drop")
    }

    #[inline]
    fn data_mut(&mut self) -> &mut EventData {
        self.data.as_mut().expect("event storage present until drop")
    }

    /// Create an event with an identifier and parameter
    pub fn new(id: impl Into<EventId>, param: i64) -> Event {
        let mut event = Event::from_pool();
        event.data_mut().id = id.into();
        event.data_mut().param = param;
        event
    }

    /// Create an event carrying a shared payload object
    pub fn with_shared_object<T: Any + Send + Sync>(
        id: impl Into<EventId>,
        object: Arc<T>,
        param: i64,
    ) -> Event {
        let mut event = Event::new(id, param);
        event.data_mut().payload = Some(Payload::Shared(object));
        event
    }

    /// Create an event carrying a weak payload reference
    pub fn with_weak_object<T: Any + Send + Sync>(
        id: impl Into<EventId>,
        object: Weak<T>,
        param: i64,
    ) -> Event {
        let mut event = Event::new(id, param);
        event.data_mut().payload = Some(Payload::Weak(object));
        event
    }

    /// Create an event carrying a uniquely-owned payload object
    pub fn with_unique_object<T: Any + Send>(
        id: impl Into<EventId>,
        object: Box<T>,
        param: i64,
    ) -> Event {
        let mut event = Event::new(id, param);
        event.data_mut().payload = Some(Payload::Unique(object));
        event
    }

    /// Create a task event executing `task` on the dispatch thread
    pub fn with_task(task: impl FnOnce() + Send + 'static, name: impl Into<String>) -> Event {
        let mut event = Event::from_pool();
        event.data_mut().task = Some(Box::new(task));
        event.data_mut().task_name = name.into();
        event
    }

    /// Create an empty event; useful as a plain synchronization token
    pub fn bare() -> Event {
        Event::from_pool()
    }

    /// The event identifier; meaningful only when [`has_task`] is false
    ///
    /// [`has_task`]: Event::has_task
    pub fn id(&self) -> &EventId {
        &self.data().id
    }

    /// The integer parameter; meaningful only for non-task events
    pub fn param(&self) -> i64 {
        self.data().param
    }

    /// When the event was handed to the queue
    pub fn send_time(&self) -> Instant {
        self.data().send_time
    }

    /// When the event becomes eligible for dispatch
    pub fn handle_time(&self) -> Instant {
        self.data().handle_time
    }

    /// Whether this event carries a task callback instead of an id/param pair
    pub fn has_task(&self) -> bool {
        self.data().task.is_some()
    }

    /// Take the task callback out for execution
    pub fn take_task(&mut self) -> Option<TaskCallback> {
        self.data_mut().task.take()
    }

    /// Name of the task, empty for non-task events
    pub fn task_name(&self) -> &str {
        &self.data().task_name
    }

    /// Retrieve a shared payload, validating the stored type.
    ///
    /// Weak payloads are upgraded first; an expired weak reference yields
    /// `None`. A stored type other than `T` is reported and yields `None` —
    /// payloads are never cast blindly.
    pub fn shared_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self.data().payload.as_ref()? {
            Payload::Shared(object) => match object.clone().downcast::<T>() {
                Ok(object) => Some(object),
                Err(_) => {
                    tracing::warn!("shared payload type mismatch, returning none");
                    None
                }
            },
            Payload::Weak(weak) => match weak.upgrade()?.downcast::<T>() {
                Ok(object) => Some(object),
                Err(_) => {
                    tracing::warn!("weak payload type mismatch, returning none");
                    None
                }
            },
            Payload::Unique(_) => {
                tracing::warn!("payload is uniquely owned, use unique_object");
                None
            }
        }
    }

    /// Take a uniquely-owned payload out of the event, validating the stored
    /// type. On mismatch the payload stays in place and `None` is returned.
    pub fn unique_object<T: Any + Send>(&mut self) -> Option<Box<T>> {
        let payload = self.data_mut().payload.take()?;
        match payload {
            Payload::Unique(object) => match object.downcast::<T>() {
                Ok(object) => Some(object),
                Err(object) => {
                    tracing::warn!("unique payload type mismatch, returning none");
                    self.data_mut().payload = Some(Payload::Unique(object));
                    None
                }
            },
            other => {
                tracing::warn!("payload is shared, use shared_object");
                self.data_mut().payload = Some(other);
                None
            }
        }
    }

    /// Lazily create the synchronous-send waiter and return a handle to it
    pub fn create_waiter(&mut self) -> Arc<EventWaiter> {
        self.data_mut()
            .waiter
            .get_or_insert_with(|| Arc::new(EventWaiter::new()))
            .clone()
    }

    /// Whether a synchronous sender is waiting on this event
    pub fn has_waiter(&self) -> bool {
        self.data().waiter.is_some()
    }

    /// The handler that sent this event, if it is still alive
    pub fn owner(&self) -> Option<Arc<Handler>> {
        self.data().owner.as_ref()?.upgrade()
    }

    pub(crate) fn set_send_time(&mut self, time: Instant) {
        self.data_mut().send_time = time;
    }

    pub(crate) fn set_handle_time(&mut self, time: Instant) {
        self.data_mut().handle_time = time;
    }

    pub(crate) fn set_owner(&mut self, owner: std::sync::Weak<Handler>) {
        self.data_mut().owner = Some(owner);
    }

    /// True when an owner was set and that handler has since been destroyed
    pub(crate) fn owner_expired(&self) -> bool {
        match &self.data().owner {
            Some(owner) => owner.strong_count() == 0,
            None => false,
        }
    }

    /// True when this event was sent by `owner`
    pub(crate) fn owned_by(&self, owner: &Arc<Handler>) -> bool {
        match &self.data().owner {
            Some(weak) => weak.ptr_eq(&Arc::downgrade(owner)),
            None => false,
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            EventPool::global().release(data);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data();
        if data.task.is_some() {
            write!(f, "Event {{ task: {:?} }}", data.task_name)
        } else {
            write!(f, "Event {{ id: {:?}, param: {} }}", data.id, data.param)
        }
    }
}
