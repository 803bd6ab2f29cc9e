//! Ambient per-thread bindings
//!
//! "The calling thread's runner" and "the handler currently distributing"
//! are ambient capabilities. This registry is the one component that owns
//! the backing thread-local slots; everything else goes through its methods,
//! keeping the storage in one testable place.

use crate::handler::Handler;
use crate::runner::EventRunner;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

thread_local! {
    static CURRENT_RUNNER: RefCell<Option<Weak<EventRunner>>> = const { RefCell::new(None) };
    /// Strong retention for runners constructed lazily for host-loop
    /// threads; they live as long as the thread does
    static RETAINED_RUNNER: RefCell<Option<Arc<EventRunner>>> = const { RefCell::new(None) };
    static DISTRIBUTING_HANDLER: RefCell<Option<Weak<Handler>>> = const { RefCell::new(None) };
}

/// Facade over the thread-local runner/handler slots
pub struct RunnerRegistry;

impl RunnerRegistry {
    /// Bind `runner` as the calling thread's runner, returning the previous
    /// binding so nested `run()` calls can restore it
    pub(crate) fn bind_runner(runner: Weak<EventRunner>) -> Option<Weak<EventRunner>> {
        CURRENT_RUNNER.with(|slot| slot.borrow_mut().replace(runner))
    }

    /// Restore a binding captured by [`bind_runner`](RunnerRegistry::bind_runner)
    pub(crate) fn restore_runner(previous: Option<Weak<EventRunner>>) {
        CURRENT_RUNNER.with(|slot| *slot.borrow_mut() = previous);
    }

    /// The runner bound to the calling thread, if it is still alive
    pub fn current_runner() -> Option<Arc<EventRunner>> {
        CURRENT_RUNNER.with(|slot| slot.borrow().as_ref()?.upgrade())
    }

    /// Keep a lazily-created runner alive for the rest of this thread's
    /// lifetime and bind it
    pub(crate) fn retain_runner(runner: Arc<EventRunner>) {
        Self::bind_runner(Arc::downgrade(&runner));
        RETAINED_RUNNER.with(|slot| *slot.borrow_mut() = Some(runner));
    }

    /// Mark `handler` as currently distributing on this thread, returning
    /// the previous mark for nested (inline synchronous) distribution
    pub(crate) fn bind_distributing_handler(handler: Weak<Handler>) -> Option<Weak<Handler>> {
        DISTRIBUTING_HANDLER.with(|slot| slot.borrow_mut().replace(handler))
    }

    /// Restore a mark captured by
    /// [`bind_distributing_handler`](RunnerRegistry::bind_distributing_handler)
    pub(crate) fn restore_distributing_handler(previous: Option<Weak<Handler>>) {
        DISTRIBUTING_HANDLER.with(|slot| *slot.borrow_mut() = previous);
    }

    /// The handler whose event is being distributed on this thread, if any
    pub fn current_handler() -> Option<Arc<Handler>> {
        DISTRIBUTING_HANDLER.with(|slot| slot.borrow().as_ref()?.upgrade())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_binding_roundtrip() {
        assert!(RunnerRegistry::current_runner().is_none());

        let runner = EventRunner::create(false).unwrap();
        let previous = RunnerRegistry::bind_runner(Arc::downgrade(&runner));
        assert!(previous.is_none());
        assert!(Arc::ptr_eq(
            &RunnerRegistry::current_runner().unwrap(),
            &runner
        ));

        RunnerRegistry::restore_runner(previous);
        assert!(RunnerRegistry::current_runner().is_none());
    }

    #[test]
    fn test_dead_runner_is_not_current() {
        let runner = EventRunner::create(false).unwrap();
        let previous = RunnerRegistry::bind_runner(Arc::downgrade(&runner));
        drop(runner);
        assert!(RunnerRegistry::current_runner().is_none());
        RunnerRegistry::restore_runner(previous);
    }
}
