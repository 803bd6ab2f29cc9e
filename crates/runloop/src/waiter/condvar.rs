//! Condition-variable waiter, the default blocking primitive
//!
//! No file-descriptor support. The retrieval loop re-evaluates queue state
//! after every wakeup, so spurious wakeups from the condition variable are
//! harmless.

use crate::queue::QueueState;
use crate::waiter::IoWaiter;
use parking_lot::{Condvar, MutexGuard};
use std::time::Duration;

/// Cap on a single timed wait; longer requests cannot overflow the deadline
/// arithmetic and simply re-wait
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Waiter backed by a plain condition variable
pub struct CondvarWaiter {
    cond: Condvar,
}

impl CondvarWaiter {
    /// Create a waiter with no one waiting
    pub fn new() -> Self {
        Self {
            cond: Condvar::new(),
        }
    }
}

impl Default for CondvarWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl IoWaiter for CondvarWaiter {
    fn wait_for<'a>(
        &self,
        mut guard: MutexGuard<'a, QueueState>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, QueueState>, bool) {
        match timeout {
            Some(duration) => {
                self.cond.wait_for(&mut guard, duration.min(MAX_WAIT));
            }
            None => self.cond.wait(&mut guard),
        }
        (guard, true)
    }

    fn notify_one(&self) {
        self.cond.notify_one();
    }

    fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn state() -> Arc<Mutex<QueueState>> {
        Arc::new(Mutex::new(QueueState::with_waiter(Arc::new(
            CondvarWaiter::new(),
        ))))
    }

    #[test]
    fn test_wait_times_out() {
        let waiter = CondvarWaiter::new();
        let state = state();

        let guard = state.lock();
        let start = Instant::now();
        let (_guard, ok) = waiter.wait_for(guard, Some(Duration::from_millis(20)));
        assert!(ok);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_notify_wakes_waiting_thread() {
        let waiter = Arc::new(CondvarWaiter::new());
        let state = state();

        let thread_waiter = waiter.clone();
        let thread_state = state.clone();
        let handle = thread::spawn(move || {
            let guard = thread_state.lock();
            let (_guard, ok) = thread_waiter.wait_for(guard, Some(Duration::from_secs(10)));
            ok
        });

        thread::sleep(Duration::from_millis(50));
        {
            let _guard = state.lock();
            waiter.notify_all();
        }
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_notify_without_waiters_is_noop() {
        let waiter = CondvarWaiter::new();
        waiter.notify_one();
        waiter.notify_all();
    }

    #[test]
    fn test_oversized_timeout_is_clamped() {
        let waiter = Arc::new(CondvarWaiter::new());
        let state = state();

        let notifier_waiter = waiter.clone();
        let notifier_state = state.clone();
        let notifier = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let _guard = notifier_state.lock();
            notifier_waiter.notify_all();
        });

        // Must not panic on deadline arithmetic with an absurd duration
        let guard = state.lock();
        let (_guard, ok) = waiter.wait_for(guard, Some(Duration::from_secs(u64::MAX / 2)));
        assert!(ok);
        notifier.join().unwrap();
    }
}
