//! Deferred reclamation of runner threads
//!
//! Stopping or dropping a runner must never block its caller on a thread
//! join. Spawned runner threads are deposited here together with an exit
//! closure; when a run loop exits naturally the thread announces itself
//! with [`reclaim_current_thread`] and a single background reaper joins it
//! off the critical path. [`drain`] stops and joins everything outstanding
//! synchronously, for process shutdown and for tests.
//!
//! The collector is an ordinary constructible service; runners use the
//! process-wide [`global`](ThreadCollector::global) instance, tests may
//! build their own.
//!
//! [`reclaim_current_thread`]: ThreadCollector::reclaim_current_thread
//! [`drain`]: ThreadCollector::drain

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// How long `drain` waits for any single thread before detaching it
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct DepositedThread {
    handle: JoinHandle<()>,
    /// Asks the thread's run loop to exit; invoked by `drain`
    exit: Option<Box<dyn FnOnce() + Send>>,
}

struct CollectorInner {
    deposited: Mutex<FxHashMap<ThreadId, DepositedThread>>,
}

static GLOBAL: Lazy<ThreadCollector> = Lazy::new(ThreadCollector::new);

/// Background reclaimer of finished runner threads
pub struct ThreadCollector {
    inner: Arc<CollectorInner>,
    reclaim_tx: Mutex<Option<Sender<ThreadId>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadCollector {
    /// Create a collector with its own reaper thread
    pub fn new() -> Self {
        let (reclaim_tx, reclaim_rx) = channel::unbounded::<ThreadId>();
        let inner = Arc::new(CollectorInner {
            deposited: Mutex::new(FxHashMap::default()),
        });

        let reaper_inner = inner.clone();
        let reaper = thread::Builder::new()
            .name("runloop-collector".to_string())
            .spawn(move || Self::reaper_loop(reaper_inner, reclaim_rx))
            .expect("failed to spawn collector thread");

        Self {
            inner,
            reclaim_tx: Mutex::new(Some(reclaim_tx)),
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// The process-wide collector used by runners
    pub fn global() -> &'static ThreadCollector {
        &GLOBAL
    }

    /// Store a spawned thread and its exit closure for later
    /// stopping-and-joining
    pub fn deposit(&self, handle: JoinHandle<()>, exit: Box<dyn FnOnce() + Send>) {
        let thread_id = handle.thread().id();
        self.inner.deposited.lock().insert(
            thread_id,
            DepositedThread {
                handle,
                exit: Some(exit),
            },
        );
    }

    /// Announce that the calling thread's run loop has exited. Enqueues the
    /// thread for the reaper and returns immediately.
    pub fn reclaim_current_thread(&self) {
        if let Some(tx) = &*self.reclaim_tx.lock() {
            let _ = tx.send(thread::current().id());
        }
    }

    /// Number of deposited threads not yet reclaimed
    pub fn pending_count(&self) -> usize {
        self.inner.deposited.lock().len()
    }

    /// Stop and join every outstanding thread synchronously
    pub fn drain(&self) {
        let entries: Vec<DepositedThread> = {
            let mut deposited = self.inner.deposited.lock();
            deposited.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in entries {
            if let Some(exit) = entry.exit.take() {
                exit();
            }
            Self::join_with_timeout(entry.handle, JOIN_TIMEOUT);
        }
    }

    fn reaper_loop(inner: Arc<CollectorInner>, reclaim_rx: Receiver<ThreadId>) {
        while let Ok(thread_id) = reclaim_rx.recv() {
            let entry = inner.deposited.lock().remove(&thread_id);
            if let Some(entry) = entry {
                // The thread announced itself on its way out; this join is
                // quick and off every caller's critical path
                let _ = entry.handle.join();
                tracing::debug!(?thread_id, "runner thread reclaimed");
            }
        }
    }

    /// Join a thread with timeout, detach if stuck
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                tracing::warn!("thread did not exit in time, detaching");
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Default for ThreadCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadCollector {
    fn drop(&mut self) {
        self.drain();
        // Disconnect the channel so the reaper exits, then join it
        self.reclaim_tx.lock().take();
        if let Some(reaper) = self.reaper.lock().take() {
            Self::join_with_timeout(reaper, JOIN_TIMEOUT);
        }
    }
}

/// Drains the global collector when dropped. Hold one in `main` to get a
/// synchronous join of all runner threads at process shutdown.
#[must_use]
pub struct CollectorGuard;

impl CollectorGuard {
    /// Create the guard
    pub fn new() -> Self {
        CollectorGuard
    }
}

impl Default for CollectorGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        ThreadCollector::global().drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_reclaim_joins_thread_in_background() {
        let collector = ThreadCollector::new();
        let collector = Arc::new(collector);

        let announce = collector.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            announce.reclaim_current_thread();
        });
        collector.deposit(handle, Box::new(|| {}));
        assert_eq!(collector.pending_count(), 1);

        // The reaper picks the thread up without anyone joining explicitly
        let start = Instant::now();
        while collector.pending_count() != 0 {
            assert!(start.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_drain_invokes_exit_and_joins() {
        let collector = ThreadCollector::new();
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = stop.clone();
        let handle = thread::spawn(move || {
            while !worker_stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        });

        let exit_stop = stop.clone();
        collector.deposit(
            handle,
            Box::new(move || exit_stop.store(true, Ordering::Release)),
        );

        collector.drain();
        assert_eq!(collector.pending_count(), 0);
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_drop_stops_reaper() {
        let collector = ThreadCollector::new();
        drop(collector);
        // Dropping with nothing deposited must not hang
    }
}
