//! Host-looper waiter (Linux)
//!
//! On platforms with a native message loop, blocking is delegated to that
//! loop so fd callbacks registered by other components of the host process
//! keep firing while a runner waits. The host loop is reached through a
//! [`LooperBackend`] strategy installed once at startup; there is no lazy
//! dynamic-library probing.
//!
//! Host loopers only support "block until fd-ready or explicit wake", so the
//! waiter realizes deadline wakes with its own timerfd registered with the
//! backend.

use crate::queue::QueueState;
use crate::waiter::{FdEventCallback, FdEvents, IoWaiter};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Minimal contract a host message loop must provide.
///
/// Reference management of the underlying looper is subsumed by `Arc`; a
/// backend that wraps a foreign handle releases it in its own `Drop`.
pub trait LooperBackend: Send + Sync {
    /// Whether the calling thread is the thread the host loop runs on
    fn is_loop_thread(&self) -> bool;

    /// Block in the host loop until fd readiness or an explicit wake;
    /// negative `timeout_ms` blocks indefinitely
    fn poll(&self, timeout_ms: i32);

    /// Interrupt a blocked [`poll`](LooperBackend::poll)
    fn wake(&self);

    /// Register `fd` with the host loop; `callback` fires on readiness.
    /// Backends without fd primitives keep the default.
    fn add_fd(&self, _fd: RawFd, _events: FdEvents, _callback: FdEventCallback) -> bool {
        false
    }

    /// Unregister `fd` from the host loop
    fn remove_fd(&self, _fd: RawFd) -> bool {
        false
    }

    /// Whether [`add_fd`](LooperBackend::add_fd) is available
    fn supports_fd(&self) -> bool {
        false
    }
}

static BACKEND: OnceCell<Arc<dyn LooperBackend>> = OnceCell::new();

/// Install the process-wide looper backend; returns false if one is already
/// installed
pub fn install_looper_backend(backend: Arc<dyn LooperBackend>) -> bool {
    BACKEND.set(backend).is_ok()
}

/// The installed looper backend, if any
pub fn looper_backend() -> Option<Arc<dyn LooperBackend>> {
    BACKEND.get().cloned()
}

/// Waiter that blocks inside a host message loop
pub struct PlatformWaiter {
    backend: Arc<dyn LooperBackend>,
    /// Dedicated timer realizing "wake at deadline" on top of the host loop
    timer_fd: RawFd,
    waiting: AtomicUsize,
    /// Shared with the per-fd trampolines handed to the backend
    callback: Arc<Mutex<Option<FdEventCallback>>>,
}

impl PlatformWaiter {
    /// Create a waiter bound to `backend`, registering its deadline timer
    /// with the host loop. Requires the backend to accept the timer fd; a
    /// backend without fd primitives cannot host a runner queue.
    pub fn new(backend: Arc<dyn LooperBackend>) -> io::Result<Self> {
        let timer_fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timer_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // The timer only needs to interrupt poll; draining keeps it from
        // re-reporting
        let drain_fd = timer_fd;
        let registered = backend.add_fd(
            timer_fd,
            FdEvents::INPUT,
            Arc::new(move |_fd, _events| {
                let mut buffer = [0u8; 8];
                unsafe {
                    libc::read(drain_fd, buffer.as_mut_ptr() as *mut libc::c_void, 8);
                }
            }),
        );
        if !registered {
            unsafe { libc::close(timer_fd) };
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "host loop rejected the deadline timer fd",
            ));
        }

        Ok(Self {
            backend,
            timer_fd,
            waiting: AtomicUsize::new(0),
            callback: Arc::new(Mutex::new(None)),
        })
    }

    /// Arm the deadline timer, or disarm it with `None`
    fn arm_timer(&self, timeout: Option<Duration>) {
        let it_value = match timeout {
            // A zero it_value disarms, so an already-due deadline becomes
            // the shortest possible timer instead
            Some(duration) if duration.is_zero() => libc::timespec {
                tv_sec: 0,
                tv_nsec: 1,
            },
            Some(duration) => libc::timespec {
                tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                tv_nsec: duration.subsec_nanos() as libc::c_long,
            },
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value,
        };
        unsafe {
            libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut());
        }
    }
}

impl IoWaiter for PlatformWaiter {
    fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, QueueState>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, QueueState>, bool) {
        // Host loopers are single-threaded; waiting from any other thread
        // would block inside a loop that is never pumped
        if !self.backend.is_loop_thread() {
            tracing::error!("platform waiter used off the host loop thread");
            return (guard, false);
        }

        let mutex = MutexGuard::mutex(&guard);
        self.arm_timer(timeout);
        self.waiting.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        self.backend.poll(-1);

        self.waiting.fetch_sub(1, Ordering::SeqCst);
        // Disarm so a stale deadline cannot fire into an unrelated poll
        self.arm_timer(None);
        (mutex.lock(), true)
    }

    fn notify_one(&self) {
        if self.waiting.load(Ordering::SeqCst) > 0 {
            self.backend.wake();
        }
    }

    fn notify_all(&self) {
        if self.waiting.load(Ordering::SeqCst) > 0 {
            self.backend.wake();
        }
    }

    fn supports_fd_listening(&self) -> bool {
        self.backend.supports_fd()
    }

    fn add_fd(&self, fd: RawFd, events: FdEvents) -> bool {
        if !self.backend.supports_fd() {
            return false;
        }
        let callback = self.callback.clone();
        self.backend.add_fd(
            fd,
            events,
            Arc::new(move |fd, fd_events| {
                let callback = callback.lock().clone();
                if let Some(callback) = callback {
                    callback(fd, fd_events);
                }
            }),
        )
    }

    fn remove_fd(&self, fd: RawFd) {
        self.backend.remove_fd(fd);
    }

    fn set_fd_event_callback(&self, callback: FdEventCallback) {
        *self.callback.lock() = Some(callback);
    }
}

impl Drop for PlatformWaiter {
    fn drop(&mut self) {
        self.backend.remove_fd(self.timer_fd);
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::CondvarWaiter;
    use rustc_hash::FxHashMap;
    use std::thread::{self, ThreadId};
    use std::time::Instant;

    /// Epoll-based stand-in for a host message loop
    struct TestLooper {
        epoll_fd: RawFd,
        wake_fd: RawFd,
        loop_thread: Mutex<Option<ThreadId>>,
        callbacks: Mutex<FxHashMap<RawFd, FdEventCallback>>,
    }

    impl TestLooper {
        fn new() -> Arc<Self> {
            let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            assert!(epoll_fd >= 0);
            let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            assert!(wake_fd >= 0);
            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: wake_fd as u64,
            };
            unsafe {
                libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev);
            }
            Arc::new(Self {
                epoll_fd,
                wake_fd,
                loop_thread: Mutex::new(None),
                callbacks: Mutex::new(FxHashMap::default()),
            })
        }

        fn bind_current_thread(&self) {
            *self.loop_thread.lock() = Some(thread::current().id());
        }
    }

    impl LooperBackend for TestLooper {
        fn is_loop_thread(&self) -> bool {
            *self.loop_thread.lock() == Some(thread::current().id())
        }

        fn poll(&self, timeout_ms: i32) {
            let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
            let count = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), 8, timeout_ms)
            };
            for event in &events[..count.max(0) as usize] {
                let fd = event.u64 as RawFd;
                if fd == self.wake_fd {
                    let mut buffer = [0u8; 8];
                    unsafe {
                        libc::read(self.wake_fd, buffer.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    continue;
                }
                let callback = self.callbacks.lock().get(&fd).cloned();
                if let Some(callback) = callback {
                    callback(fd, FdEvents::INPUT);
                }
            }
        }

        fn wake(&self) {
            let value: u64 = 1;
            unsafe {
                libc::write(self.wake_fd, &value as *const u64 as *const libc::c_void, 8);
            }
        }

        fn add_fd(&self, fd: RawFd, _events: FdEvents, callback: FdEventCallback) -> bool {
            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: fd as u64,
            };
            let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
            if ret < 0 {
                return false;
            }
            self.callbacks.lock().insert(fd, callback);
            true
        }

        fn remove_fd(&self, fd: RawFd) -> bool {
            self.callbacks.lock().remove(&fd);
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
            true
        }

        fn supports_fd(&self) -> bool {
            true
        }
    }

    fn state() -> Arc<Mutex<QueueState>> {
        Arc::new(Mutex::new(QueueState::with_waiter(Arc::new(
            CondvarWaiter::new(),
        ))))
    }

    #[test]
    fn test_wrong_thread_fails_fast() {
        let looper = TestLooper::new();
        // Loop thread never bound: every thread is the wrong thread
        let waiter = PlatformWaiter::new(looper).unwrap();

        let state = state();
        let guard = state.lock();
        let start = Instant::now();
        let (_guard, ok) = waiter.wait_for(guard, Some(Duration::from_secs(5)));
        assert!(!ok);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_deadline_wakes_poll() {
        let looper = TestLooper::new();
        looper.bind_current_thread();
        let waiter = PlatformWaiter::new(looper).unwrap();

        let state = state();
        let guard = state.lock();
        let start = Instant::now();
        let (_guard, ok) = waiter.wait_for(guard, Some(Duration::from_millis(50)));
        assert!(ok);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wake_interrupts_indefinite_poll() {
        let looper = TestLooper::new();
        looper.bind_current_thread();
        let waiter = Arc::new(PlatformWaiter::new(looper.clone()).unwrap());

        let notifier_waiter = waiter.clone();
        let notifier = thread::spawn(move || {
            while notifier_waiter.waiting.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            notifier_waiter.notify_all();
        });

        let state = state();
        let guard = state.lock();
        let (_guard, ok) = waiter.wait_for(guard, None);
        assert!(ok);
        notifier.join().unwrap();
    }

    #[test]
    fn test_fd_events_forwarded_through_backend() {
        let looper = TestLooper::new();
        looper.bind_current_thread();
        let waiter = PlatformWaiter::new(looper).unwrap();

        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        waiter.set_fd_event_callback(Arc::new(move |fd, events| {
            sink.lock().push((fd, events));
        }));
        assert!(waiter.add_fd(read_fd, FdEvents::INPUT));

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let state = state();
        let guard = state.lock();
        let (_guard, ok) = waiter.wait_for(guard, Some(Duration::from_millis(200)));
        assert!(ok);
        assert_eq!(seen.lock().as_slice(), &[(read_fd, FdEvents::INPUT)]);

        waiter.remove_fd(read_fd);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
