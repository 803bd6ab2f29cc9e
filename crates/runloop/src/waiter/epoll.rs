//! Epoll-backed waiter with eventfd wakeup (Linux)
//!
//! Owns one epoll instance plus an eventfd whose only purpose is to
//! interrupt `epoll_wait`. Notification writes the eventfd only when at
//! least one thread is currently blocked, and every wakeup it causes drains
//! the eventfd so the signal does not stick across waits.

use crate::queue::QueueState;
use crate::waiter::{FdEventCallback, FdEvents, IoWaiter};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MAX_EVENTS: usize = 8;

/// Waiter that blocks in `epoll_wait`, woken by an eventfd or by readiness
/// on a registered descriptor
pub struct EpollWaiter {
    epoll_fd: RawFd,
    /// Eventfd used purely to interrupt `epoll_wait`
    wake_fd: RawFd,
    /// Number of threads currently blocked; wakeups are skipped at zero
    waiting: AtomicUsize,
    callback: Mutex<Option<FdEventCallback>>,
}

impl EpollWaiter {
    /// Create the epoll instance and wake eventfd; either failing is a
    /// resource error surfaced to the caller that requested fd support
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            waiting: AtomicUsize::new(0),
            callback: Mutex::new(None),
        })
    }

    fn wake(&self) {
        if self.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        let value: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd,
                &value as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    fn drain_wake_fd(&self) {
        let mut buffer = [0u8; 8];
        unsafe {
            libc::read(self.wake_fd, buffer.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    fn to_epoll_mask(events: FdEvents) -> u32 {
        let mut mask = 0u32;
        if events.contains(FdEvents::INPUT) {
            mask |= libc::EPOLLIN as u32;
        }
        if events.contains(FdEvents::OUTPUT) {
            mask |= libc::EPOLLOUT as u32;
        }
        // SHUTDOWN and EXCEPTION are always reported by epoll
        mask
    }

    fn from_epoll_mask(mask: u32) -> FdEvents {
        let mut events = FdEvents::empty();
        if mask & libc::EPOLLIN as u32 != 0 {
            events |= FdEvents::INPUT;
        }
        if mask & libc::EPOLLOUT as u32 != 0 {
            events |= FdEvents::OUTPUT;
        }
        if mask & libc::EPOLLHUP as u32 != 0 {
            events |= FdEvents::SHUTDOWN;
        }
        if mask & libc::EPOLLERR as u32 != 0 {
            events |= FdEvents::EXCEPTION;
        }
        events
    }
}

impl IoWaiter for EpollWaiter {
    fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, QueueState>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, QueueState>, bool) {
        let mutex = MutexGuard::mutex(&guard);
        self.waiting.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        // Round up so sub-millisecond timeouts still sleep
        let timeout_ms: i32 = match timeout {
            Some(duration) => duration
                .as_nanos()
                .div_ceil(1_000_000)
                .min(i32::MAX as u128) as i32,
            None => -1,
        };

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let mut ok = true;
        let mut fired: Vec<(RawFd, FdEvents)> = Vec::new();
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!("epoll_wait failed: {}", err);
                ok = false;
            }
        } else {
            for event in &events[..count as usize] {
                let fd = event.u64 as RawFd;
                if fd == self.wake_fd {
                    self.drain_wake_fd();
                    continue;
                }
                let abstract_events = Self::from_epoll_mask(event.events);
                if !abstract_events.is_empty() {
                    fired.push((fd, abstract_events));
                }
            }
        }

        // Deliver readiness while unlocked: the callback posts back into the
        // queue and needs the queue lock
        if !fired.is_empty() {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                for (fd, fd_events) in fired {
                    callback(fd, fd_events);
                }
            }
        }

        (mutex.lock(), ok)
    }

    fn notify_one(&self) {
        self.wake();
    }

    fn notify_all(&self) {
        self.wake();
    }

    fn supports_fd_listening(&self) -> bool {
        true
    }

    fn add_fd(&self, fd: RawFd, events: FdEvents) -> bool {
        let mut ev = libc::epoll_event {
            events: Self::to_epoll_mask(events),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            tracing::warn!(fd, "epoll_ctl add failed: {}", io::Error::last_os_error());
            return false;
        }
        true
    }

    fn remove_fd(&self, fd: RawFd) {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected when the fd was already closed
            if err.raw_os_error() != Some(libc::ENOENT)
                && err.raw_os_error() != Some(libc::EBADF)
            {
                tracing::warn!(fd, "epoll_ctl del failed: {}", err);
            }
        }
    }

    fn set_fd_event_callback(&self, callback: FdEventCallback) {
        *self.callback.lock() = Some(callback);
    }
}

impl Drop for EpollWaiter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
