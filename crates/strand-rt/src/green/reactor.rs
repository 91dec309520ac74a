// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll-based readiness notification.
//!
//! Level-triggered epoll. Each descriptor has at most one waiting green
//! thread per direction; a readiness event removes that interest so every
//! watch produces exactly one wake-up.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::task::ThreadId;
use super::timer::TimerId;

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Epoll token reserved for the loop's eventfd.
const NOTIFY_TOKEN: u64 = u64::MAX;

const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITE_EVENTS: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// A green thread parked on descriptor readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub thread: ThreadId,
    /// Timeout timer to cancel once readiness wins the race.
    pub timer: Option<TimerId>,
}

#[derive(Default)]
struct Watch {
    reader: Option<Waiter>,
    writer: Option<Waiter>,
    /// Whether the fd is currently added to the epoll set.
    registered: bool,
}

impl Watch {
    fn events(&self) -> u32 {
        let mut events = 0;
        if self.reader.is_some() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.writer.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn slot(&mut self, interest: Interest) -> &mut Option<Waiter> {
        match interest {
            Interest::Readable => &mut self.reader,
            Interest::Writable => &mut self.writer,
        }
    }
}

/// Stop flag plus eventfd that interrupts `epoll_wait`.
///
/// Shared with [`crate::StopHandle`] so other OS threads can stop the loop.
#[derive(Debug)]
pub(crate) struct Notifier {
    fd: OwnedFd,
    stop: AtomicBool,
}

impl Notifier {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            stop: AtomicBool::new(false),
        })
    }

    /// Wake the reactor out of `epoll_wait`.
    pub fn notify(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.stop.store(false, Ordering::Release);
    }
}

/// Epoll instance plus the per-descriptor watch table.
pub(crate) struct Reactor {
    epoll: OwnedFd,
    notifier: Arc<Notifier>,
    watches: HashMap<RawFd, Watch>,
    events: Vec<libc::epoll_event>,
}

impl Reactor {
    /// Create a new reactor with an epoll instance and wake eventfd.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll_fd) };
        let notifier = Arc::new(Notifier::new()?);

        // Register the eventfd so StopHandle can interrupt epoll_wait.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: NOTIFY_TOKEN,
        };
        let ret = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                notifier.fd.as_raw_fd(),
                &mut ev,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            notifier,
            watches: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Park `waiter` on `fd` for the given direction.
    ///
    /// Returns `Ok(false)` if that direction already has a waiter.
    pub fn watch(&mut self, fd: RawFd, interest: Interest, waiter: Waiter) -> io::Result<bool> {
        let watch = self.watches.entry(fd).or_default();
        let slot = watch.slot(interest);
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(waiter);
        if let Err(err) = self.sync(fd) {
            if let Some(watch) = self.watches.get_mut(&fd) {
                *watch.slot(interest) = None;
            }
            self.prune(fd);
            return Err(err);
        }
        Ok(true)
    }

    /// Drop the waiter for one direction if it belongs to `thread`.
    pub fn unwatch(&mut self, fd: RawFd, interest: Interest, thread: ThreadId) -> Option<Waiter> {
        let watch = self.watches.get_mut(&fd)?;
        let slot = watch.slot(interest);
        if slot.as_ref().map(|w| w.thread) != Some(thread) {
            return None;
        }
        let waiter = slot.take();
        self.resync(fd);
        waiter
    }

    /// Forget a descriptor entirely, returning whoever was parked on it.
    pub fn remove(&mut self, fd: RawFd) -> Vec<Waiter> {
        let Some(mut watch) = self.watches.remove(&fd) else {
            return Vec::new();
        };
        if watch.registered {
            self.ctl_del(fd);
        }
        watch.reader.take().into_iter().chain(watch.writer.take()).collect()
    }

    /// Forget one direction of a descriptor, returning its waiter.
    pub fn remove_interest(&mut self, fd: RawFd, interest: Interest) -> Option<Waiter> {
        let waiter = self.watches.get_mut(&fd)?.slot(interest).take();
        self.resync(fd);
        waiter
    }

    pub fn has_watches(&self) -> bool {
        !self.watches.is_empty()
    }

    /// Run one poll cycle.
    ///
    /// Blocks up to `timeout_ms` (-1 = forever) and returns the waiters whose
    /// descriptors became ready. Their interests are removed before return.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<Vec<Waiter>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new()); // EINTR: retry next cycle.
            }
            return Err(err);
        }

        let mut woken = Vec::new();
        let mut touched = Vec::new();
        for i in 0..n as usize {
            let ev = self.events[i];
            let token = ev.u64;
            let bits = ev.events;

            if token == NOTIFY_TOKEN {
                self.notifier.drain();
                continue;
            }

            let fd = token as RawFd;
            let Some(watch) = self.watches.get_mut(&fd) else {
                continue;
            };
            if bits & READ_EVENTS != 0 {
                woken.extend(watch.reader.take());
            }
            if bits & WRITE_EVENTS != 0 {
                woken.extend(watch.writer.take());
            }
            touched.push(fd);
        }

        for fd in touched {
            self.resync(fd);
        }
        Ok(woken)
    }

    /// `sync` for paths that cannot report failure. Waiters stay in the
    /// table either way; `remove` still returns them.
    fn resync(&mut self, fd: RawFd) {
        if let Err(err) = self.sync(fd) {
            tracing::debug!("epoll_ctl on fd {} failed: {}", fd, err);
        }
    }

    /// Bring the epoll registration of `fd` in line with its watch.
    fn sync(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(watch) = self.watches.get_mut(&fd) else {
            return Ok(());
        };
        let events = watch.events();

        if events == 0 {
            self.prune(fd);
            return Ok(());
        }

        let op = if watch.registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        watch.registered = true;
        Ok(())
    }

    /// Drop an idle watch entry and its epoll registration.
    fn prune(&mut self, fd: RawFd) {
        let idle = self
            .watches
            .get(&fd)
            .is_some_and(|w| w.reader.is_none() && w.writer.is_none());
        if !idle {
            return;
        }
        if let Some(watch) = self.watches.remove(&fd) {
            if watch.registered {
                self.ctl_del(fd);
            }
        }
    }

    fn ctl_del(&self, fd: RawFd) {
        // ENOENT / EBADF are expected if the fd was already closed.
        unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn waiter(id: u64) -> Waiter {
        Waiter {
            thread: ThreadId::from_raw(id),
            timer: None,
        }
    }

    #[test]
    fn failed_resync_keeps_remaining_waiter() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();
        assert!(reactor.watch(read_fd, Interest::Readable, waiter(1)).unwrap());
        assert!(reactor.watch(read_fd, Interest::Writable, waiter(2)).unwrap());

        // The MOD issued by unwatch now fails with EBADF.
        close(read_fd);
        assert_eq!(
            reactor.unwatch(read_fd, Interest::Writable, ThreadId::from_raw(2)),
            Some(waiter(2))
        );
        assert!(reactor.has_watches());
        assert_eq!(reactor.remove(read_fd), vec![waiter(1)]);
        assert!(!reactor.has_watches());

        close(write_fd);
    }

    #[test]
    fn reactor_pipe_readiness() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        assert!(reactor.watch(read_fd, Interest::Readable, waiter(1)).unwrap());
        assert!(reactor.has_watches());

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let woken = reactor.poll(100).unwrap();
        assert_eq!(woken, vec![waiter(1)]);
        // One-shot: the interest is gone after it fired.
        assert!(!reactor.has_watches());

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn one_waiter_per_direction() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        assert!(reactor.watch(read_fd, Interest::Readable, waiter(1)).unwrap());
        assert!(!reactor.watch(read_fd, Interest::Readable, waiter(2)).unwrap());

        // Only the owner can withdraw its watch.
        assert!(reactor.unwatch(read_fd, Interest::Readable, ThreadId::from_raw(2)).is_none());
        assert_eq!(
            reactor.unwatch(read_fd, Interest::Readable, ThreadId::from_raw(1)),
            Some(waiter(1))
        );
        assert!(!reactor.has_watches());

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn remove_returns_all_waiters() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        reactor.watch(read_fd, Interest::Readable, waiter(1)).unwrap();
        reactor.watch(write_fd, Interest::Writable, waiter(2)).unwrap();

        assert_eq!(reactor.remove(read_fd), vec![waiter(1)]);
        assert_eq!(reactor.remove(read_fd), Vec::new());
        assert!(reactor.has_watches());
        assert_eq!(reactor.remove_interest(write_fd, Interest::Writable), Some(waiter(2)));
        assert!(!reactor.has_watches());

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn notifier_interrupts_poll() {
        let mut reactor = Reactor::new(8).unwrap();
        let notifier = reactor.notifier().clone();
        notifier.request_stop();
        let woken = reactor.poll(1000).unwrap();
        assert!(woken.is_empty());
        assert!(notifier.stop_requested());
        notifier.reset();
        assert!(!notifier.stop_requested());
    }

    #[test]
    fn reactor_timeout_no_events() {
        let mut reactor = Reactor::new(8).unwrap();
        assert!(reactor.poll(1).unwrap().is_empty());
    }
}
