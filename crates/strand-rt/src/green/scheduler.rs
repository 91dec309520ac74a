// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded scheduler and event loop.
//!
//! One scheduler per OS thread. Each loop iteration polls the threads that
//! were ready when the iteration began, waits on the reactor (bounded by the
//! next timer), resumes threads whose descriptors became ready, then fires
//! expired timers in deadline order.
//!
//! Green threads suspend through [`pause`] and are reactivated by
//! [`resume`], optionally with an error that `pause` then returns.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use super::reactor::{Interest, Notifier, Reactor, Waiter};
use super::task::{task_waker, BoxFuture, Outcome, ThreadId};
use super::thread::Thread;
use super::timer::{TimerCallback, TimerId, TimerQueue};
use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Error, Result};

pub(crate) struct Scheduler {
    config: RuntimeConfig,
    reactor: RefCell<Reactor>,
    notifier: Arc<Notifier>,
    timers: RefCell<TimerQueue>,
    /// Runnable thread ids in FIFO order.
    ready: RefCell<VecDeque<ThreadId>>,
    /// Live-thread registry: started and not yet finished.
    threads: RefCell<HashMap<ThreadId, Thread>>,
    current: Cell<Option<ThreadId>>,
    next_id: Cell<u64>,
    running: Cell<bool>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let config = config.clamped();
        let reactor = Reactor::new(config.max_events)?;
        let notifier = reactor.notifier().clone();
        Ok(Self {
            config,
            reactor: RefCell::new(reactor),
            notifier,
            timers: RefCell::new(TimerQueue::new()),
            ready: RefCell::new(VecDeque::new()),
            threads: RefCell::new(HashMap::new()),
            current: Cell::new(None),
            next_id: Cell::new(1),
            running: Cell::new(false),
        })
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn next_thread_id(&self) -> ThreadId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        ThreadId::from_raw(id)
    }

    pub fn current_id(&self) -> Option<ThreadId> {
        self.current.get()
    }

    pub fn current_thread(&self) -> Option<Thread> {
        self.current.get().and_then(|id| self.thread(id))
    }

    pub fn thread(&self, id: ThreadId) -> Option<Thread> {
        self.threads.borrow().get(&id).cloned()
    }

    /// Live threads ordered by id.
    pub fn threads(&self) -> Vec<Thread> {
        let mut threads: Vec<Thread> = self.threads.borrow().values().cloned().collect();
        threads.sort_by_key(|t| t.id());
        threads
    }

    /// Add a started thread to the registry and queue its first poll.
    pub fn register(&self, thread: Thread) {
        let id = thread.id();
        self.threads.borrow_mut().insert(id, thread);
        trace!("Registered green thread {}", id);
        self.schedule(id);
    }

    /// Queue a live thread for polling. Already-queued threads stay put.
    pub fn schedule(&self, id: ThreadId) {
        let Some(thread) = self.thread(id) else {
            return;
        };
        let inner = thread.inner();
        if inner.finished.get() || inner.queued.replace(true) {
            return;
        }
        self.ready.borrow_mut().push_back(id);
    }

    /// Wake a paused thread, optionally making its `pause` fail with `error`.
    ///
    /// Returns false, and does nothing, if the thread is not paused or a
    /// wake-up is already pending.
    pub fn resume(&self, id: ThreadId, error: Option<Error>) -> bool {
        let Some(thread) = self.thread(id) else {
            debug!("Ignoring resume of unknown green thread {}", id);
            return false;
        };
        let inner = thread.inner();
        if !inner.parked.get() || inner.wakeup.borrow().is_some() {
            debug!("Ignoring resume of green thread {} that is not paused", id);
            return false;
        }
        inner.parked.set(false);
        *inner.wakeup.borrow_mut() = Some(match error {
            Some(err) => Err(err),
            None => Ok(()),
        });
        trace!("Resumed green thread {}", id);
        self.schedule(id);
        true
    }

    pub fn call_later(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.call_at(Instant::now() + delay, callback)
    }

    pub fn call_at(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        self.timers.borrow_mut().schedule(deadline, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    pub fn watch(&self, fd: RawFd, interest: Interest, waiter: Waiter) -> Result<bool> {
        Ok(self.reactor.borrow_mut().watch(fd, interest, waiter)?)
    }

    pub fn unwatch(&self, fd: RawFd, interest: Interest, thread: ThreadId) -> Option<Waiter> {
        self.reactor.borrow_mut().unwatch(fd, interest, thread)
    }

    /// Drop every watch on `fd`, waking the waiters without an error.
    pub fn release_fd(&self, fd: RawFd) -> usize {
        let waiters = self.reactor.borrow_mut().remove(fd);
        let count = waiters.len();
        for waiter in waiters {
            self.wake_waiter(waiter);
        }
        count
    }

    /// Drop one direction's watch on `fd`, waking its waiter.
    pub fn release_interest(&self, fd: RawFd, interest: Interest) -> bool {
        let waiter = self.reactor.borrow_mut().remove_interest(fd, interest);
        match waiter {
            Some(waiter) => {
                self.wake_waiter(waiter);
                true
            }
            None => false,
        }
    }

    fn wake_waiter(&self, waiter: Waiter) {
        if let Some(timer) = waiter.timer {
            self.cancel_timer(timer);
        }
        self.resume(waiter.thread, None);
    }

    /// Ask the running loop to return. No-op when it isn't running.
    pub fn stop(&self) {
        if self.running.get() {
            self.notifier.request_stop();
        }
    }

    /// Drive the loop until stopped or out of work.
    pub fn run(&self) -> Result<()> {
        if self.running.replace(true) {
            return Err(Error::LoopRunning);
        }
        let _running = RunGuard(self);
        trace!("Event loop started");

        loop {
            if self.notifier.stop_requested() {
                break;
            }

            self.run_ready();

            if self.notifier.stop_requested() {
                break;
            }

            let has_ready = !self.ready.borrow().is_empty();
            let next_deadline = self.timers.borrow_mut().next_deadline();
            if !has_ready && next_deadline.is_none() && !self.reactor.borrow().has_watches() {
                trace!("Event loop has no pending work");
                break;
            }

            let timeout_ms = if has_ready {
                0
            } else {
                match next_deadline {
                    Some(deadline) => poll_timeout(deadline, Instant::now()),
                    None => -1,
                }
            };

            let woken = self.reactor.borrow_mut().poll(timeout_ms)?;
            for waiter in woken {
                self.wake_waiter(waiter);
            }

            self.fire_timers();
        }

        trace!("Event loop stopped");
        Ok(())
    }

    fn run_ready(&self) {
        let queued = self.ready.borrow().len();
        let budget = self.config.max_batch.map_or(queued, |max| queued.min(max));
        for _ in 0..budget {
            let Some(id) = self.ready.borrow_mut().pop_front() else {
                break;
            };
            self.poll_thread(id);
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let Some(callback) = self.timers.borrow_mut().pop_expired(now) else {
                break;
            };
            callback();
        }
    }

    fn poll_thread(&self, id: ThreadId) {
        let Some(thread) = self.thread(id) else {
            return;
        };
        let inner = thread.inner();
        inner.queued.set(false);
        if inner.finished.get() {
            return;
        }
        let Some(mut body) = inner.body.borrow_mut().take() else {
            return;
        };

        let prev = self.current.replace(Some(id));
        let waker = task_waker(id);
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
        self.current.set(prev);

        match polled {
            Ok(Poll::Pending) => {
                *inner.body.borrow_mut() = Some(body);
            }
            Ok(Poll::Ready(outcome)) => {
                self.drop_body(id, body);
                self.report(&thread, outcome);
                self.finish(&thread);
            }
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!("Green thread {} ({}) panicked: {}", thread.name(), id, msg);
                self.drop_body(id, body);
                self.finish(&thread);
            }
        }
    }

    fn report(&self, thread: &Thread, outcome: Outcome) {
        match outcome {
            Outcome::Completed => trace!("Green thread {} completed", thread.id()),
            Outcome::Failed { message, cancelled } => {
                if cancelled || thread.inner().stopped.get() {
                    debug!("Green thread {} ({}) stopped: {}", thread.name(), thread.id(), message);
                } else {
                    error!("Green thread {} ({}) failed: {}", thread.name(), thread.id(), message);
                }
            }
        }
    }

    /// Drop a body with its own thread marked current so guards held inside
    /// it release on behalf of the right owner.
    fn drop_body(&self, id: ThreadId, body: BoxFuture) {
        let prev = self.current.replace(Some(id));
        if panic::catch_unwind(AssertUnwindSafe(move || drop(body))).is_err() {
            error!("Green thread {} panicked while dropping its state", id);
        }
        self.current.set(prev);
    }

    fn finish(&self, thread: &Thread) {
        let inner = thread.inner();
        inner.finished.set(true);
        inner.parked.set(false);
        inner.cancel_requested.set(false);
        inner.wakeup.borrow_mut().take();
        self.threads.borrow_mut().remove(&inner.id);
        trace!("Green thread {} finished", inner.id);
        inner.done.set();
    }

    /// Drop all live threads, timers and queued work.
    pub fn teardown(&self) {
        let threads: Vec<Thread> = {
            let mut registry = self.threads.borrow_mut();
            let mut threads: Vec<Thread> = registry.drain().map(|(_, t)| t).collect();
            threads.sort_by_key(|t| t.id());
            threads
        };
        self.ready.borrow_mut().clear();

        for thread in &threads {
            let inner = thread.inner();
            inner.finished.set(true);
            inner.parked.set(false);
            inner.wakeup.borrow_mut().take();
            let body = inner.body.borrow_mut().take();
            if let Some(body) = body {
                self.drop_body(inner.id, body);
            }
        }

        let callbacks = self.timers.borrow_mut().clear();
        drop(callbacks);
        self.ready.borrow_mut().clear();
        debug!("Scheduler torn down ({} live threads dropped)", threads.len());
    }
}

/// Resets the running flag and any stale stop request when `run` returns.
struct RunGuard<'a>(&'a Scheduler);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.set(false);
        self.0.notifier.reset();
    }
}

/// Milliseconds until `deadline`, rounded up so timers never fire early.
fn poll_timeout(deadline: Instant, now: Instant) -> i32 {
    let wait = deadline.saturating_duration_since(now);
    let ms = wait.as_nanos().div_ceil(1_000_000);
    ms.min(i32::MAX as u128) as i32
}

enum PauseState {
    Start,
    Parked(ThreadId),
    Done,
}

/// Future returned by [`pause`].
#[must_use = "futures do nothing unless awaited"]
pub struct Pause {
    state: PauseState,
}

/// Suspend the current green thread until [`resume`] targets it.
///
/// Resolves to the error passed to `resume`, if any. A cancellation that was
/// requested while the thread was runnable is delivered here immediately.
pub fn pause() -> Pause {
    Pause {
        state: PauseState::Start,
    }
}

impl Future for Pause {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        match self.state {
            PauseState::Start => {
                let sched = match context::scheduler() {
                    Ok(sched) => sched,
                    Err(err) => return Poll::Ready(Err(err)),
                };
                let Some(thread) = sched.current_thread() else {
                    self.state = PauseState::Done;
                    return Poll::Ready(Err(Error::OutsideThread));
                };
                let inner = thread.inner();
                if inner.cancel_requested.replace(false) {
                    self.state = PauseState::Done;
                    return Poll::Ready(Err(Error::Cancelled));
                }
                inner.parked.set(true);
                self.state = PauseState::Parked(inner.id);
                Poll::Pending
            }
            PauseState::Parked(id) => {
                let Some(thread) = context::try_scheduler().and_then(|s| s.thread(id)) else {
                    self.state = PauseState::Done;
                    return Poll::Ready(Err(Error::Cancelled));
                };
                let wakeup = thread.inner().wakeup.borrow_mut().take();
                match wakeup {
                    Some(result) => {
                        self.state = PauseState::Done;
                        Poll::Ready(result)
                    }
                    // Spurious poll: stay parked.
                    None => Poll::Pending,
                }
            }
            PauseState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Pause {
    fn drop(&mut self) {
        let PauseState::Parked(id) = self.state else {
            return;
        };
        if let Some(thread) = context::try_scheduler().and_then(|s| s.thread(id)) {
            let inner = thread.inner();
            inner.parked.set(false);
            inner.wakeup.borrow_mut().take();
        }
    }
}

/// Reactivate a paused green thread. See [`pause`].
///
/// Returns whether the thread was woken. Resuming a thread that is not
/// paused is logged and ignored.
pub fn resume(id: ThreadId, error: Option<Error>) -> bool {
    match context::try_scheduler() {
        Some(sched) => sched.resume(id, error),
        None => false,
    }
}

/// Withdraws an I/O watch and its timeout timer when the wait ends.
struct IoWaitGuard {
    fd: RawFd,
    interest: Interest,
    thread: ThreadId,
    timer: Option<TimerId>,
}

impl Drop for IoWaitGuard {
    fn drop(&mut self) {
        if let Some(sched) = context::try_scheduler() {
            sched.unwatch(self.fd, self.interest, self.thread);
            if let Some(timer) = self.timer {
                sched.cancel_timer(timer);
            }
        }
    }
}

/// Suspend the current green thread until `fd` is ready for `interest`.
///
/// Fails with [`Error::WaitTimeout`] once `timeout` elapses, and with
/// [`Error::DescriptorBusy`] if another thread already waits on the same
/// direction of `fd`. A thread woken by [`release_fd`] returns `Ok` and must
/// re-check whatever owns the descriptor.
pub async fn wait_io(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<()> {
    let sched = context::scheduler()?;
    let me = sched.current_id().ok_or(Error::OutsideThread)?;
    if timeout == Some(Duration::ZERO) {
        return Err(Error::WaitTimeout);
    }

    let timer = timeout.map(|delay| {
        sched.call_later(
            delay,
            Box::new(move || {
                let Some(sched) = context::try_scheduler() else {
                    return;
                };
                if sched.unwatch(fd, interest, me).is_some() {
                    sched.resume(me, Some(Error::WaitTimeout));
                }
            }),
        )
    });

    let registered = sched.watch(fd, interest, Waiter { thread: me, timer });
    let registered = match registered {
        Ok(registered) => registered,
        Err(err) => {
            if let Some(timer) = timer {
                sched.cancel_timer(timer);
            }
            return Err(err);
        }
    };
    if !registered {
        if let Some(timer) = timer {
            sched.cancel_timer(timer);
        }
        return Err(Error::DescriptorBusy { fd });
    }
    drop(sched);

    let _guard = IoWaitGuard {
        fd,
        interest,
        thread: me,
        timer,
    };
    pause().await
}

/// Forget every I/O watch on `fd`, waking the parked threads.
///
/// Call before closing a descriptor. Returns the number of threads woken.
pub fn release_fd(fd: RawFd) -> usize {
    context::try_scheduler().map_or(0, |sched| sched.release_fd(fd))
}

/// Forget the watch for one direction of `fd`, waking its thread.
pub fn release_interest(fd: RawFd, interest: Interest) -> bool {
    context::try_scheduler().is_some_and(|sched| sched.release_interest(fd, interest))
}
