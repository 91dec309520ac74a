// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green thread handles.
//!
//! A [`Thread`] wraps an `async` body. Starting it registers it with the
//! scheduler's live-thread registry, which keeps it reachable until the body
//! finishes. Handles are cheap to clone and compare by identity.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use super::task::{BoxFuture, Outcome, ThreadId, ThreadState};
use crate::context;
use crate::error::{Error, Result};
use crate::sync::Event;

pub(crate) struct ThreadInner {
    pub id: ThreadId,
    pub name: String,
    pub started: Cell<bool>,
    pub finished: Cell<bool>,
    /// Suspended in `pause` with no wake-up delivered yet.
    pub parked: Cell<bool>,
    /// Present in the ready queue.
    pub queued: Cell<bool>,
    /// Outcome handed to the pending `pause` by `resume`.
    pub wakeup: RefCell<Option<Result<()>>>,
    /// Cancellation to deliver at the next suspension point.
    pub cancel_requested: Cell<bool>,
    /// `stop` was called at least once.
    pub stopped: Cell<bool>,
    pub body: RefCell<Option<BoxFuture>>,
    /// Set when the thread finishes; joiners wait on it.
    pub done: Event,
}

/// Handle to a green thread.
#[derive(Clone)]
pub struct Thread {
    inner: Rc<ThreadInner>,
}

/// Thread factory, mirroring `std::thread::Builder`.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the thread. Defaults to `strand-<id>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Create the thread without starting it.
    pub fn build<F, E>(self, body: F) -> Result<Thread>
    where
        F: Future<Output = std::result::Result<(), E>> + 'static,
        E: fmt::Display + 'static,
    {
        let id = context::scheduler()?.next_thread_id();
        let name = self.name.unwrap_or_else(|| format!("strand-{}", id.as_u64()));
        let body: BoxFuture = Box::pin(async move {
            match body.await {
                Ok(()) => Outcome::Completed,
                Err(err) => {
                    let cancelled = (&err as &dyn Any)
                        .downcast_ref::<Error>()
                        .is_some_and(Error::is_cancelled);
                    Outcome::Failed {
                        message: err.to_string(),
                        cancelled,
                    }
                }
            }
        });

        Ok(Thread {
            inner: Rc::new(ThreadInner {
                id,
                name,
                started: Cell::new(false),
                finished: Cell::new(false),
                parked: Cell::new(false),
                queued: Cell::new(false),
                wakeup: RefCell::new(None),
                cancel_requested: Cell::new(false),
                stopped: Cell::new(false),
                body: RefCell::new(Some(body)),
                done: Event::new(),
            }),
        })
    }

    /// Create and start the thread.
    pub fn spawn<F, E>(self, body: F) -> Result<Thread>
    where
        F: Future<Output = std::result::Result<(), E>> + 'static,
        E: fmt::Display + 'static,
    {
        let thread = self.build(body)?;
        thread.start()?;
        Ok(thread)
    }
}

impl Thread {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Create an unnamed thread without starting it.
    pub fn new<F, E>(body: F) -> Result<Thread>
    where
        F: Future<Output = std::result::Result<(), E>> + 'static,
        E: fmt::Display + 'static,
    {
        Builder::new().build(body)
    }

    /// Create and start an unnamed thread.
    pub fn spawn<F, E>(body: F) -> Result<Thread>
    where
        F: Future<Output = std::result::Result<(), E>> + 'static,
        E: fmt::Display + 'static,
    {
        Builder::new().spawn(body)
    }

    pub(crate) fn inner(&self) -> &ThreadInner {
        &self.inner
    }

    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ThreadState {
        let inner = &self.inner;
        if inner.finished.get() {
            ThreadState::Finished
        } else if !inner.started.get() {
            ThreadState::Created
        } else if inner.parked.get() {
            ThreadState::Suspended
        } else {
            ThreadState::Running
        }
    }

    /// Started and not finished.
    pub fn is_alive(&self) -> bool {
        self.inner.started.get() && !self.inner.finished.get()
    }

    /// Register the thread and queue it to run. Single use.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.get() {
            return Err(Error::AlreadyStarted {
                name: self.inner.name.clone(),
            });
        }
        let sched = context::scheduler()?;
        self.inner.started.set(true);
        sched.register(self.clone());
        Ok(())
    }

    /// Cancel the thread.
    ///
    /// A suspended thread wakes with [`Error::Cancelled`]; otherwise the
    /// cancellation is delivered at its next suspension point. No effect on
    /// a finished thread.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.finished.get() {
            return;
        }
        inner.stopped.set(true);
        let idle = inner.parked.get() && inner.wakeup.borrow().is_none();
        let woken = idle
            && context::try_scheduler().is_some_and(|s| s.resume(inner.id, Some(Error::Cancelled)));
        if !woken {
            inner.cancel_requested.set(true);
        }
    }

    /// Wait for the thread to finish.
    ///
    /// Returns immediately if it already has. Errors raised by the body are
    /// logged, not reported here.
    pub async fn join(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.finished.get() {
            return Ok(());
        }
        let me = context::scheduler()?
            .current_id()
            .ok_or(Error::OutsideThread)?;
        if me == self.inner.id {
            return Err(Error::SelfJoin);
        }
        self.inner.done.wait(timeout).await
    }

    /// Suspend the current thread for `duration`. Zero yields once.
    pub async fn sleep(duration: Duration) -> Result<()> {
        crate::timeout::sleep(duration).await
    }

    /// The thread currently executing, if called from inside one.
    pub fn current() -> Option<Thread> {
        context::try_scheduler().and_then(|s| s.current_thread())
    }

    /// Live threads in id order.
    pub fn enumerate() -> Vec<Thread> {
        context::try_scheduler().map_or_else(Vec::new, |s| s.threads())
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
