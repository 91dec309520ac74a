// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green thread identity, lifecycle states, and the executor's waker.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Wake, Waker};

use crate::context;

/// Identity of a green thread. Unique for the lifetime of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Green thread lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Built but not started.
    Created,
    /// Executing, or queued to execute.
    Running,
    /// Parked at a suspension point, waiting for `resume`.
    Suspended,
    /// Body returned, failed, or panicked.
    Finished,
}

/// How a thread body ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    Failed { message: String, cancelled: bool },
}

/// Type-erased thread body. The user error is rendered before it reaches
/// the scheduler.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Outcome>>>;

/// Waker that re-queues a green thread on the scheduler of the OS thread
/// it is woken from.
///
/// Runtime primitives resume threads through `resume`; this waker only
/// matters for foreign futures awaited inside a green thread.
struct TaskWaker {
    thread: ThreadId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(sched) = context::try_scheduler() {
            sched.schedule(self.thread);
        }
    }
}

pub(crate) fn task_waker(thread: ThreadId) -> Waker {
    Waker::from(Arc::new(TaskWaker { thread }))
}
