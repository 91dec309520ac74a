// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event: a flag green threads can wait on.
//!
//! The building block for every other primitive. [`Event::set`] wakes all
//! waiters and leaves the flag raised; [`Event::set_once`] hands a wake-up
//! to a single waiter without touching the flag.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::context;
use crate::error::{Error, Result};
use crate::green::scheduler::pause;
use crate::green::task::ThreadId;
use crate::green::timer::TimerId;

/// Waiting threads in arrival order, each with its timeout timer.
type Waiters = Rc<RefCell<IndexMap<ThreadId, Option<TimerId>>>>;

pub struct Event {
    flag: Cell<bool>,
    waiters: Waiters,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            flag: Cell::new(false),
            waiters: Rc::new(RefCell::new(IndexMap::new())),
        }
    }

    /// Create an event whose flag is already raised.
    pub fn new_set() -> Self {
        let event = Self::new();
        event.flag.set(true);
        event
    }

    pub fn is_set(&self) -> bool {
        self.flag.get()
    }

    pub fn clear(&self) {
        self.flag.set(false);
    }

    /// Number of threads blocked in [`Event::wait`].
    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        self.flag.set(true);
        let waiters: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        let Some(sched) = context::try_scheduler() else {
            return;
        };
        for (thread, timer) in waiters {
            if let Some(timer) = timer {
                sched.cancel_timer(timer);
            }
            sched.resume(thread, None);
        }
    }

    /// Wake the longest-waiting thread that can still be resumed, leaving the
    /// flag alone. Returns whether a thread was woken.
    pub fn set_once(&self) -> bool {
        let Some(sched) = context::try_scheduler() else {
            return false;
        };
        loop {
            let next = self.waiters.borrow_mut().shift_remove_index(0);
            let Some((thread, timer)) = next else {
                return false;
            };
            if let Some(timer) = timer {
                sched.cancel_timer(timer);
            }
            if sched.resume(thread, None) {
                return true;
            }
        }
    }

    /// Block until the flag is raised or this thread is handed a wake-up.
    ///
    /// Returns immediately if the flag is already set. With a timeout, fails
    /// with [`Error::WaitTimeout`] once it elapses; a zero timeout fails
    /// without suspending.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.flag.get() {
            return Ok(());
        }
        let sched = context::scheduler()?;
        let me = sched.current_id().ok_or(Error::OutsideThread)?;
        if timeout == Some(Duration::ZERO) {
            return Err(Error::WaitTimeout);
        }

        let timer = timeout.map(|delay| {
            let waiters = Rc::downgrade(&self.waiters);
            sched.call_later(
                delay,
                Box::new(move || {
                    let Some(waiters) = waiters.upgrade() else {
                        return;
                    };
                    let removed = waiters.borrow_mut().shift_remove(&me).is_some();
                    if removed {
                        if let Some(sched) = context::try_scheduler() {
                            sched.resume(me, Some(Error::WaitTimeout));
                        }
                    }
                }),
            )
        });
        drop(sched);

        self.waiters.borrow_mut().insert(me, timer);
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            thread: me,
        };
        pause().await
    }
}

/// Removes a waiter that left `wait` without being woken by the event.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    thread: ThreadId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let Ok(mut waiters) = self.waiters.try_borrow_mut() else {
            return;
        };
        let timer = waiters.shift_remove(&self.thread).flatten();
        drop(waiters);
        if let (Some(timer), Some(sched)) = (timer, context::try_scheduler()) {
            sched.cancel_timer(timer);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.flag.get())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block_on, Thread};

    #[test]
    fn set_wakes_all_and_stays_set() {
        block_on(async {
            let event = Rc::new(Event::new());
            let woke = Rc::new(Cell::new(0));
            let mut threads = Vec::new();
            for _ in 0..3 {
                let (event, woke) = (event.clone(), woke.clone());
                threads.push(Thread::spawn(async move {
                    event.wait(None).await?;
                    woke.set(woke.get() + 1);
                    Ok::<_, Error>(())
                })?);
            }
            Thread::sleep(Duration::ZERO).await?;
            assert_eq!(event.waiter_count(), 3);

            event.set();
            assert_eq!(event.waiter_count(), 0);
            for t in &threads {
                t.join(None).await?;
            }
            assert_eq!(woke.get(), 3);

            // Still set: no suspension.
            event.wait(Some(Duration::ZERO)).await?;
            event.clear();
            assert!(!event.is_set());
            Ok::<_, Error>(())
        })
        .unwrap();
    }

    #[test]
    fn set_once_wakes_one_in_arrival_order() {
        block_on(async {
            let event = Rc::new(Event::new());
            let order = Rc::new(RefCell::new(Vec::new()));
            let mut threads = Vec::new();
            for n in 0..2 {
                let (event, order) = (event.clone(), order.clone());
                threads.push(Thread::spawn(async move {
                    event.wait(None).await?;
                    order.borrow_mut().push(n);
                    Ok::<_, Error>(())
                })?);
            }
            Thread::sleep(Duration::ZERO).await?;

            assert!(event.set_once());
            Thread::sleep(Duration::ZERO).await?;
            assert_eq!(*order.borrow(), vec![0]);
            assert!(!event.is_set());

            assert!(event.set_once());
            assert!(!event.set_once());
            for t in &threads {
                t.join(None).await?;
            }
            assert_eq!(*order.borrow(), vec![0, 1]);
            Ok::<_, Error>(())
        })
        .unwrap();
    }

    #[test]
    fn timeout_removes_waiter() {
        block_on(async {
            let event = Event::new();
            let result = event.wait(Some(Duration::from_millis(5))).await;
            assert!(matches!(result, Err(Error::WaitTimeout)));
            assert_eq!(event.waiter_count(), 0);

            assert!(matches!(
                event.wait(Some(Duration::ZERO)).await,
                Err(Error::WaitTimeout)
            ));
            Ok::<_, Error>(())
        })
        .unwrap();
    }

    #[test]
    fn set_once_skips_cancelled_waiter() {
        block_on(async {
            let event = Rc::new(Event::new());
            let got = Rc::new(Cell::new(false));

            let e = event.clone();
            let first = Thread::spawn(async move { e.wait(None).await })?;
            let (e, g) = (event.clone(), got.clone());
            let second = Thread::spawn(async move {
                e.wait(None).await?;
                g.set(true);
                Ok::<_, Error>(())
            })?;
            Thread::sleep(Duration::ZERO).await?;

            // The first waiter already has a cancellation pending.
            first.stop();
            assert!(event.set_once());
            first.join(None).await?;
            second.join(Some(Duration::from_secs(1))).await?;
            assert!(got.get());
            Ok::<_, Error>(())
        })
        .unwrap();
    }
}
