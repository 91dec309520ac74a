// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Condition variable bound to a [`ReentrantLock`].

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use super::event::Event;
use super::rlock::{ReentrantLock, ReentrantLockGuard};
use crate::error::{Error, Result};

pub struct Condition {
    lock: Rc<ReentrantLock>,
    event: Event,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    /// Condition with a lock of its own.
    pub fn new() -> Self {
        Self::with_lock(Rc::new(ReentrantLock::new()))
    }

    /// Condition sharing an existing lock.
    pub fn with_lock(lock: Rc<ReentrantLock>) -> Self {
        Self {
            lock,
            event: Event::new(),
        }
    }

    pub fn reentrant_lock(&self) -> &Rc<ReentrantLock> {
        &self.lock
    }

    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        self.lock.acquire(timeout).await
    }

    pub fn release(&self) -> Result<()> {
        self.lock.release()
    }

    pub async fn lock(&self) -> Result<ReentrantLockGuard<'_>> {
        self.lock.lock().await
    }

    fn check_owned(&self) -> Result<()> {
        if self.lock.is_owned() {
            Ok(())
        } else {
            Err(Error::NotOwner {
                primitive: "condition",
            })
        }
    }

    /// Release the lock, wait for a notification, then take the lock back.
    ///
    /// The lock is restored to the depth it had on entry before this
    /// returns, whatever the outcome. Re-acquiring is not bounded by
    /// `timeout`. A cancellation that arrives while re-acquiring is reported
    /// once the lock is held again.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.check_owned()?;
        let levels = self.lock.release_all()?;
        let waited = self.event.wait(timeout).await;

        let mut cancelled = false;
        loop {
            match self.lock.acquire_restore(levels).await {
                Ok(()) => break,
                Err(Error::Cancelled) => cancelled = true,
                Err(err) => return Err(err),
            }
        }

        waited?;
        if cancelled {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Wake up to `n` waiters.
    pub fn notify(&self, n: usize) -> Result<()> {
        self.check_owned()?;
        for _ in 0..n {
            if !self.event.set_once() {
                break;
            }
        }
        Ok(())
    }

    /// Wake every current waiter.
    pub fn notify_all(&self) -> Result<()> {
        self.check_owned()?;
        self.event.set();
        self.event.clear();
        Ok(())
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("lock", &self.lock)
            .field("waiters", &self.event.waiter_count())
            .finish()
    }
}
