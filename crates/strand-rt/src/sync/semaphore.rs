// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphores.
//!
//! A release while threads wait hands the permit directly to one of them
//! instead of bumping the counter, so the counter never goes negative and a
//! woken acquirer cannot lose its permit to a newcomer.

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

use super::event::Event;
use crate::error::{Error, Result};

pub struct Semaphore {
    counter: Cell<usize>,
    event: Event,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Self {
            counter: Cell::new(value),
            event: Event::new(),
        }
    }

    /// Permits currently available.
    pub fn value(&self) -> usize {
        self.counter.get()
    }

    /// Take a permit, blocking while none is available.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let available = self.counter.get();
        if available > 0 {
            self.counter.set(available - 1);
            return Ok(());
        }
        // Woken only by a release that handed us its permit.
        self.event.wait(timeout).await
    }

    /// Return a permit.
    pub fn release(&self) {
        if self.counter.get() == 0 && self.event.set_once() {
            return;
        }
        self.counter.set(self.counter.get() + 1);
    }

    pub async fn lock(&self) -> Result<SemaphoreGuard<'_>> {
        self.acquire(None).await?;
        Ok(SemaphoreGuard {
            permit: Permit::Plain(self),
        })
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.counter.get())
            .field("waiters", &self.event.waiter_count())
            .finish()
    }
}

/// Semaphore that refuses to be released above its initial value.
pub struct BoundedSemaphore {
    inner: Semaphore,
    max: usize,
}

impl BoundedSemaphore {
    pub fn new(value: usize) -> Self {
        Self {
            inner: Semaphore::new(value),
            max: value,
        }
    }

    pub fn value(&self) -> usize {
        self.inner.value()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.acquire(timeout).await
    }

    /// Return a permit; fails if every permit is already back.
    pub fn release(&self) -> Result<()> {
        if self.inner.value() >= self.max {
            return Err(Error::OverRelease { max: self.max });
        }
        self.inner.release();
        Ok(())
    }

    pub async fn lock(&self) -> Result<SemaphoreGuard<'_>> {
        self.acquire(None).await?;
        Ok(SemaphoreGuard {
            permit: Permit::Bounded(self),
        })
    }
}

impl fmt::Debug for BoundedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedSemaphore")
            .field("value", &self.inner.value())
            .field("max", &self.max)
            .finish()
    }
}

enum Permit<'a> {
    Plain(&'a Semaphore),
    Bounded(&'a BoundedSemaphore),
}

/// Returns a permit when dropped.
#[must_use = "the permit is returned as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    permit: Permit<'a>,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        match self.permit {
            Permit::Plain(sem) => sem.release(),
            Permit::Bounded(sem) => {
                if let Err(err) = sem.release() {
                    tracing::warn!("Semaphore guard release failed: {}", err);
                }
            }
        }
    }
}
