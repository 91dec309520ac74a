// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reentrant lock: a [`Lock`] plus owner and recursion depth.

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

use super::lock::Lock;
use crate::context;
use crate::error::{Error, Result};
use crate::green::task::ThreadId;
use crate::timeout::Deadline;

pub struct ReentrantLock {
    lock: Lock,
    owner: Cell<Option<ThreadId>>,
    depth: Cell<usize>,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

fn current_thread() -> Result<ThreadId> {
    context::scheduler()?
        .current_id()
        .ok_or(Error::OutsideThread)
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self {
            lock: Lock::new(),
            owner: Cell::new(None),
            depth: Cell::new(0),
        }
    }

    /// Whether the current green thread owns the lock.
    pub fn is_owned(&self) -> bool {
        let me = context::try_scheduler().and_then(|s| s.current_id());
        me.is_some() && self.owner.get() == me
    }

    /// Recursion depth held by the owner; 0 when free.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner.get()
    }

    /// Acquire, or re-enter if the current thread already owns the lock.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let me = current_thread()?;
        if self.owner.get() == Some(me) {
            self.depth.set(self.depth.get() + 1);
            return Ok(());
        }
        let deadline = Deadline::after(timeout);
        self.lock.acquire(deadline.remaining()).await?;
        self.owner.set(Some(me));
        self.depth.set(1);
        Ok(())
    }

    /// Drop one level; the underlying lock is released at depth 0.
    pub fn release(&self) -> Result<()> {
        let me = current_thread()?;
        if self.owner.get() != Some(me) {
            return Err(Error::NotOwner {
                primitive: "reentrant lock",
            });
        }
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 {
            self.owner.set(None);
            self.lock.release()?;
        }
        Ok(())
    }

    /// Release every level at once, returning how many were held.
    pub(crate) fn release_all(&self) -> Result<usize> {
        let me = current_thread()?;
        if self.owner.get() != Some(me) {
            return Err(Error::NotOwner {
                primitive: "reentrant lock",
            });
        }
        let levels = self.depth.replace(0);
        self.owner.set(None);
        self.lock.release()?;
        Ok(levels)
    }

    /// Re-acquire `levels` levels with no timeout.
    pub(crate) async fn acquire_restore(&self, levels: usize) -> Result<()> {
        let me = current_thread()?;
        self.lock.acquire(None).await?;
        self.owner.set(Some(me));
        self.depth.set(levels);
        Ok(())
    }

    /// Acquire and return a guard that releases one level on drop.
    pub async fn lock(&self) -> Result<ReentrantLockGuard<'_>> {
        self.acquire(None).await?;
        Ok(ReentrantLockGuard { lock: self })
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("owner", &self.owner.get())
            .field("depth", &self.depth.get())
            .finish()
    }
}

/// Releases one level of a [`ReentrantLock`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantLockGuard<'a> {
    lock: &'a ReentrantLock,
}

impl Drop for ReentrantLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            tracing::warn!("Reentrant lock guard release failed: {}", err);
        }
    }
}
