// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-reentrant mutual exclusion.
//!
//! The lock is an [`Event`] meaning "unlocked". Releasing while threads wait
//! hands the lock straight to the longest waiter, so a woken acquirer can
//! never be overtaken.

use std::fmt;
use std::time::Duration;

use super::event::Event;
use crate::error::{Error, Result};

pub struct Lock {
    unlocked: Event,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    pub fn new() -> Self {
        Self {
            unlocked: Event::new_set(),
        }
    }

    /// Whether some thread holds the lock.
    pub fn locked(&self) -> bool {
        !self.unlocked.is_set()
    }

    /// Take the lock, blocking the current green thread up to `timeout`.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        if self.unlocked.is_set() {
            self.unlocked.clear();
            return Ok(());
        }
        // Waking here means the releaser handed the lock over.
        self.unlocked.wait(timeout).await
    }

    /// Release the lock, handing it to one waiter if there is any.
    pub fn release(&self) -> Result<()> {
        if self.unlocked.is_set() {
            return Err(Error::NotLocked);
        }
        if !self.unlocked.set_once() {
            self.unlocked.set();
        }
        Ok(())
    }

    /// Acquire and return a guard that releases on drop.
    pub async fn lock(&self) -> Result<LockGuard<'_>> {
        self.acquire(None).await?;
        Ok(LockGuard { lock: self })
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("locked", &self.locked()).finish()
    }
}

/// Releases the [`Lock`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            tracing::warn!("Lock guard release failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block_on, Thread};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn acquire_release() {
        block_on(async {
            let lock = Lock::new();
            assert!(!lock.locked());
            lock.acquire(None).await?;
            assert!(lock.locked());
            assert!(matches!(
                lock.acquire(Some(Duration::ZERO)).await,
                Err(Error::WaitTimeout)
            ));
            lock.release()?;
            assert!(!lock.locked());
            assert!(matches!(lock.release(), Err(Error::NotLocked)));
            Ok::<_, Error>(())
        })
        .unwrap();
    }

    #[test]
    fn release_hands_off_to_waiter() {
        block_on(async {
            let lock = Rc::new(Lock::new());
            let got = Rc::new(Cell::new(false));
            lock.acquire(None).await?;

            let (l, g) = (lock.clone(), got.clone());
            let waiter = Thread::spawn(async move {
                let _guard = l.lock().await?;
                g.set(true);
                Ok::<_, Error>(())
            })?;
            Thread::sleep(Duration::ZERO).await?;
            assert!(!got.get());

            lock.release()?;
            // Handed off: still locked until the waiter's guard drops.
            assert!(lock.locked());
            waiter.join(None).await?;
            assert!(got.get());
            assert!(!lock.locked());
            Ok::<_, Error>(())
        })
        .unwrap();
    }

    #[test]
    fn timed_out_acquire_leaves_lock_usable() {
        block_on(async {
            let lock = Rc::new(Lock::new());
            lock.acquire(None).await?;
            let timed_out = Rc::new(Cell::new(false));
            let (l, t) = (lock.clone(), timed_out.clone());
            let waiter = Thread::spawn(async move {
                let result = l.acquire(Some(Duration::from_millis(5))).await;
                t.set(matches!(result, Err(Error::WaitTimeout)));
                Ok::<_, Error>(())
            })?;
            waiter.join(None).await?;
            assert!(timed_out.get());
            lock.release()?;
            assert!(!lock.locked());
            lock.acquire(Some(Duration::ZERO)).await?;
            lock.release()
        })
        .unwrap();
    }
}
