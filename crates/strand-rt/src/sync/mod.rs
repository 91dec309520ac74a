// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Synchronization primitives that block only the calling green thread.
//!
//! Everything is built on [`Event`]. Timeouts are `Option<Duration>`:
//! `None` waits forever, `Some(Duration::ZERO)` never suspends.

mod condition;
mod event;
mod lock;
mod rlock;
mod semaphore;

pub use condition::Condition;
pub use event::Event;
pub use lock::{Lock, LockGuard};
pub use rlock::{ReentrantLock, ReentrantLockGuard};
pub use semaphore::{BoundedSemaphore, Semaphore, SemaphoreGuard};
