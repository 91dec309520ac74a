// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: cooperative green threads over a single-threaded event
//! loop.
//!
//! Each OS thread gets at most one loop, created on first use. Green threads
//! are `async` bodies that suspend only at explicit points (waits, sleeps,
//! joins, I/O readiness); exactly one runs at a time, so the scheduler's
//! tables need no locking.
//!
//! Components:
//! - green — scheduler, reactor, timers, thread handles
//! - sync — event, locks, condition, semaphores
//! - timeout — sleep and deadline helpers
//! - context — loop control (start/stop/block_on/shutdown)
//! - config — loop tuning

#[cfg(not(target_os = "linux"))]
compile_error!("strand-rt requires Linux (epoll and eventfd)");

pub mod config;
pub mod context;
pub mod error;
pub mod green;
pub mod sync;
pub mod timeout;

pub use config::RuntimeConfig;
pub use context::{
    block_on, configure, is_initialized, is_running, shutdown, start, stop, stop_handle,
    StopHandle,
};
pub use error::{Error, Result};
pub use green::reactor::Interest;
pub use green::scheduler::{pause, release_fd, release_interest, resume, wait_io, Pause};
pub use green::task::{ThreadId, ThreadState};
pub use green::thread::{Builder, Thread};
pub use sync::{
    BoundedSemaphore, Condition, Event, Lock, LockGuard, ReentrantLock, ReentrantLockGuard,
    Semaphore, SemaphoreGuard,
};
pub use timeout::{sleep, Deadline};
