// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green threads on a single-threaded event loop.
//!
//! Components:
//! - `task`      — thread ids, lifecycle states, waker
//! - `timer`     — deadline-ordered timer queue
//! - `reactor`   — epoll readiness for descriptors
//! - `scheduler` — ready queue, event loop, pause/resume, I/O waits
//! - `thread`    — `Thread` handles and the live-thread registry

pub mod reactor;
pub mod scheduler;
pub mod task;
pub mod thread;
pub mod timer;
