// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep and deadlines.
//!
//! Compound operations compute one [`Deadline`] up front and hand each retry
//! the remaining budget, so the total wait never exceeds the caller's timeout.

use std::time::{Duration, Instant};

use crate::context;
use crate::error::{Error, Result};
use crate::green::scheduler::pause;
use crate::green::timer::TimerId;

/// Point in time after which a compound operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// `None` never expires.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Budget left for the next wait; `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

struct TimerGuard(TimerId);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(sched) = context::try_scheduler() {
            sched.cancel_timer(self.0);
        }
    }
}

/// Suspend the current green thread for `duration`.
///
/// `sleep(Duration::ZERO)` yields exactly once; threads that yield in the
/// same loop iteration resume in the order they went to sleep.
pub async fn sleep(duration: Duration) -> Result<()> {
    let sched = context::scheduler()?;
    let me = sched.current_id().ok_or(Error::OutsideThread)?;
    let timer = sched.call_later(
        duration,
        Box::new(move || {
            if let Some(sched) = context::try_scheduler() {
                sched.resume(me, None);
            }
        }),
    );
    drop(sched);
    let _guard = TimerGuard(timer);
    pause().await
}
