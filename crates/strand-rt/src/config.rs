// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event loop tuning knobs.

use std::env;

/// Default number of epoll events drained per reactor poll.
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Configuration for the per-OS-thread event loop.
///
/// Must be installed with [`crate::configure`] before anything touches the
/// runtime on that OS thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuntimeConfig {
    /// Epoll events collected per poll.
    pub max_events: usize,
    /// Upper bound on green threads polled before the reactor is checked
    /// again. `None` polls every thread that was ready at the start of the
    /// iteration.
    pub max_batch: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            max_batch: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `STRAND_MAX_EVENTS` and `STRAND_MAX_BATCH`.
    ///
    /// Unparsable values are reported and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_usize("STRAND_MAX_EVENTS") {
            config.max_events = n;
        }
        if let Some(n) = env_usize("STRAND_MAX_BATCH") {
            config.max_batch = Some(n);
        }
        config.clamped()
    }

    /// The config the scheduler actually runs with: zero limits become 1, so
    /// every iteration polls at least one ready thread and drains at least
    /// one epoll event.
    pub(crate) fn clamped(self) -> Self {
        Self {
            max_events: self.max_events.max(1),
            max_batch: self.max_batch.map(|n| n.max(1)),
        }
    }
}

fn env_usize(var: &str) -> Option<usize> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(err) => {
            tracing::warn!("Ignoring {}={:?}: {}", var, raw, err);
            None
        }
    }
}
