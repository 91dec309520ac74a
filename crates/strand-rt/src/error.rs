// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the scheduler and the synchronization primitives.
///
/// `WaitTimeout` and `Cancelled` are delivered at suspension points; the
/// remaining variants are raised synchronously by the call that detected them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("wait timed out")]
    WaitTimeout,

    #[error("green thread was stopped")]
    Cancelled,

    #[error("green thread `{name}` was already started")]
    AlreadyStarted { name: String },

    #[error("the current green thread does not own this {primitive}")]
    NotOwner { primitive: &'static str },

    #[error("release of an unlocked lock")]
    NotLocked,

    #[error("semaphore released too many times (bound is {max})")]
    OverRelease { max: usize },

    #[error("green-thread operation called outside of a green thread")]
    OutsideThread,

    #[error("a green thread cannot join itself")]
    SelfJoin,

    #[error("descriptor {fd} already has a waiter for this direction")]
    DescriptorBusy { fd: RawFd },

    #[error("the event loop is running; stop it first")]
    LoopRunning,

    #[error("the runtime is already initialized; configure it before first use")]
    AlreadyInitialized,

    #[error("event loop ran out of work before the future completed")]
    Stalled,

    #[error("reactor I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that indicate a programming mistake rather than a
    /// runtime condition.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::AlreadyStarted { .. }
                | Error::NotOwner { .. }
                | Error::NotLocked
                | Error::OverRelease { .. }
                | Error::OutsideThread
                | Error::SelfJoin
                | Error::DescriptorBusy { .. }
                | Error::LoopRunning
                | Error::AlreadyInitialized
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::WaitTimeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_classification() {
        assert!(Error::NotLocked.is_usage());
        assert!(Error::OverRelease { max: 1 }.is_usage());
        assert!(!Error::WaitTimeout.is_usage());
        assert!(!Error::Cancelled.is_usage());
    }

    #[test]
    fn messages() {
        let err = Error::AlreadyStarted {
            name: "worker".to_string(),
        };
        assert_eq!(err.to_string(), "green thread `worker` was already started");
        assert_eq!(
            Error::OverRelease { max: 3 }.to_string(),
            "semaphore released too many times (bound is 3)"
        );
    }
}
