// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Connection error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = NetError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("connection is closed")]
    NotConnected,

    #[error("connection write side is already shut down")]
    AlreadyShutdown,

    #[error("connection reset: {reason}")]
    ConnectionReset { reason: String },

    #[error("another green thread is already {op} this connection")]
    ConnectionInUse { op: &'static str },

    #[error("read_until requires a non-empty pattern")]
    EmptyPattern,

    #[error("failed to read config at {path:?}: {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("invalid connection config: {source}")]
    Config {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Runtime(#[from] strand_rt::Error),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    pub(crate) fn reset(reason: impl Into<String>) -> Self {
        NetError::ConnectionReset {
            reason: reason.into(),
        }
    }

    /// The operation ran past its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Runtime(err) if err.is_timeout())
    }

    /// The calling green thread was stopped while waiting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NetError::Runtime(err) if err.is_cancelled())
    }

    /// The caller misused the connection or the runtime.
    pub fn is_usage(&self) -> bool {
        match self {
            NetError::ConnectionInUse { .. } | NetError::EmptyPattern => true,
            NetError::Runtime(err) => err.is_usage(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(NetError::from(strand_rt::Error::WaitTimeout).is_timeout());
        assert!(NetError::from(strand_rt::Error::Cancelled).is_cancelled());
        assert!(NetError::ConnectionInUse { op: "reading" }.is_usage());
        assert!(NetError::EmptyPattern.is_usage());
        assert!(!NetError::NotConnected.is_usage());
        assert!(!NetError::reset("peer went away").is_timeout());
    }

    #[test]
    fn messages() {
        assert_eq!(
            NetError::ConnectionInUse { op: "writing" }.to_string(),
            "another green thread is already writing this connection"
        );
        assert_eq!(
            NetError::reset("eof").to_string(),
            "connection reset: eof"
        );
    }
}
