// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Connection defaults loaded from TOML.
//!
//! ```toml
//! timeout = 30.0
//!
//! [keep_alive]
//! interval = 60.0
//! retry = 10.0
//! count = 5
//! timeout = 120.0
//! ```
//!
//! Durations are seconds as floats. `[keep_alive]` takes precedence over the
//! top-level `timeout` when choosing the policy, and carries its own.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::TimeoutPolicy;
use crate::error::{NetError, Result};
use crate::keepalive::KeepAlive;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    /// Default per-operation deadline in seconds.
    pub timeout: Option<f64>,
    pub keep_alive: Option<KeepAliveConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepAliveConfig {
    /// Idle time before the first probe.
    pub interval: f64,
    /// Time between unanswered probes.
    pub retry: f64,
    /// Unanswered probes before the peer is considered dead.
    pub count: u32,
    #[serde(default)]
    pub timeout: Option<f64>,
}

fn secs(field: &str, value: f64) -> Option<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => Some(duration),
        Err(err) => {
            tracing::warn!("Ignoring {} = {}: {}", field, value, err);
            None
        }
    }
}

impl NetConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|source| NetError::Config { path: None, source })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, source);
                return Err(NetError::ConfigRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            NetError::Config {
                path: Some(path.to_path_buf()),
                source,
            }
        })
    }

    /// Policy for new connections. Out-of-range durations are dropped with a
    /// warning; a keep-alive table whose probe timings are unusable falls back
    /// to the plain timeout.
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        if let Some(ka) = &self.keep_alive {
            let interval = secs("keep_alive.interval", ka.interval);
            let retry = secs("keep_alive.retry", ka.retry);
            if let (Some(interval), Some(retry)) = (interval, retry) {
                let mut keep_alive = KeepAlive::new(interval, retry, ka.count);
                if let Some(timeout) = ka.timeout.and_then(|t| secs("keep_alive.timeout", t)) {
                    keep_alive = keep_alive.with_timeout(timeout);
                }
                return TimeoutPolicy::KeepAlive(keep_alive);
            }
        }
        match self.timeout.and_then(|t| secs("timeout", t)) {
            Some(timeout) => TimeoutPolicy::After(timeout),
            None => TimeoutPolicy::None,
        }
    }
}
