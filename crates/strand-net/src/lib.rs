// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! TCP connections for strand green threads.
//!
//! Sockets are non-blocking; an operation that would block parks only the
//! calling green thread on the runtime's reactor. Deadlines come from the
//! per-call [`Timeout`] or the connection's [`TimeoutPolicy`].

#[cfg(not(target_os = "linux"))]
compile_error!("strand-net requires Linux (epoll and TCP keep-alive options)");

pub mod config;
pub mod connection;
pub mod error;
mod io;
pub mod keepalive;
pub mod listener;

pub use config::{KeepAliveConfig, NetConfig};
pub use connection::{Connection, Status, Timeout, TimeoutPolicy};
pub use error::{NetError, Result};
pub use keepalive::KeepAlive;
pub use listener::Listener;
