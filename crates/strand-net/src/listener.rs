// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Listening socket that accepts on a green thread.

use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use strand_rt::{release_fd, wait_io, Deadline, Interest};
use tracing::debug;

use crate::connection::{Connection, TimeoutPolicy};
use crate::error::Result;
use crate::io::Attempt;

pub struct Listener {
    inner: TcpListener,
    /// Handed to every accepted connection.
    policy: TimeoutPolicy,
}

impl Listener {
    pub fn bind(addr: impl ToSocketAddrs, policy: TimeoutPolicy) -> Result<Self> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner, policy })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<Connection> {
        let deadline = Deadline::after(timeout);
        loop {
            match Attempt::from(self.inner.accept()) {
                Attempt::Ready((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    return Connection::with_peer(stream, peer, self.policy);
                }
                Attempt::Failed(err) => return Err(err),
                Attempt::WouldBlock => {}
            }
            wait_io(self.inner.as_raw_fd(), Interest::Readable, deadline.remaining()).await?;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        release_fd(self.inner.as_raw_fd());
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.local_addr().ok())
            .field("policy", &self.policy)
            .finish()
    }
}
