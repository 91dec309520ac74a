// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Byte-stream connections whose I/O suspends only the calling green thread.
//!
//! Each operation first tries the socket directly. On would-block it parks
//! the thread on descriptor readiness and retries, all under one deadline.
//! At most one read and one write may be in flight per connection.
//!
//! Lifecycle: `Open --shutdown--> HalfClosed --close--> Closed`, or straight
//! from `Open` to `Closed`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use strand_rt::{release_fd, release_interest, wait_io, Deadline, Interest};
use tracing::debug;

use crate::error::{NetError, Result};
use crate::io::{find, map_io_error, start_connect, Attempt};
use crate::keepalive::KeepAlive;

/// Bytes requested per socket read when no count bounds the read.
const CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    /// Write side shut down; reads still work.
    HalfClosed,
    Closed,
}

/// Default deadline policy fixed when a connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    #[default]
    None,
    After(Duration),
    KeepAlive(KeepAlive),
}

impl TimeoutPolicy {
    /// Default per-operation deadline.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            TimeoutPolicy::None => None,
            TimeoutPolicy::After(d) => Some(*d),
            TimeoutPolicy::KeepAlive(ka) => ka.timeout,
        }
    }

    pub fn keep_alive(&self) -> Option<&KeepAlive> {
        match self {
            TimeoutPolicy::KeepAlive(ka) => Some(ka),
            _ => None,
        }
    }
}

impl From<Duration> for TimeoutPolicy {
    fn from(d: Duration) -> Self {
        TimeoutPolicy::After(d)
    }
}

impl From<KeepAlive> for TimeoutPolicy {
    fn from(ka: KeepAlive) -> Self {
        TimeoutPolicy::KeepAlive(ka)
    }
}

/// Per-call timeout override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Use the connection's default.
    #[default]
    Inherit,
    /// Wait as long as the connection lives.
    Never,
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Timeout::Never, Timeout::After)
    }
}

/// Clears an in-flight flag when the operation ends, however it ends.
struct InFlight<'a>(&'a Cell<bool>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct Connection {
    stream: RefCell<Option<TcpStream>>,
    fd: RawFd,
    peer: SocketAddr,
    status: Cell<Status>,
    timeout: Cell<Option<Duration>>,
    keep_alive: Option<KeepAlive>,
    reading: Cell<bool>,
    writing: Cell<bool>,
    /// Bytes received by `read_until` beyond the returned match.
    buffer: RefCell<Vec<u8>>,
}

impl Connection {
    /// Adopt a connected socket, e.g. one handed over by an external server.
    pub fn from_std(stream: TcpStream, policy: TimeoutPolicy) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Self::with_peer(stream, peer, policy)
    }

    pub(crate) fn with_peer(stream: TcpStream, peer: SocketAddr, policy: TimeoutPolicy) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        if let Some(ka) = policy.keep_alive() {
            ka.apply(fd);
        }
        Ok(Self {
            stream: RefCell::new(Some(stream)),
            fd,
            peer,
            status: Cell::new(Status::Open),
            timeout: Cell::new(policy.timeout()),
            keep_alive: policy.keep_alive().copied(),
            reading: Cell::new(false),
            writing: Cell::new(false),
            buffer: RefCell::new(Vec::new()),
        })
    }

    /// Connect to `addr`, suspending until the handshake completes.
    ///
    /// The policy's timeout bounds the handshake as well.
    pub async fn connect(addr: SocketAddr, policy: TimeoutPolicy) -> Result<Self> {
        let (stream, pending) = start_connect(&addr).map_err(map_io_error)?;
        if pending {
            wait_io(stream.as_raw_fd(), Interest::Writable, policy.timeout()).await?;
            if let Some(err) = stream.take_error()? {
                return Err(map_io_error(err));
            }
        }
        debug!("Socket {} connected to {}", stream.as_raw_fd(), addr);
        Self::with_peer(stream, addr, policy)
    }

    /// Resolve `host` and connect to the first address that accepts.
    pub async fn connect_host(host: &str, port: u16, policy: TimeoutPolicy) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let mut last_err = None;
        for addr in addrs {
            match Self::connect(addr, policy).await {
                Ok(conn) => return Ok(conn),
                Err(err) if err.is_usage() || err.is_cancelled() => return Err(err),
                Err(err) => {
                    debug!("Connect to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            NetError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {}", host),
            ))
        }))
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.stream.borrow().as_ref() {
            Some(stream) => Ok(stream.local_addr()?),
            None => Err(NetError::NotConnected),
        }
    }

    /// Default deadline for operations that pass [`Timeout::Inherit`].
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout.set(timeout);
    }

    pub fn keep_alive(&self) -> Option<&KeepAlive> {
        self.keep_alive.as_ref()
    }

    /// Bytes left over from `read_until` that reads will return first.
    pub fn buffered_len(&self) -> usize {
        self.buffer.borrow().len()
    }

    fn deadline(&self, timeout: Timeout) -> Deadline {
        Deadline::after(match timeout {
            Timeout::Inherit => self.timeout.get(),
            Timeout::Never => None,
            Timeout::After(d) => Some(d),
        })
    }

    fn check_readable(&self) -> Result<()> {
        match self.status.get() {
            Status::Closed => Err(NetError::NotConnected),
            _ => Ok(()),
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.status.get() {
            Status::Open => Ok(()),
            Status::HalfClosed => Err(NetError::AlreadyShutdown),
            Status::Closed => Err(NetError::NotConnected),
        }
    }

    fn begin_read(&self) -> Result<InFlight<'_>> {
        self.check_readable()?;
        if self.reading.replace(true) {
            return Err(NetError::ConnectionInUse { op: "reading" });
        }
        Ok(InFlight(&self.reading))
    }

    fn begin_write(&self) -> Result<InFlight<'_>> {
        self.check_writable()?;
        if self.writing.replace(true) {
            return Err(NetError::ConnectionInUse { op: "writing" });
        }
        Ok(InFlight(&self.writing))
    }

    fn try_recv(&self, buf: &mut [u8]) -> Attempt<usize> {
        let slot = self.stream.borrow();
        let Some(mut stream) = slot.as_ref() else {
            return Attempt::Failed(NetError::NotConnected);
        };
        stream.read(buf).into()
    }

    fn try_send(&self, data: &[u8]) -> Attempt<usize> {
        let slot = self.stream.borrow();
        let Some(mut stream) = slot.as_ref() else {
            return Attempt::Failed(NetError::NotConnected);
        };
        match Attempt::from(stream.write(data)) {
            Attempt::Ready(0) => Attempt::Failed(NetError::reset("peer stopped accepting data")),
            other => other,
        }
    }

    /// Hand out buffered bytes left by `read_until`, if any.
    fn take_buffered(&self, buf: &mut [u8]) -> Option<usize> {
        let mut buffer = self.buffer.borrow_mut();
        if buffer.is_empty() {
            return None;
        }
        let n = buf.len().min(buffer.len());
        buf[..n].copy_from_slice(&buffer[..n]);
        buffer.drain(..n);
        Some(n)
    }

    /// One socket read, waiting for readability as needed.
    async fn recv_socket(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        loop {
            self.check_readable()?;
            match self.try_recv(buf) {
                Attempt::Ready(n) => return Ok(n),
                Attempt::Failed(err) => return Err(err),
                Attempt::WouldBlock => {}
            }
            wait_io(self.fd, Interest::Readable, deadline.remaining()).await?;
        }
    }

    async fn recv(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        if let Some(n) = self.take_buffered(buf) {
            return Ok(n);
        }
        self.recv_socket(buf, deadline).await
    }

    async fn send(&self, data: &[u8], deadline: Deadline) -> Result<usize> {
        loop {
            self.check_writable()?;
            match self.try_send(data) {
                Attempt::Ready(n) => return Ok(n),
                Attempt::Failed(err) => return Err(err),
                Attempt::WouldBlock => {}
            }
            wait_io(self.fd, Interest::Writable, deadline.remaining()).await?;
        }
    }

    /// Read at most `count` bytes. An empty result means the peer closed its
    /// side and nothing more will arrive.
    pub async fn read(&self, count: usize, timeout: Timeout) -> Result<Vec<u8>> {
        let _flight = self.begin_read()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; count];
        let n = self.recv(&mut buf, self.deadline(timeout)).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write some of `data`, returning how many bytes were sent.
    pub async fn write(&self, data: &[u8], timeout: Timeout) -> Result<usize> {
        let _flight = self.begin_write()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.send(data, self.deadline(timeout)).await
    }

    /// Read exactly `count` bytes, or until the peer closes when `count` is
    /// `None`. End-of-stream before `count` bytes is a `ConnectionReset`.
    pub async fn read_all(&self, count: Option<usize>, timeout: Timeout) -> Result<Vec<u8>> {
        let _flight = self.begin_read()?;
        let deadline = self.deadline(timeout);
        let mut out = Vec::with_capacity(count.unwrap_or(CHUNK));
        let mut chunk = vec![0u8; CHUNK];

        loop {
            let want = match count {
                Some(total) if out.len() >= total => break,
                Some(total) => (total - out.len()).min(CHUNK),
                None => CHUNK,
            };
            let n = self.recv(&mut chunk[..want], deadline).await?;
            if n == 0 {
                if let Some(total) = count {
                    return Err(NetError::reset(format!(
                        "connection closed prematurely ({} bytes left to read)",
                        total - out.len()
                    )));
                }
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Write all of `data`.
    pub async fn write_all(&self, data: &[u8], timeout: Timeout) -> Result<usize> {
        let _flight = self.begin_write()?;
        let deadline = self.deadline(timeout);
        let mut offset = 0;
        while offset < data.len() {
            offset += self.send(&data[offset..], deadline).await?;
        }
        Ok(data.len())
    }

    /// Read up to and including the first occurrence of `pattern`.
    ///
    /// Bytes received past the match stay buffered for later reads. On
    /// timeout everything received so far stays buffered too, so a retry
    /// continues where this call stopped.
    pub async fn read_until(&self, pattern: &[u8], timeout: Timeout) -> Result<Vec<u8>> {
        if pattern.is_empty() {
            return Err(NetError::EmptyPattern);
        }
        let _flight = self.begin_read()?;
        let deadline = self.deadline(timeout);
        let mut chunk = vec![0u8; CHUNK];

        loop {
            {
                // Always the whole buffer, so a match straddling leftover
                // bytes and a fresh chunk is found.
                let mut buffer = self.buffer.borrow_mut();
                if let Some(idx) = find(&buffer, pattern) {
                    let end = idx + pattern.len();
                    return Ok(buffer.drain(..end).collect());
                }
            }

            let n = self.recv_socket(&mut chunk, deadline).await?;
            if n == 0 {
                return Err(NetError::reset(
                    "connection closed prematurely (pattern not found)",
                ));
            }
            self.buffer.borrow_mut().extend_from_slice(&chunk[..n]);
        }
    }

    /// Shut down the write side. Reads keep working.
    ///
    /// A thread blocked writing wakes up and fails with `AlreadyShutdown`.
    pub fn shutdown(&self) -> Result<()> {
        if self.status.get() != Status::Open {
            return Err(NetError::AlreadyShutdown);
        }
        if let Some(stream) = self.stream.borrow().as_ref() {
            stream.shutdown(Shutdown::Write).map_err(map_io_error)?;
        }
        self.status.set(Status::HalfClosed);
        release_interest(self.fd, Interest::Writable);
        Ok(())
    }

    /// Close the socket. Threads blocked on it wake up and fail with
    /// `NotConnected`; so does a second `close`.
    pub fn close(&self) -> Result<()> {
        if self.status.get() == Status::Closed {
            return Err(NetError::NotConnected);
        }
        self.status.set(Status::Closed);
        release_fd(self.fd);
        self.buffer.borrow_mut().clear();
        let stream = self.stream.borrow_mut().take();
        drop(stream);
        debug!("Socket {} to {} closed", self.fd, self.peer);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.status.get() != Status::Closed {
            self.status.set(Status::Closed);
            release_fd(self.fd);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("status", &self.status.get())
            .field("timeout", &self.timeout.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use strand_rt::block_on;

    fn pair(policy: TimeoutPolicy) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::from_std(client, policy).unwrap(), server)
    }

    #[test]
    fn policy_defaults() {
        assert_eq!(TimeoutPolicy::default().timeout(), None);
        let ka = KeepAlive::new(Duration::from_secs(5), Duration::from_secs(1), 3)
            .with_timeout(Duration::from_secs(9));
        let policy = TimeoutPolicy::from(ka);
        assert_eq!(policy.timeout(), Some(Duration::from_secs(9)));
        assert_eq!(policy.keep_alive(), Some(&ka));
        assert_eq!(Timeout::from(None), Timeout::Never);
    }

    #[test]
    fn status_transitions() {
        let (conn, _peer) = pair(TimeoutPolicy::None);
        assert_eq!(conn.status(), Status::Open);
        conn.shutdown().unwrap();
        assert_eq!(conn.status(), Status::HalfClosed);
        assert!(matches!(conn.shutdown(), Err(NetError::AlreadyShutdown)));
        conn.close().unwrap();
        assert_eq!(conn.status(), Status::Closed);
        assert!(matches!(conn.close(), Err(NetError::NotConnected)));
        assert!(matches!(conn.shutdown(), Err(NetError::AlreadyShutdown)));
    }

    #[test]
    fn write_after_shutdown_fails() {
        let (conn, _peer) = pair(TimeoutPolicy::None);
        conn.shutdown().unwrap();
        let result = block_on(async move { conn.write(b"late", Timeout::Inherit).await });
        assert!(matches!(result, Err(NetError::AlreadyShutdown)));
    }

    #[test]
    fn buffered_bytes_are_read_first() {
        let (conn, mut peer) = pair(TimeoutPolicy::After(Duration::from_secs(5)));
        peer.write_all(b"line one\nrest").unwrap();
        let result = block_on(async move {
            let line = conn.read_until(b"\n", Timeout::Inherit).await?;
            assert_eq!(line, b"line one\n");
            let rest = conn.read(4, Timeout::Inherit).await?;
            Ok::<_, NetError>((rest, conn.buffered_len()))
        });
        let (rest, left) = result.unwrap();
        assert_eq!(rest, b"rest");
        assert_eq!(left, 0);
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let (conn, _peer) = pair(TimeoutPolicy::None);
        let result = block_on(async move { conn.read_until(b"", Timeout::Inherit).await });
        assert!(matches!(result, Err(NetError::EmptyPattern)));
    }

    #[test]
    fn read_all_reports_premature_eof() {
        let (conn, mut peer) = pair(TimeoutPolicy::None);
        peer.write_all(b"abc").unwrap();
        drop(peer);
        let result = block_on(async move { conn.read_all(Some(10), Timeout::Never).await });
        assert!(matches!(result, Err(NetError::ConnectionReset { .. })));
    }
}
