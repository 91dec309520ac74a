// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking socket plumbing.
//!
//! Every socket call is classified into an [`Attempt`]; callers run their
//! own retry loop around `wait_io` instead of unwinding on `EAGAIN`.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, OwnedFd};

use crate::error::NetError;

/// Outcome of one non-blocking socket call.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Ready(T),
    WouldBlock,
    Failed(NetError),
}

impl<T> From<io::Result<T>> for Attempt<T> {
    fn from(result: io::Result<T>) -> Self {
        match result {
            Ok(value) => Attempt::Ready(value),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Attempt::WouldBlock
            }
            Err(err) => Attempt::Failed(map_io_error(err)),
        }
    }
}

/// Map errors that mean the peer is gone to `ConnectionReset`.
pub(crate) fn map_io_error(err: io::Error) -> NetError {
    match err.raw_os_error() {
        Some(libc::ECONNRESET | libc::EPIPE | libc::ECONNABORTED | libc::ETIMEDOUT) => {
            NetError::reset(err.to_string())
        }
        _ => NetError::Io(err),
    }
}

/// Convert a std socket address into a raw sockaddr for `connect(2)`.
fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in).write(raw);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6).write(raw);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Begin a non-blocking TCP connect.
///
/// Returns the socket and whether the connect is still in progress (the
/// caller then waits for writability and checks `take_error`).
pub(crate) fn start_connect(addr: &SocketAddr) -> io::Result<(TcpStream, bool)> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let stream = TcpStream::from(unsafe { OwnedFd::from_raw_fd(fd) });

    let (raw, len) = socket_addr_to_raw(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &raw as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret == 0 {
        return Ok((stream, false));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => Ok((stream, true)),
        _ => Err(err),
    }
}

/// Index of the first occurrence of `pattern` in `haystack`.
pub(crate) fn find(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || haystack.len() < pattern.len() {
        return None;
    }
    haystack.windows(pattern.len()).position(|w| w == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn reset_like_errors() {
        for errno in [libc::ECONNRESET, libc::EPIPE, libc::ECONNABORTED, libc::ETIMEDOUT] {
            let err = map_io_error(io::Error::from_raw_os_error(errno));
            assert!(matches!(err, NetError::ConnectionReset { .. }));
        }
        let err = map_io_error(io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(err, NetError::Io(_)));
    }

    #[test]
    fn attempt_classification() {
        let would_block: io::Result<usize> = Err(io::ErrorKind::WouldBlock.into());
        assert!(matches!(Attempt::from(would_block), Attempt::WouldBlock));
        assert!(matches!(Attempt::from(Ok::<_, io::Error>(3)), Attempt::Ready(3)));
    }

    #[test]
    fn find_pattern() {
        assert_eq!(find(b"hello\r\n", b"\r\n"), Some(5));
        assert_eq!(find(b"\r", b"\r\n"), None);
        assert_eq!(find(b"abcabc", b"cab"), Some(2));
        assert_eq!(find(b"abc", b""), None);
    }

    #[test]
    fn connect_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _pending) = start_connect(&addr).unwrap();
        let (_accepted, peer) = listener.accept().unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
        assert!(stream.take_error().unwrap().is_none());
    }
}
