// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! TCP keep-alive probing.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::warn;

/// Keep-alive parameters, used in place of a plain timeout.
///
/// After `interval` of silence the kernel sends a probe, repeats it every
/// `retry` and drops the connection after `count` unanswered probes. Pending
/// operations then fail with `ConnectionReset`. `timeout` is applied as the
/// connection's default operation deadline on top of the probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub interval: Duration,
    pub retry: Duration,
    pub count: u32,
    pub timeout: Option<Duration>,
}

impl KeepAlive {
    pub fn new(interval: Duration, retry: Duration, count: u32) -> Self {
        Self {
            interval,
            retry,
            count,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable probing on `fd`. Knobs the kernel rejects are logged and
    /// skipped.
    pub(crate) fn apply(&self, fd: RawFd) {
        if let Err(err) = set_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) {
            warn!("Keep-alive is not supported for socket {}: {}", fd, err);
            return;
        }
        let knobs = [
            ("TCP_KEEPIDLE", libc::TCP_KEEPIDLE, whole_secs(self.interval)),
            ("TCP_KEEPINTVL", libc::TCP_KEEPINTVL, whole_secs(self.retry)),
            ("TCP_KEEPCNT", libc::TCP_KEEPCNT, self.count.max(1) as libc::c_int),
        ];
        for (label, opt, value) in knobs {
            if let Err(err) = set_int(fd, libc::IPPROTO_TCP, opt, value) {
                warn!("Keep-alive option {} unsupported for socket {}: {}", label, fd, err);
            }
        }
    }
}

/// Kernel keep-alive timers take whole seconds, at least one.
fn whole_secs(d: Duration) -> libc::c_int {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.clamp(1, libc::c_int::MAX as u64) as libc::c_int
}

fn set_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn get_int(fd: RawFd, level: libc::c_int, opt: libc::c_int) -> libc::c_int {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                fd,
                level,
                opt,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            );
        }
        value
    }

    #[test]
    fn rounds_up_to_whole_seconds() {
        assert_eq!(whole_secs(Duration::ZERO), 1);
        assert_eq!(whole_secs(Duration::from_millis(1500)), 2);
        assert_eq!(whole_secs(Duration::from_secs(30)), 30);
    }

    #[test]
    fn applies_socket_options() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let fd = stream.as_raw_fd();

        KeepAlive::new(Duration::from_secs(10), Duration::from_secs(3), 4).apply(fd);

        assert_eq!(get_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE), 1);
        assert_eq!(get_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE), 10);
        assert_eq!(get_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL), 3);
        assert_eq!(get_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT), 4);
    }
}
