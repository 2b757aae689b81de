//! Raw socket tuning and readiness waits through libc

use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Options applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: bool,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            send_buffer: Some(256 * 1024),
            recv_buffer: Some(256 * 1024),
        }
    }
}

impl SocketOptions {
    /// Makes the stream non-blocking and applies the options. Buffer sizes
    /// are best effort: not every platform honours them.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.tcp_nodelay)?;

        let fd = stream.as_raw_fd();
        if let Some(size) = self.send_buffer {
            let _ = set_int_option(fd, libc::SO_SNDBUF, size);
        }
        if let Some(size) = self.recv_buffer {
            let _ = set_int_option(fd, libc::SO_RCVBUF, size);
        }
        Ok(())
    }
}

fn set_int_option(fd: RawFd, option: libc::c_int, value: usize) -> io::Result<()> {
    let optval = value.min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY: fd is a live socket owned by the caller; optval outlives the call
    // and its size is passed alongside it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Blocks until `fd` reports `events` or `timeout` elapses. `Ok(false)` on
/// timeout.
pub(crate) fn wait_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        // SAFETY: a single valid pollfd on the stack.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    wait_fd(fd, libc::POLLIN, timeout)
}

pub(crate) fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    wait_fd(fd, libc::POLLOUT, timeout)
}
