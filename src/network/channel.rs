//! Non-blocking TCP endpoint
//!
//! Reads drain the socket until it would block or the buffer is full, so
//! edge-triggered readiness is never left half consumed. Writes go out until
//! the socket would block; whatever remains stays in the buffer.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mio::net::TcpStream;
use tracing::trace;

use super::socket::{wait_readable, wait_writable};
use super::{EndPoint, Fill};
use crate::buffer::BufMut;

pub struct ChannelEndpoint {
    stream: TcpStream,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    input_shut: AtomicBool,
    output_shut: AtomicBool,
    closed: AtomicBool,
    /// Milliseconds, 0 for no limit.
    max_idle_ms: AtomicU64,
}

impl ChannelEndpoint {
    /// Wraps an already non-blocking stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
            stream,
            input_shut: AtomicBool::new(false),
            output_shut: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            max_idle_ms: AtomicU64::new(0),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Closes after an I/O failure, ignoring secondary errors.
    fn close_quietly(&self) {
        if let Err(e) = self.close() {
            trace!(error = %e, "close after failure");
        }
    }

    fn check_output(&self) -> io::Result<()> {
        if self.is_output_shutdown() {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "output is shut down"))
        } else {
            Ok(())
        }
    }

    /// One vectored write of header then body.
    fn gathering_flush(&self, header: &mut dyn BufMut, body: &mut dyn BufMut) -> io::Result<usize> {
        self.check_output()?;
        let header_len = header.len();
        let result = {
            let slices = [IoSlice::new(header.content()), IoSlice::new(body.content())];
            (&self.stream).write_vectored(&slices)
        };
        match result {
            Ok(n) if n > header_len => {
                header.skip(header_len);
                body.skip(n - header_len);
                Ok(n)
            }
            Ok(n) => {
                header.skip(n);
                Ok(n)
            }
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => {
                trace!(error = %e, "gathering write failed");
                self.close_quietly();
                Ok(0)
            }
        }
    }
}

#[inline]
fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Shutdown on an already disconnected socket is not a failure.
fn shutdown_result(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl EndPoint for ChannelEndpoint {
    fn fill(&self, buffer: &mut dyn BufMut) -> io::Result<Fill> {
        if self.is_input_shutdown() {
            return Ok(Fill::Eof);
        }

        let mut total = 0;
        let mut eof = false;
        loop {
            let space = buffer.space_mut()?;
            if space.is_empty() {
                break;
            }
            match (&self.stream).read(space) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    buffer.advance_put(n)?;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close_quietly();
                    return if total > 0 { Err(e) } else { Ok(Fill::Eof) };
                }
            }
        }

        if eof {
            let _ = self.shutdown_input();
            if total == 0 {
                return Ok(Fill::Eof);
            }
        }
        Ok(Fill::Bytes(total))
    }

    fn flush(&self, buffer: &mut dyn BufMut) -> io::Result<usize> {
        self.check_output()?;
        let mut total = 0;
        while buffer.has_content() {
            match (&self.stream).write(buffer.content()) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.skip(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close_quietly();
                    return if total > 0 { Err(e) } else { Ok(0) };
                }
            }
        }
        Ok(total)
    }

    fn flush_all(
        &self,
        mut header: Option<&mut dyn BufMut>,
        mut body: Option<&mut dyn BufMut>,
        mut trailer: Option<&mut dyn BufMut>,
    ) -> io::Result<usize> {
        if let (Some(h), Some(b)) = (header.as_deref_mut(), body.as_deref_mut()) {
            if h.has_content() && b.has_content() {
                return self.gathering_flush(h, b);
            }
        }

        let mut length = 0;
        if let Some(h) = header.as_deref_mut() {
            if h.has_content() {
                length += self.flush(h)?;
            }
        }
        let header_done = header.as_deref().map_or(true, |h| h.is_empty());

        if header_done {
            if let Some(b) = body.as_deref_mut() {
                if b.has_content() {
                    length += self.flush(b)?;
                }
            }
        }
        let body_done = body.as_deref().map_or(true, |b| b.is_empty());

        if header_done && body_done {
            if let Some(t) = trailer.as_deref_mut() {
                if t.has_content() {
                    length += self.flush(t)?;
                }
            }
        }
        Ok(length)
    }

    fn shutdown_input(&self) -> io::Result<()> {
        if self.input_shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = shutdown_result(self.stream.shutdown(Shutdown::Read));
        if self.is_output_shutdown() {
            self.close()?;
        }
        result
    }

    fn shutdown_output(&self) -> io::Result<()> {
        if self.output_shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = shutdown_result(self.stream.shutdown(Shutdown::Write));
        if self.is_input_shutdown() {
            self.close()?;
        }
        result
    }

    fn is_input_shutdown(&self) -> bool {
        self.input_shut.load(Ordering::Acquire)
    }

    fn is_output_shutdown(&self) -> bool {
        self.output_shut.load(Ordering::Acquire)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.input_shut.store(true, Ordering::Release);
        self.output_shut.store(true, Ordering::Release);
        shutdown_result(self.stream.shutdown(Shutdown::Both))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn block_readable(&self, timeout: Duration) -> io::Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        wait_readable(self.raw_fd(), timeout)
    }

    fn block_writable(&self, timeout: Duration) -> io::Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        wait_writable(self.raw_fd(), timeout)
    }

    fn max_idle_time(&self) -> Option<Duration> {
        match self.max_idle_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn set_max_idle_time(&self, max_idle: Option<Duration>) {
        let ms = max_idle.map_or(0, |d| d.as_millis().clamp(1, u64::MAX as u128) as u64);
        self.max_idle_ms.store(ms, Ordering::Release);
    }
}
