//! Readiness-Driven Network Layer
//!
//! ```text
//!  acceptor threads ──register──► SelectSet 0..M (one mio::Poll + thread each)
//!                                     │ readiness
//!                                     ▼
//!                               SelectEndpoint::schedule
//!                                     │ dispatch
//!                                     ▼
//!                               ThreadPool ──► Connection::handle
//!                                     │ interest changes
//!                                     └────────► SelectSet change queue
//! ```
//!
//! Only a set's own thread touches its `mio::Poll` registrations; every
//! other thread goes through the set's change queue and waker.

mod channel;
mod connection;
mod connector;
mod select_endpoint;
mod selector;
mod socket;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::buffer::BufMut;

pub use channel::ChannelEndpoint;
pub use connection::{Connection, ConnectionFactory, Handled};
pub use connector::{ConnectorConfig, SelectConnector};
pub use select_endpoint::{DispatchState, SelectEndpoint};
pub use selector::{SelectorConfig, SelectorManager};
pub use socket::SocketOptions;

/// Outcome of [`EndPoint::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes read; zero when nothing was available or the buffer was full.
    Bytes(usize),
    /// The peer closed its side or input was shut down.
    Eof,
}

impl Fill {
    pub fn is_eof(&self) -> bool {
        matches!(self, Fill::Eof)
    }

    pub fn bytes(&self) -> usize {
        match self {
            Fill::Bytes(n) => *n,
            Fill::Eof => 0,
        }
    }
}

/// One connection's byte transport.
///
/// Reads and writes go through buffers: `fill` appends at the buffer's `put`
/// cursor, `flush` consumes from its `get` cursor. I/O failures close the
/// channel; they surface as errors only when the failing call had already
/// moved bytes, otherwise as end of stream or zero progress.
pub trait EndPoint: Send + Sync {
    fn fill(&self, buffer: &mut dyn BufMut) -> io::Result<Fill>;

    /// Writes as much content as the socket takes without blocking.
    fn flush(&self, buffer: &mut dyn BufMut) -> io::Result<usize>;

    /// Writes header, then body, then trailer, each only once everything
    /// before it is gone. Header and body go out in one gathering write when
    /// both have content.
    fn flush_all(
        &self,
        header: Option<&mut dyn BufMut>,
        body: Option<&mut dyn BufMut>,
        trailer: Option<&mut dyn BufMut>,
    ) -> io::Result<usize>;

    fn shutdown_input(&self) -> io::Result<()>;
    fn shutdown_output(&self) -> io::Result<()>;
    fn is_input_shutdown(&self) -> bool;
    fn is_output_shutdown(&self) -> bool;

    fn close(&self) -> io::Result<()>;
    fn is_open(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;

    fn is_blocking(&self) -> bool;

    /// Waits until readable. `Ok(false)` on timeout.
    fn block_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Waits until writable. `Ok(false)` on timeout.
    fn block_writable(&self, timeout: Duration) -> io::Result<bool>;

    fn max_idle_time(&self) -> Option<Duration>;
    fn set_max_idle_time(&self, max_idle: Option<Duration>);
}
