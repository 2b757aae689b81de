//! Buffer Recycling
//!
//! Three strategies behind one [`Buffers`] trait:
//!
//! - [`PooledBuffers`]: lock-free queues bounded by an atomic count, shared
//!   by every thread
//! - [`WorkerBuffers`]: one slot per role, owned by a single worker and never
//!   shared
//! - [`SimpleBuffers`]: one pre-allocated header and body lent out under a
//!   mutex
//!
//! Buffers come in three roles: *header* (small, fixed size), *body* (larger,
//! fixed size) and *other* (any size). A returned buffer is cleared before it
//! is retained; volatile and immutable buffers are never recycled.

mod config;
mod pooled;
mod simple;
mod worker;

use std::sync::Arc;

use crate::buffer::{Buf, Buffer, BufferKind};
use crate::error::BufferError;

pub use config::{BufferLease, BufferPoolConfig, BufferSource, ExchangeBuffers};
pub use pooled::{PoolStats, PooledBuffers};
pub use simple::SimpleBuffers;
pub use worker::WorkerBuffers;

/// Source and sink of recyclable buffers.
pub trait Buffers {
    /// A buffer of header size.
    fn get_header(&self) -> Result<Buffer, BufferError>;

    /// A buffer of body size.
    fn get_buffer(&self) -> Result<Buffer, BufferError>;

    /// A buffer of exactly `size` bytes capacity.
    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError>;

    /// Hands a buffer back. It may be retained for reuse or dropped.
    fn return_buffer(&self, buffer: Buffer);
}

impl<T: Buffers + ?Sized> Buffers for Arc<T> {
    fn get_header(&self) -> Result<Buffer, BufferError> {
        (**self).get_header()
    }

    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        (**self).get_buffer()
    }

    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError> {
        (**self).get_buffer_sized(size)
    }

    fn return_buffer(&self, buffer: Buffer) {
        (**self).return_buffer(buffer)
    }
}

impl<T: Buffers + ?Sized> Buffers for Box<T> {
    fn get_header(&self) -> Result<Buffer, BufferError> {
        (**self).get_header()
    }

    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        (**self).get_buffer()
    }

    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError> {
        (**self).get_buffer_sized(size)
    }

    fn return_buffer(&self, buffer: Buffer) {
        (**self).return_buffer(buffer)
    }
}

/// Sizes and backing kinds of the three roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub header_size: usize,
    pub header_kind: BufferKind,
    pub body_size: usize,
    pub body_kind: BufferKind,
    pub other_kind: BufferKind,
}

impl BufferLayout {
    /// Fails fast on kinds a pool cannot allocate.
    pub fn validated(self) -> Result<Self, BufferError> {
        for kind in [self.header_kind, self.body_kind, self.other_kind] {
            if kind == BufferKind::Mapped {
                return Err(BufferError::UnsupportedKind(kind));
            }
        }
        Ok(self)
    }

    pub fn is_header(&self, buffer: &dyn Buf) -> bool {
        buffer.capacity() == self.header_size && buffer.kind() == self.header_kind
    }

    pub fn is_body(&self, buffer: &dyn Buf) -> bool {
        buffer.capacity() == self.body_size && buffer.kind() == self.body_kind
    }

    /// Sized requests for the header size are served as headers.
    #[inline]
    pub(crate) fn header_serves(&self, size: usize) -> bool {
        size == self.header_size && self.other_kind == self.header_kind
    }

    #[inline]
    pub(crate) fn body_serves(&self, size: usize) -> bool {
        size == self.body_size && self.other_kind == self.body_kind
    }

    pub fn new_header(&self) -> Result<Buffer, BufferError> {
        Buffer::allocate(self.header_kind, self.header_size)
    }

    pub fn new_body(&self) -> Result<Buffer, BufferError> {
        Buffer::allocate(self.body_kind, self.body_size)
    }

    pub fn new_other(&self, size: usize) -> Result<Buffer, BufferError> {
        Buffer::allocate(self.other_kind, size)
    }
}

impl Default for BufferLayout {
    fn default() -> Self {
        Self {
            header_size: 6 * 1024,
            header_kind: BufferKind::ByteArray,
            body_size: 16 * 1024,
            body_kind: BufferKind::ByteArray,
            other_kind: BufferKind::ByteArray,
        }
    }
}

/// True for buffers that must never go back into a pool.
#[inline]
pub(crate) fn unrecyclable(buffer: &Buffer) -> bool {
    buffer.is_volatile() || buffer.is_immutable()
}
