//! Pool configuration and the request/response pool pair

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{BufferLayout, Buffers, PooledBuffers, WorkerBuffers};
use crate::buffer::{Buffer, BufferKind};
use crate::error::BufferError;
use crate::thread::WorkerContext;

/// Pool settings. A negative `max_buffers` selects per-worker caches instead
/// of a shared pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    pub header_size: usize,
    pub header_kind: BufferKind,
    pub body_size: usize,
    pub body_kind: BufferKind,
    pub other_kind: BufferKind,
    pub max_buffers: isize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::request()
    }
}

impl BufferPoolConfig {
    /// 6K headers, 16K bodies.
    pub fn request() -> Self {
        Self {
            header_size: 6 * 1024,
            header_kind: BufferKind::ByteArray,
            body_size: 16 * 1024,
            body_kind: BufferKind::ByteArray,
            other_kind: BufferKind::ByteArray,
            max_buffers: 1024,
        }
    }

    /// 6K headers, 32K bodies.
    pub fn response() -> Self {
        Self {
            body_size: 32 * 1024,
            ..Self::request()
        }
    }

    pub fn header(mut self, size: usize, kind: BufferKind) -> Self {
        self.header_size = size;
        self.header_kind = kind;
        self
    }

    pub fn body(mut self, size: usize, kind: BufferKind) -> Self {
        self.body_size = size;
        self.body_kind = kind;
        self
    }

    pub fn other_kind(mut self, kind: BufferKind) -> Self {
        self.other_kind = kind;
        self
    }

    pub fn max_buffers(mut self, max: isize) -> Self {
        self.max_buffers = max;
        self
    }

    pub fn layout(&self) -> BufferLayout {
        BufferLayout {
            header_size: self.header_size,
            header_kind: self.header_kind,
            body_size: self.body_size,
            body_kind: self.body_kind,
            other_kind: self.other_kind,
        }
    }

    pub fn build(&self) -> Result<BufferSource, BufferError> {
        let layout = self.layout().validated()?;
        if self.max_buffers < 0 {
            Ok(BufferSource::PerWorker {
                id: NEXT_SOURCE.fetch_add(1, Ordering::Relaxed),
                layout,
            })
        } else {
            let pool = PooledBuffers::new(layout, self.max_buffers as usize)?;
            Ok(BufferSource::Pooled(Arc::new(pool)))
        }
    }
}

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(0);

/// Built pool: one shared pool, or a layout from which every worker keeps
/// its own cache.
#[derive(Clone)]
pub enum BufferSource {
    Pooled(Arc<PooledBuffers>),
    PerWorker { id: u64, layout: BufferLayout },
}

impl BufferSource {
    /// The buffers to use while running on `worker`. Shared pools hand out
    /// another reference; per-worker mode returns the cache `worker` keeps
    /// for this source, so every job on that worker reuses the same slots.
    pub fn checkout(&self, worker: &WorkerContext) -> BufferLease {
        match self {
            BufferSource::Pooled(pool) => BufferLease::Shared(Arc::clone(pool)),
            // layout was validated in build()
            BufferSource::PerWorker { id, layout } => BufferLease::Worker(worker.worker_buffers(*id, *layout)),
        }
    }

    /// Gives back a buffer held outside any worker. Per-worker caches
    /// cannot be reached from there, so it is dropped.
    pub fn release(&self, buffer: Buffer) {
        if let BufferSource::Pooled(pool) = self {
            pool.return_buffer(buffer);
        }
    }

    pub fn layout(&self) -> BufferLayout {
        match self {
            BufferSource::Pooled(pool) => *pool.layout(),
            BufferSource::PerWorker { layout, .. } => *layout,
        }
    }
}

/// Buffers checked out for one job. Not `Send`: it stays on the worker
/// that checked it out.
pub enum BufferLease {
    Shared(Arc<PooledBuffers>),
    Worker(Rc<WorkerBuffers>),
}

impl BufferLease {
    fn buffers(&self) -> &dyn Buffers {
        match self {
            BufferLease::Shared(pool) => &**pool,
            BufferLease::Worker(cache) => &**cache,
        }
    }
}

impl Buffers for BufferLease {
    fn get_header(&self) -> Result<Buffer, BufferError> {
        self.buffers().get_header()
    }

    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        self.buffers().get_buffer()
    }

    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError> {
        self.buffers().get_buffer_sized(size)
    }

    fn return_buffer(&self, buffer: Buffer) {
        self.buffers().return_buffer(buffer)
    }
}

/// Separate pools for the inbound and outbound halves of an exchange.
#[derive(Clone)]
pub struct ExchangeBuffers {
    pub request: BufferSource,
    pub response: BufferSource,
}

impl ExchangeBuffers {
    pub fn new(request: &BufferPoolConfig, response: &BufferPoolConfig) -> Result<Self, BufferError> {
        Ok(Self {
            request: request.build()?,
            response: response.build()?,
        })
    }

    /// 6K/16K request and 6K/32K response pools of up to 1024 buffers each.
    pub fn with_defaults() -> Result<Self, BufferError> {
        Self::new(&BufferPoolConfig::request(), &BufferPoolConfig::response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buf;

    #[test]
    fn test_negative_max_selects_per_worker() {
        let source = BufferPoolConfig::default().max_buffers(-1).build().unwrap();
        assert!(matches!(source, BufferSource::PerWorker { .. }));

        let w0 = WorkerContext::new("w-0");
        let w1 = WorkerContext::new("w-1");
        let h = source.checkout(&w0).get_header().unwrap();
        let id = h.id();
        source.checkout(&w0).return_buffer(h);

        // workers do not share slots, later checkouts on one worker do
        assert_ne!(source.checkout(&w1).get_header().unwrap().id(), id);
        assert_eq!(source.checkout(&w0).get_header().unwrap().id(), id);
    }

    #[test]
    fn test_per_worker_sources_kept_apart() {
        let requests = BufferPoolConfig::request().max_buffers(-1).build().unwrap();
        let responses = BufferPoolConfig::response().max_buffers(-1).build().unwrap();
        let worker = WorkerContext::new("w-0");

        requests.checkout(&worker).return_buffer(Buffer::new(16 * 1024));
        let body = responses.checkout(&worker).get_buffer().unwrap();
        assert_eq!(body.capacity(), 32 * 1024);
        assert_eq!(worker.cached_buffers(), 1);
    }

    #[test]
    fn test_pooled_checkouts_share() {
        let source = BufferPoolConfig::default().max_buffers(4).build().unwrap();
        let a = source.checkout(&WorkerContext::new("w-0"));
        let b = source.checkout(&WorkerContext::new("w-1"));
        let body = a.get_buffer().unwrap();
        let id = body.id();
        a.return_buffer(body);
        assert_eq!(b.get_buffer().unwrap().id(), id);

        source.release(Buffer::new(16 * 1024));
        assert!(matches!(&source, BufferSource::Pooled(pool) if pool.pooled() == 1));
    }

    #[test]
    fn test_exchange_defaults() {
        let exchange = ExchangeBuffers::with_defaults().unwrap();
        assert_eq!(exchange.request.layout().body_size, 16 * 1024);
        assert_eq!(exchange.response.layout().body_size, 32 * 1024);
        let body = exchange.response.checkout(&WorkerContext::new("w-0")).get_buffer().unwrap();
        assert_eq!(body.capacity(), 32 * 1024);
    }

    #[test]
    fn test_mapped_kind_fails_fast() {
        let config = BufferPoolConfig::default().other_kind(BufferKind::Mapped);
        assert!(matches!(config.build(), Err(BufferError::UnsupportedKind(_))));
    }
}
