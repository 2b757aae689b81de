//! Shared fixed-capacity pool
//!
//! Lock-free `SegQueue`s per role; an atomic count bounds the total number of
//! pooled buffers across all three queues.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{unrecyclable, BufferLayout, Buffers};
use crate::buffer::{Buf, BufMut, Buffer};
use crate::error::BufferError;

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh buffers handed out.
    pub allocations: u64,
    /// Pooled buffers handed out again.
    pub reuses: u64,
    /// Returned or pooled buffers discarded.
    pub drops: u64,
    /// Buffers currently pooled.
    pub pooled: usize,
}

pub struct PooledBuffers {
    layout: BufferLayout,
    headers: SegQueue<Buffer>,
    bodies: SegQueue<Buffer>,
    others: SegQueue<Buffer>,
    size: AtomicUsize,
    max_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    drops: AtomicU64,
}

impl PooledBuffers {
    /// Pool holding at most `max_size` idle buffers.
    pub fn new(layout: BufferLayout, max_size: usize) -> Result<Self, BufferError> {
        Ok(Self {
            layout: layout.validated()?,
            headers: SegQueue::new(),
            bodies: SegQueue::new(),
            others: SegQueue::new(),
            size: AtomicUsize::new(0),
            max_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        })
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Idle buffers across all roles.
    pub fn pooled(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            pooled: self.pooled(),
        }
    }

    #[inline]
    fn take(&self, queue: &SegQueue<Buffer>) -> Option<Buffer> {
        let buffer = queue.pop()?;
        self.size.fetch_sub(1, Ordering::AcqRel);
        Some(buffer)
    }

    #[inline]
    fn reused(&self, buffer: Buffer) -> Buffer {
        self.reuses.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    #[inline]
    fn allocated(&self, buffer: Result<Buffer, BufferError>) -> Result<Buffer, BufferError> {
        if buffer.is_ok() {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
        buffer
    }
}

impl Buffers for PooledBuffers {
    fn get_header(&self) -> Result<Buffer, BufferError> {
        match self.take(&self.headers) {
            Some(b) => Ok(self.reused(b)),
            None => self.allocated(self.layout.new_header()),
        }
    }

    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        match self.take(&self.bodies) {
            Some(b) => Ok(self.reused(b)),
            None => self.allocated(self.layout.new_body()),
        }
    }

    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError> {
        if self.layout.header_serves(size) {
            return self.get_header();
        }
        if self.layout.body_serves(size) {
            return self.get_buffer();
        }

        // Mismatched others are discarded rather than requeued
        while let Some(buffer) = self.take(&self.others) {
            if buffer.capacity() == size {
                return Ok(self.reused(buffer));
            }
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
        self.allocated(self.layout.new_other(size))
    }

    fn return_buffer(&self, mut buffer: Buffer) {
        if unrecyclable(&buffer) || buffer.clear().is_err() {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.size.fetch_add(1, Ordering::AcqRel) >= self.max_size {
            self.size.fetch_sub(1, Ordering::AcqRel);
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.layout.is_header(&buffer) {
            self.headers.push(buffer);
        } else if self.layout.is_body(&buffer) {
            self.bodies.push(buffer);
        } else {
            self.others.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn layout() -> BufferLayout {
        BufferLayout {
            header_size: 64,
            header_kind: BufferKind::ByteArray,
            body_size: 256,
            body_kind: BufferKind::ByteArray,
            other_kind: BufferKind::ByteArray,
        }
    }

    #[test]
    fn test_third_borrow_reuses() {
        let pool = PooledBuffers::new(layout(), 2).unwrap();
        let a = pool.get_buffer().unwrap();
        let b = pool.get_buffer().unwrap();
        let ids = [a.id(), b.id()];
        pool.return_buffer(a);
        pool.return_buffer(b);

        let c = pool.get_buffer().unwrap();
        assert!(ids.contains(&c.id()));
        let stats = pool.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.pooled, 1);
    }

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = PooledBuffers::new(layout(), 4).unwrap();
        let mut h = pool.get_header().unwrap();
        h.put(b"stale").unwrap();
        h.mark();
        pool.return_buffer(h);

        let h = pool.get_header().unwrap();
        assert!(h.is_empty());
        assert_eq!(h.mark_index(), None);
    }

    #[test]
    fn test_volatile_and_immutable_not_recycled() {
        let pool = PooledBuffers::new(layout(), 4).unwrap();
        pool.return_buffer(Buffer::new(256).into_volatile().unwrap());
        pool.return_buffer(Buffer::immutable([0u8; 256]));
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.stats().drops, 2);
    }

    #[test]
    fn test_sized_request_routes_and_discards() {
        let pool = PooledBuffers::new(layout(), 8).unwrap();
        pool.return_buffer(Buffer::new(100));
        pool.return_buffer(Buffer::new(200));
        assert_eq!(pool.pooled(), 2);

        let b = pool.get_buffer_sized(200).unwrap();
        assert_eq!(b.capacity(), 200);
        // the 100-byte buffer was polled first and discarded
        assert_eq!(pool.pooled(), 0);
        assert_eq!(pool.stats().drops, 1);

        let h = pool.get_buffer_sized(64).unwrap();
        assert!(pool.layout().is_header(&h));
    }

    #[test]
    fn test_other_kind_mismatch_bypasses_body_queue() {
        let pool = PooledBuffers::new(
            BufferLayout {
                body_kind: BufferKind::Direct,
                ..layout()
            },
            8,
        )
        .unwrap();
        let body = pool.get_buffer().unwrap();
        pool.return_buffer(body);
        let other = pool.get_buffer_sized(256).unwrap();
        assert_eq!(other.kind(), BufferKind::ByteArray);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_bound_holds_under_concurrency() {
        let pool = Arc::new(PooledBuffers::new(layout(), 16).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let sampler = {
            let pool = Arc::clone(&pool);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut samples = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let held = pool.headers.len() + pool.bodies.len() + pool.others.len();
                    assert!(held <= 16, "{held} buffers pooled");
                    // the count may overshoot by one in-flight return per thread before rolling back
                    assert!(pool.pooled() <= 16 + 8, "count {}", pool.pooled());
                    samples += 1;
                    if finished {
                        return samples;
                    }
                }
            })
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let held: Vec<_> = (0..4).map(|_| pool.get_buffer().unwrap()).collect();
                        for b in held {
                            pool.return_buffer(b);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);

        assert!(sampler.join().unwrap() > 0);
        assert!(pool.bodies.len() <= 16);
        assert_eq!(pool.pooled(), pool.bodies.len());
    }
}
