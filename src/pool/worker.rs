//! Single-owner cache
//!
//! One slot per role. A getter whose slot is empty takes the other slot when
//! it holds a buffer of that role. The cache is `!Sync`: each pool worker
//! keeps its own in its [`WorkerContext`](crate::thread::WorkerContext) and
//! hands it to the jobs it runs.

use std::cell::RefCell;

use super::{unrecyclable, BufferLayout, Buffers};
use crate::buffer::{Buf, BufMut, Buffer};
use crate::error::BufferError;

#[derive(Default)]
struct Slots {
    header: Option<Buffer>,
    body: Option<Buffer>,
    other: Option<Buffer>,
}

pub struct WorkerBuffers {
    layout: BufferLayout,
    slots: RefCell<Slots>,
}

impl WorkerBuffers {
    pub fn new(layout: BufferLayout) -> Result<Self, BufferError> {
        Ok(Self::unchecked(layout.validated()?))
    }

    pub(crate) fn unchecked(layout: BufferLayout) -> Self {
        Self {
            layout,
            slots: RefCell::new(Slots::default()),
        }
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Number of occupied slots.
    pub fn cached(&self) -> usize {
        let slots = self.slots.borrow();
        [&slots.header, &slots.body, &slots.other]
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

fn take_if(slot: &mut Option<Buffer>, pred: impl FnOnce(&Buffer) -> bool) -> Option<Buffer> {
    if slot.as_ref().is_some_and(pred) {
        slot.take()
    } else {
        None
    }
}

impl Buffers for WorkerBuffers {
    fn get_header(&self) -> Result<Buffer, BufferError> {
        let cached = {
            let mut slots = self.slots.borrow_mut();
            let layout = &self.layout;
            slots.header.take().or_else(|| take_if(&mut slots.other, |b| layout.is_header(b)))
        };
        match cached {
            Some(b) => Ok(b),
            None => self.layout.new_header(),
        }
    }

    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        let cached = {
            let mut slots = self.slots.borrow_mut();
            let layout = &self.layout;
            slots.body.take().or_else(|| take_if(&mut slots.other, |b| layout.is_body(b)))
        };
        match cached {
            Some(b) => Ok(b),
            None => self.layout.new_body(),
        }
    }

    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError> {
        if self.layout.header_serves(size) {
            return self.get_header();
        }
        if self.layout.body_serves(size) {
            return self.get_buffer();
        }
        let cached = take_if(&mut self.slots.borrow_mut().other, |b| b.capacity() == size);
        match cached {
            Some(b) => Ok(b),
            None => self.layout.new_other(size),
        }
    }

    fn return_buffer(&self, mut buffer: Buffer) {
        if unrecyclable(&buffer) || buffer.clear().is_err() {
            return;
        }
        let mut slots = self.slots.borrow_mut();
        if slots.header.is_none() && self.layout.is_header(&buffer) {
            slots.header = Some(buffer);
        } else if slots.body.is_none() && self.layout.is_body(&buffer) {
            slots.body = Some(buffer);
        } else {
            slots.other = Some(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;

    fn cache() -> WorkerBuffers {
        WorkerBuffers::new(BufferLayout {
            header_size: 32,
            header_kind: BufferKind::ByteArray,
            body_size: 128,
            body_kind: BufferKind::Direct,
            other_kind: BufferKind::ByteArray,
        })
        .unwrap()
    }

    #[test]
    fn test_slot_reuse() {
        let cache = cache();
        let h = cache.get_header().unwrap();
        let id = h.id();
        cache.return_buffer(h);
        assert_eq!(cache.cached(), 1);
        assert_eq!(cache.get_header().unwrap().id(), id);
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_second_header_lands_in_other_slot() {
        let cache = cache();
        let a = cache.get_header().unwrap();
        let b = cache.get_header().unwrap();
        let b_id = b.id();
        cache.return_buffer(a);
        cache.return_buffer(b);
        assert_eq!(cache.cached(), 2);

        // header kind equals other kind, so sized requests for 32 go to the header slot
        let first = cache.get_buffer_sized(32).unwrap();
        assert_ne!(first.id(), b_id);
    }

    #[test]
    fn test_spare_header_served_from_other_slot() {
        let cache = cache();
        let a = cache.get_header().unwrap();
        let b = cache.get_header().unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        cache.return_buffer(a);
        cache.return_buffer(b);

        assert_eq!(cache.get_header().unwrap().id(), a_id);
        assert_eq!(cache.get_header().unwrap().id(), b_id);
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_spare_body_served_from_other_slot() {
        let cache = cache();
        let a = cache.get_buffer().unwrap();
        let b = cache.get_buffer().unwrap();
        let b_id = b.id();
        cache.return_buffer(a);
        cache.return_buffer(b);

        cache.get_buffer().unwrap();
        let second = cache.get_buffer().unwrap();
        assert_eq!(second.id(), b_id);
        assert_eq!(second.kind(), BufferKind::Direct);

        // a header never stands in for a body
        cache.return_buffer(cache.get_header().unwrap());
        let h = cache.get_header().unwrap();
        cache.return_buffer(Buffer::new(32));
        cache.return_buffer(h);
        assert_eq!(cache.get_buffer().unwrap().capacity(), 128);
        assert_eq!(cache.cached(), 2);
    }

    #[test]
    fn test_other_slot_matches_capacity() {
        let cache = cache();
        cache.return_buffer(Buffer::new(500));
        assert_eq!(cache.get_buffer_sized(400).unwrap().capacity(), 400);
        assert_eq!(cache.cached(), 1);
        assert_eq!(cache.get_buffer_sized(500).unwrap().capacity(), 500);
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_body_kind() {
        let cache = cache();
        let body = cache.get_buffer().unwrap();
        assert_eq!(body.kind(), BufferKind::Direct);
        assert_eq!(body.capacity(), 128);
    }
}
