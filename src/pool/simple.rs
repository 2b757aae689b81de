//! Two-slot holder
//!
//! Owns one header and one body buffer and lends them out. A slot that is
//! `None` is on loan. When the requested role is out, the other role's buffer
//! is lent if it has the same capacity and is free; otherwise a fresh heap
//! buffer is allocated.

use parking_lot::Mutex;

use super::{unrecyclable, Buffers};
use crate::buffer::{Buf, BufMut, Buffer};
use crate::error::BufferError;

struct Slot {
    buffer: Option<Buffer>,
    id: usize,
    capacity: usize,
}

impl Slot {
    fn new(buffer: Buffer) -> Self {
        Self {
            id: buffer.id(),
            capacity: buffer.capacity(),
            buffer: Some(buffer),
        }
    }

    fn owns(&self, buffer: &Buffer) -> bool {
        self.buffer.is_none() && buffer.id() == self.id && buffer.capacity() == self.capacity
    }
}

struct Slots {
    header: Slot,
    body: Slot,
}

pub struct SimpleBuffers {
    slots: Mutex<Slots>,
}

impl SimpleBuffers {
    pub fn new(header: Buffer, body: Buffer) -> Self {
        Self {
            slots: Mutex::new(Slots {
                header: Slot::new(header),
                body: Slot::new(body),
            }),
        }
    }

    pub fn header_size(&self) -> usize {
        self.slots.lock().header.capacity
    }

    pub fn body_size(&self) -> usize {
        self.slots.lock().body.capacity
    }

    /// Whether the header and body slots are currently lent out.
    pub fn on_loan(&self) -> (bool, bool) {
        let slots = self.slots.lock();
        (slots.header.buffer.is_none(), slots.body.buffer.is_none())
    }
}

/// Lends `wanted`, else `spare` when capacities match, else allocates.
fn lend(wanted: &mut Slot, spare: &mut Slot) -> Buffer {
    if let Some(b) = wanted.buffer.take() {
        return b;
    }
    if spare.capacity == wanted.capacity {
        if let Some(b) = spare.buffer.take() {
            return b;
        }
    }
    Buffer::new(wanted.capacity)
}

impl Buffers for SimpleBuffers {
    fn get_header(&self) -> Result<Buffer, BufferError> {
        let mut guard = self.slots.lock();
        let slots = &mut *guard;
        Ok(lend(&mut slots.header, &mut slots.body))
    }

    fn get_buffer(&self) -> Result<Buffer, BufferError> {
        let mut guard = self.slots.lock();
        let slots = &mut *guard;
        Ok(lend(&mut slots.body, &mut slots.header))
    }

    fn get_buffer_sized(&self, size: usize) -> Result<Buffer, BufferError> {
        let (header, body) = {
            let slots = self.slots.lock();
            (slots.header.capacity, slots.body.capacity)
        };
        if size == header {
            self.get_header()
        } else if size == body {
            self.get_buffer()
        } else {
            Ok(Buffer::new(size))
        }
    }

    fn return_buffer(&self, mut buffer: Buffer) {
        if unrecyclable(&buffer) || buffer.clear().is_err() {
            return;
        }
        let mut slots = self.slots.lock();
        if slots.header.owns(&buffer) {
            slots.header.buffer = Some(buffer);
        } else if slots.body.owns(&buffer) {
            slots.body.buffer = Some(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lends_and_takes_back() {
        let pool = SimpleBuffers::new(Buffer::new(32), Buffer::new(64));
        let h = pool.get_header().unwrap();
        assert_eq!(pool.on_loan(), (true, false));
        let h_id = h.id();
        pool.return_buffer(h);
        assert_eq!(pool.on_loan(), (false, false));
        assert_eq!(pool.get_header().unwrap().id(), h_id);
    }

    #[test]
    fn test_lends_other_role_when_capacities_match() {
        let pool = SimpleBuffers::new(Buffer::new(32), Buffer::new(32));
        let _h1 = pool.get_header().unwrap();
        let _h2 = pool.get_header().unwrap();
        assert_eq!(pool.on_loan(), (true, true));
        let h3 = pool.get_header().unwrap();
        assert_eq!(h3.capacity(), 32);
    }

    #[test]
    fn test_allocates_when_exhausted() {
        let pool = SimpleBuffers::new(Buffer::new(32), Buffer::new(64));
        let _h = pool.get_header().unwrap();
        let extra = pool.get_header().unwrap();
        assert_eq!(extra.capacity(), 32);
        assert_eq!(pool.on_loan(), (true, false));

        // returning an ad hoc buffer does not fill the slot
        pool.return_buffer(extra);
        assert_eq!(pool.on_loan(), (true, false));
    }

    #[test]
    fn test_unknown_buffer_ignored() {
        let pool = SimpleBuffers::new(Buffer::new(32), Buffer::new(64));
        pool.return_buffer(Buffer::new(64));
        assert_eq!(pool.on_loan(), (false, false));
        assert_eq!(pool.get_buffer_sized(100).unwrap().capacity(), 100);
        assert_eq!(pool.get_buffer_sized(64).unwrap().capacity(), 64);
        assert_eq!(pool.on_loan(), (false, true));
    }
}
