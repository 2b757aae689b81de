//! Cursor triple with a memoised content hash

use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HashMemo {
    get: usize,
    put: usize,
    hash: u32,
}

/// `mark <= get <= put` positions plus the last computed hash.
///
/// The raw setters here do not know the capacity; bounds are validated by
/// the [`BufMut`](super::BufMut) methods that call them. Every move of a
/// cursor drops the memoised hash.
#[derive(Debug, Clone, Default)]
pub struct Cursors {
    mark: Option<usize>,
    get: usize,
    put: usize,
    memo: Cell<Option<HashMemo>>,
}

impl Cursors {
    pub const fn new(get: usize, put: usize) -> Self {
        Self {
            mark: None,
            get,
            put,
            memo: Cell::new(None),
        }
    }

    #[inline(always)]
    pub fn mark(&self) -> Option<usize> {
        self.mark
    }

    #[inline(always)]
    pub fn get(&self) -> usize {
        self.get
    }

    #[inline(always)]
    pub fn put(&self) -> usize {
        self.put
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.put - self.get
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.put == self.get
    }

    /// True when `mark <= get <= put <= capacity`.
    pub fn holds(&self, capacity: usize) -> bool {
        self.mark.map_or(true, |m| m <= self.get) && self.get <= self.put && self.put <= capacity
    }

    /// Moves `get`, dropping a mark that would end up past it.
    #[inline]
    pub(crate) fn set_get(&mut self, get: usize) {
        self.get = get;
        if self.mark.map_or(false, |m| m > get) {
            self.mark = None;
        }
        self.invalidate();
    }

    #[inline]
    pub(crate) fn set_put(&mut self, put: usize) {
        self.put = put;
        self.invalidate();
    }

    #[inline]
    pub(crate) fn set_mark(&mut self, mark: Option<usize>) {
        self.mark = mark;
    }

    pub(crate) fn set_all(&mut self, mark: Option<usize>, get: usize, put: usize) {
        self.mark = mark;
        self.get = get;
        self.put = put;
        self.invalidate();
    }

    pub(crate) fn clear(&mut self) {
        self.set_all(None, 0, 0);
    }

    /// Shifts every cursor down by `delta` after a compaction.
    pub(crate) fn shift_down(&mut self, delta: usize) {
        self.mark = self.mark.map(|m| m - delta);
        self.get -= delta;
        self.put -= delta;
        self.invalidate();
    }

    #[inline]
    pub(crate) fn invalidate(&self) {
        self.memo.set(None);
    }

    /// The memoised hash, if it was computed for the current `(get, put)`.
    #[inline]
    pub(crate) fn memo(&self) -> Option<u32> {
        self.memo
            .get()
            .filter(|m| m.get == self.get && m.put == self.put)
            .map(|m| m.hash)
    }

    #[inline]
    pub(crate) fn remember(&self, hash: u32) {
        self.memo.set(Some(HashMemo {
            get: self.get,
            put: self.put,
            hash,
        }));
    }
}
