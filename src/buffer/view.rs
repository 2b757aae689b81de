//! Borrowed windows onto another buffer's storage

use std::fmt;
use std::hash::{Hash, Hasher};

use super::{Access, Buf, BufMut, Buffer, BufferKind, Case, Cursors};

enum Source<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
}

/// A buffer over storage owned by someone else.
///
/// Cursors are absolute indices into the parent's storage, so the capacity
/// of a view is the parent's capacity. A view is always volatile: the parent
/// may reuse the bytes as soon as the borrow ends. Shared views are at most
/// [`Access::ReadOnly`]; only a view obtained from `&mut` on the parent can
/// write.
pub struct View<'a> {
    source: Source<'a>,
    kind: BufferKind,
    case: Case,
    cursors: Cursors,
    access: Access,
}

/// Clips `(mark, get, put)` into `[0, capacity]` keeping `mark <= get <= put`.
fn clipped(capacity: usize, mark: Option<usize>, get: usize, put: usize) -> Cursors {
    let put = put.min(capacity);
    let get = get.min(put);
    let mut cursors = Cursors::new(get, put);
    cursors.set_mark(mark.filter(|&m| m <= get));
    cursors
}

impl<'a> View<'a> {
    pub(crate) fn shared(
        bytes: &'a [u8],
        kind: BufferKind,
        case: Case,
        mark: Option<usize>,
        get: usize,
        put: usize,
        access: Access,
    ) -> Self {
        Self {
            cursors: clipped(bytes.len(), mark, get, put),
            source: Source::Shared(bytes),
            kind,
            case,
            access: access.min(Access::ReadOnly),
        }
    }

    pub(crate) fn exclusive(
        bytes: &'a mut [u8],
        kind: BufferKind,
        case: Case,
        get: usize,
        put: usize,
        access: Access,
    ) -> Self {
        Self {
            cursors: clipped(bytes.len(), None, get, put),
            source: Source::Exclusive(bytes),
            kind,
            case,
            access,
        }
    }

    /// Repositions the window, clipped to the parent's capacity.
    pub fn update(&mut self, get: usize, put: usize) {
        self.cursors = clipped(self.storage().len(), None, get, put);
    }

    /// Same window compared case-insensitively.
    pub fn case_insensitive(mut self) -> Self {
        self.case = Case::Insensitive;
        self.cursors.invalidate();
        self
    }
}

impl Buf for View<'_> {
    #[inline(always)]
    fn storage(&self) -> &[u8] {
        match &self.source {
            Source::Shared(b) => b,
            Source::Exclusive(b) => b,
        }
    }

    #[inline(always)]
    fn cursors(&self) -> &Cursors {
        &self.cursors
    }

    fn access(&self) -> Access {
        self.access
    }

    fn kind(&self) -> BufferKind {
        self.kind
    }

    fn case(&self) -> Case {
        self.case
    }

    fn is_volatile(&self) -> bool {
        true
    }
}

impl BufMut for View<'_> {
    #[inline(always)]
    fn cursors_mut(&mut self) -> &mut Cursors {
        &mut self.cursors
    }

    fn storage_raw_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.source {
            Source::Shared(_) => None,
            Source::Exclusive(b) => Some(&mut b[..]),
        }
    }

    /// Shared bytes never move under a view: a no-op unless read-only.
    fn compact(&mut self) -> Result<(), crate::error::BufferError> {
        if self.is_read_only() {
            return Err(crate::error::BufferError::NotWritable(self.access));
        }
        Ok(())
    }
}

impl PartialEq for View<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.content_eq(other)
    }
}

impl PartialEq<Buffer> for View<'_> {
    fn eq(&self, other: &Buffer) -> bool {
        self.content_eq(other)
    }
}

impl Eq for View<'_> {}

impl Hash for View<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash_code());
    }
}

impl fmt::Display for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View{}", self.detail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BufferError;

    #[test]
    fn test_view_shares_storage() {
        let b = Buffer::from_vec(b"Host: example.org".to_vec());
        let v = b.view(6, 7);
        assert_eq!(v.content(), b"example");
        assert_eq!(v.capacity(), b.capacity());
        assert_eq!(v.storage().as_ptr(), b.storage().as_ptr());
        assert!(v.is_volatile());
        assert_eq!(v.access(), Access::ReadOnly);
    }

    #[test]
    fn test_view_clips_to_capacity() {
        let b = Buffer::from_vec(b"abc".to_vec());
        let v = b.view(1, usize::MAX);
        assert_eq!(v.content(), b"bc");
        let v = b.view(10, 2);
        assert!(v.is_empty());
    }

    #[test]
    fn test_shared_view_cannot_write() {
        let b = Buffer::from_vec(b"abc".to_vec());
        let mut v = b.slice();
        assert!(matches!(v.put(b"x"), Err(BufferError::NotWritable(Access::ReadOnly))));
        assert_eq!(v.get(), Some(b'a'));
        assert_eq!(b.get_index(), 0);
    }

    #[test]
    fn test_exclusive_view_writes_through() {
        let mut b = Buffer::new(8);
        b.put(b"ab").unwrap();
        {
            let mut v = b.slice_mut().unwrap();
            v.poke_byte(0, b'A').unwrap();
            assert_eq!(v.put(b"cd").unwrap(), 2);
            v.compact().unwrap();
        }
        assert_eq!(b.content(), b"Ab");
        assert_eq!(b.peek_at(2), Some(b'c'));
    }

    #[test]
    fn test_view_equality_across_types() {
        let a = Buffer::from_vec(b"xyz".to_vec());
        let b = Buffer::immutable(b"--xyz");
        let v = b.view(2, 3);
        assert!(v == a);
        assert!(a == v);
    }

    #[test]
    fn test_update_repositions() {
        let b = Buffer::from_vec(b"0123456789".to_vec());
        let mut v = b.slice();
        v.update(3, 5);
        assert_eq!(v.content(), b"34");
    }
}
