//! Read and write operations shared by [`Buffer`](super::Buffer) and [`View`]
//!
//! Implementors supply the storage, cursors and flags; everything else is a
//! provided method. Both traits are object safe: methods that take a generic
//! reader or writer or return `Self`-typed wrappers are bounded by `Self: Sized`.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::io::{self, Read, Write};

use super::{folded_hash, Access, Buffer, BufferKind, Case, Cursors, Derived, View};
use crate::error::BufferError;

/// Bytes shown at the head and tail of a long content dump.
const DETAIL_HEAD: usize = 48;
const DETAIL_TAIL: usize = 16;

/// Read-side buffer operations.
pub trait Buf {
    /// The whole backing region, `[0, capacity)`.
    fn storage(&self) -> &[u8];
    fn cursors(&self) -> &Cursors;
    fn access(&self) -> Access;
    fn kind(&self) -> BufferKind;
    fn case(&self) -> Case;
    fn is_volatile(&self) -> bool;

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.storage().len()
    }

    #[inline(always)]
    fn get_index(&self) -> usize {
        self.cursors().get()
    }

    #[inline(always)]
    fn put_index(&self) -> usize {
        self.cursors().put()
    }

    #[inline(always)]
    fn mark_index(&self) -> Option<usize> {
        self.cursors().mark()
    }

    /// Readable bytes, `put - get`.
    #[inline(always)]
    fn len(&self) -> usize {
        self.cursors().len()
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.cursors().is_empty()
    }

    #[inline(always)]
    fn has_content(&self) -> bool {
        !self.is_empty()
    }

    /// Writable bytes left, `capacity - put`.
    #[inline(always)]
    fn space(&self) -> usize {
        self.capacity() - self.put_index()
    }

    fn is_immutable(&self) -> bool {
        self.access() == Access::Immutable
    }

    fn is_read_only(&self) -> bool {
        self.access() <= Access::ReadOnly
    }

    fn is_array_backed(&self) -> bool {
        self.kind() == BufferKind::ByteArray
    }

    fn is_case_insensitive(&self) -> bool {
        self.case() == Case::Insensitive
    }

    /// `[get, put)`.
    #[inline(always)]
    fn content(&self) -> &[u8] {
        let c = self.cursors();
        &self.storage()[c.get()..c.put()]
    }

    /// `[mark, get)`, empty when no mark is set.
    fn marked(&self) -> &[u8] {
        let c = self.cursors();
        match c.mark() {
            Some(m) => &self.storage()[m..c.get()],
            None => &[],
        }
    }

    /// Byte at `get` without consuming it.
    #[inline]
    fn peek(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.storage()[self.get_index()])
        }
    }

    /// Byte at an absolute index, ignoring cursors.
    #[inline]
    fn peek_at(&self, index: usize) -> Option<u8> {
        self.storage().get(index).copied()
    }

    /// Copies from an absolute index into `dst`, clipped to capacity.
    fn peek_into(&self, index: usize, dst: &mut [u8]) -> usize {
        let storage = self.storage();
        if index >= storage.len() {
            return 0;
        }
        let n = dst.len().min(storage.len() - index);
        dst[..n].copy_from_slice(&storage[index..index + n]);
        n
    }

    /// Content as a slice, copied only when the storage is not a heap array.
    fn as_array(&self) -> Cow<'_, [u8]> {
        if self.is_array_backed() {
            Cow::Borrowed(self.content())
        } else {
            Cow::Owned(self.content().to_vec())
        }
    }

    fn to_vec(&self) -> Vec<u8> {
        self.content().to_vec()
    }

    /// Content hash over case-folded bytes, memoised until a cursor moves or
    /// content is poked.
    fn hash_code(&self) -> u32 {
        let cursors = self.cursors();
        if let Some(hash) = cursors.memo() {
            return hash;
        }
        let hash = folded_hash(self.content());
        cursors.remember(hash);
        hash
    }

    /// Content equality, folded when either side is case-insensitive.
    fn content_eq(&self, other: &dyn Buf) -> bool {
        if self.is_case_insensitive() || other.is_case_insensitive() {
            return self.eq_ignore_case(other);
        }
        if !memos_agree(self.cursors(), other.cursors(), self.len(), other.len()) {
            return false;
        }
        self.content() == other.content()
    }

    fn eq_ignore_case(&self, other: &dyn Buf) -> bool {
        if !memos_agree(self.cursors(), other.cursors(), self.len(), other.len()) {
            return false;
        }
        self.content().eq_ignore_ascii_case(other.content())
    }

    /// View over `[index, index + len)` sharing this storage, clipped to
    /// capacity. Never writable.
    fn view(&self, index: usize, len: usize) -> View<'_> {
        let end = index.saturating_add(len);
        View::shared(self.storage(), self.kind(), self.case(), None, index, end, self.access())
    }

    /// View over `[get, put)`.
    fn slice(&self) -> View<'_> {
        let c = self.cursors();
        View::shared(
            self.storage(),
            self.kind(),
            self.case(),
            None,
            c.get(),
            c.put(),
            self.access(),
        )
    }

    /// Owned heap copy of the content with the given access.
    fn duplicate(&self, access: Access) -> Buffer {
        Buffer::with_content(self.content().to_vec(), access, self.case())
    }

    fn as_immutable(&self) -> Derived<'_, Self>
    where
        Self: Sized,
    {
        if self.is_immutable() {
            Derived::Same(self)
        } else {
            Derived::Owned(self.duplicate(Access::Immutable))
        }
    }

    fn as_read_only(&self) -> Derived<'_, Self>
    where
        Self: Sized,
    {
        if self.is_read_only() {
            return Derived::Same(self);
        }
        let c = self.cursors();
        Derived::View(View::shared(
            self.storage(),
            self.kind(),
            self.case(),
            c.mark(),
            c.get(),
            c.put(),
            Access::ReadOnly,
        ))
    }

    /// Same buffer when writable, otherwise a writable copy.
    fn as_mutable(&self) -> Derived<'_, Self>
    where
        Self: Sized,
    {
        if self.is_read_only() {
            Derived::Owned(self.duplicate(Access::ReadWrite))
        } else {
            Derived::Same(self)
        }
    }

    fn as_non_volatile(&self) -> Derived<'_, Self>
    where
        Self: Sized,
    {
        if self.is_volatile() {
            Derived::Owned(self.duplicate(self.access()))
        } else {
            Derived::Same(self)
        }
    }

    /// Content as text, invalid UTF-8 replaced.
    fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }

    /// Cursor positions and a hex dump of the marked and readable regions.
    fn detail(&self) -> String {
        let c = self.cursors();
        let mut out = format!(
            "[{:#x},m={},g={},p={},c={}]={{",
            self.storage().as_ptr() as usize,
            c.mark().map_or(-1, |m| m as isize),
            c.get(),
            c.put(),
            self.capacity()
        );
        hex_into(&mut out, self.marked());
        out.push_str("<<<");
        let content = self.content();
        if content.len() > DETAIL_HEAD + DETAIL_TAIL {
            hex_into(&mut out, &content[..DETAIL_HEAD]);
            out.push_str("...");
            hex_into(&mut out, &content[content.len() - DETAIL_TAIL..]);
        } else {
            hex_into(&mut out, content);
        }
        out.push_str(">>>}");
        out
    }
}

/// O(1) pre-checks before comparing bytes: lengths, then hashes if both
/// sides already have one for their current cursors.
#[inline]
fn memos_agree(a: &Cursors, b: &Cursors, a_len: usize, b_len: usize) -> bool {
    if a_len != b_len {
        return false;
    }
    match (a.memo(), b.memo()) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn hex_into(out: &mut String, bytes: &[u8]) {
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
}

fn out_of_bounds(b: &(impl Buf + ?Sized), index: usize) -> BufferError {
    let c = b.cursors();
    BufferError::OutOfBounds {
        index,
        mark: c.mark(),
        get: c.get(),
        put: c.put(),
        capacity: b.capacity(),
    }
}

/// Write-side operations. Content changes need [`Access::ReadWrite`]; cursor
/// moves need anything but [`Access::Immutable`].
pub trait BufMut: Buf {
    fn cursors_mut(&mut self) -> &mut Cursors;

    /// Backing region for writing regardless of access level. `None` when the
    /// storage itself cannot be written.
    fn storage_raw_mut(&mut self) -> Option<&mut [u8]>;

    /// Backing region for writing, checked against the access level. Drops
    /// the memoised hash.
    fn storage_mut(&mut self) -> Result<&mut [u8], BufferError> {
        let access = self.access();
        if access <= Access::ReadOnly {
            return Err(BufferError::NotWritable(access));
        }
        self.cursors().invalidate();
        self.storage_raw_mut()
            .ok_or(BufferError::NotWritable(Access::ReadOnly))
    }

    /// Guard for cursor moves.
    #[inline]
    fn check_movable(&self) -> Result<(), BufferError> {
        match self.access() {
            Access::Immutable => Err(BufferError::NotWritable(Access::Immutable)),
            _ => Ok(()),
        }
    }

    fn set_get_index(&mut self, index: usize) -> Result<(), BufferError> {
        self.check_movable()?;
        if index > self.put_index() {
            return Err(out_of_bounds(&*self, index));
        }
        self.cursors_mut().set_get(index);
        Ok(())
    }

    fn set_put_index(&mut self, index: usize) -> Result<(), BufferError> {
        self.check_movable()?;
        if index < self.get_index() || index > self.capacity() {
            return Err(out_of_bounds(&*self, index));
        }
        self.cursors_mut().set_put(index);
        Ok(())
    }

    fn set_mark_index(&mut self, index: Option<usize>) -> Result<(), BufferError> {
        self.check_movable()?;
        if let Some(m) = index {
            if m > self.get_index() {
                return Err(out_of_bounds(&*self, m));
            }
        }
        self.cursors_mut().set_mark(index);
        Ok(())
    }

    /// Sets all three cursors at once, validating the final arrangement.
    fn set_indices(&mut self, mark: Option<usize>, get: usize, put: usize) -> Result<(), BufferError> {
        self.check_movable()?;
        let valid = mark.map_or(true, |m| m <= get) && get <= put && put <= self.capacity();
        if !valid {
            return Err(out_of_bounds(&*self, put));
        }
        self.cursors_mut().set_all(mark, get, put);
        Ok(())
    }

    /// Empties the buffer: all cursors to zero, mark cleared.
    fn clear(&mut self) -> Result<(), BufferError> {
        self.check_movable()?;
        self.cursors_mut().clear();
        Ok(())
    }

    /// Remembers the current `get`.
    fn mark(&mut self) {
        let get = self.get_index();
        self.cursors_mut().set_mark(Some(get));
    }

    /// Marks `get + offset`; the result must not pass `get`.
    fn mark_at(&mut self, offset: isize) -> Result<(), BufferError> {
        let get = self.get_index();
        match get.checked_add_signed(offset) {
            Some(m) => self.set_mark_index(Some(m)),
            None => Err(out_of_bounds(&*self, get)),
        }
    }

    fn clear_mark(&mut self) {
        self.cursors_mut().set_mark(None);
    }

    /// Moves `get` back to the mark, if any. The mark survives.
    fn reset(&mut self) {
        if let Some(m) = self.mark_index() {
            self.cursors_mut().set_get(m);
        }
    }

    /// Consumes up to `n` bytes without reading them.
    fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        if n > 0 {
            let get = self.get_index();
            self.cursors_mut().set_get(get + n);
        }
        n
    }

    /// Consumes one byte.
    #[inline]
    fn get(&mut self) -> Option<u8> {
        let b = self.peek()?;
        let get = self.get_index();
        self.cursors_mut().set_get(get + 1);
        Some(b)
    }

    /// Consumes up to `dst.len()` bytes into `dst`.
    fn get_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        let get = self.get_index();
        dst[..n].copy_from_slice(&self.storage()[get..get + n]);
        self.cursors_mut().set_get(get + n);
        n
    }

    /// Consumes up to `len` bytes, returning them as a view.
    fn get_view(&mut self, len: usize) -> View<'_> {
        let n = len.min(self.len());
        let get = self.get_index();
        self.cursors_mut().set_get(get + n);
        View::shared(
            self.storage(),
            self.kind(),
            self.case(),
            None,
            get,
            get + n,
            self.access(),
        )
    }

    /// Writes one byte at an absolute index without moving cursors.
    fn poke_byte(&mut self, index: usize, b: u8) -> Result<(), BufferError> {
        if index >= self.capacity() {
            return Err(out_of_bounds(&*self, index));
        }
        self.storage_mut()?[index] = b;
        Ok(())
    }

    /// Writes `src` at an absolute index without moving cursors, clipped to
    /// capacity. Returns the bytes written.
    fn poke(&mut self, index: usize, src: &[u8]) -> Result<usize, BufferError> {
        let capacity = self.capacity();
        if index > capacity {
            return Err(out_of_bounds(&*self, index));
        }
        let n = src.len().min(capacity - index);
        self.storage_mut()?[index..index + n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    fn poke_buf(&mut self, index: usize, src: &dyn Buf) -> Result<usize, BufferError> {
        self.poke(index, src.content())
    }

    /// Appends one byte. `Ok(false)` when there is no space.
    fn put_byte(&mut self, b: u8) -> Result<bool, BufferError> {
        let put = self.put_index();
        if put >= self.capacity() {
            self.storage_mut()?;
            return Ok(false);
        }
        self.poke_byte(put, b)?;
        self.cursors_mut().set_put(put + 1);
        Ok(true)
    }

    /// Appends as much of `src` as fits. Returns the bytes accepted.
    fn put(&mut self, src: &[u8]) -> Result<usize, BufferError> {
        let put = self.put_index();
        let n = self.poke(put, src)?;
        self.cursors_mut().set_put(put + n);
        Ok(n)
    }

    /// Appends as much of `src`'s content as fits. `src` is not consumed.
    fn put_buf(&mut self, src: &dyn Buf) -> Result<usize, BufferError> {
        self.put(src.content())
    }

    /// `[put, capacity)` for writing in place; follow with [`advance_put`].
    ///
    /// [`advance_put`]: BufMut::advance_put
    fn space_mut(&mut self) -> Result<&mut [u8], BufferError> {
        let put = self.put_index();
        Ok(&mut self.storage_mut()?[put..])
    }

    /// Commits `n` bytes written through [`space_mut`](BufMut::space_mut).
    fn advance_put(&mut self, n: usize) -> Result<(), BufferError> {
        let put = self.put_index();
        self.set_put_index(put.saturating_add(n))
    }

    /// Moves `[mark or get, put)` to the start of the storage.
    fn compact(&mut self) -> Result<(), BufferError> {
        if self.is_read_only() {
            return Err(BufferError::NotWritable(self.access()));
        }
        let c = self.cursors();
        let start = c.mark().unwrap_or(c.get());
        let put = c.put();
        if start == 0 {
            return Ok(());
        }
        self.storage_mut()?.copy_within(start..put, 0);
        self.cursors_mut().shift_down(start);
        Ok(())
    }

    /// View over `[mark, get)`; clears the mark. `None` when unmarked.
    fn slice_from_mark(&mut self) -> Option<View<'_>> {
        let mark = self.mark_index()?;
        let get = self.get_index();
        self.cursors_mut().set_mark(None);
        Some(View::shared(
            self.storage(),
            self.kind(),
            self.case(),
            None,
            mark,
            get,
            self.access(),
        ))
    }

    /// View over `[mark, mark + len)`; clears the mark.
    fn slice_from_mark_len(&mut self, len: usize) -> Option<View<'_>> {
        let mark = self.mark_index()?;
        self.cursors_mut().set_mark(None);
        let end = mark.saturating_add(len).min(self.get_index());
        Some(View::shared(
            self.storage(),
            self.kind(),
            self.case(),
            None,
            mark,
            end,
            self.access(),
        ))
    }

    /// One `read` from `reader` into the free space, at most `max` bytes.
    /// `Ok(0)` means end of stream or no space.
    fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R, max: usize) -> io::Result<usize>
    where
        Self: Sized,
    {
        let n = {
            let space = self.space_mut()?;
            let limit = space.len().min(max);
            if limit == 0 {
                return Ok(0);
            }
            reader.read(&mut space[..limit])?
        };
        self.advance_put(n)?;
        Ok(n)
    }

    /// Writes all content to `writer`, then clears.
    fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<()>
    where
        Self: Sized,
    {
        writer.write_all(self.content())?;
        self.clear()?;
        Ok(())
    }
}
