//! Cursor-Addressed Byte Buffers
//!
//! A buffer is a fixed-capacity byte container read and written through three
//! cursors instead of an offset/length pair:
//!
//! ```text
//!  0         mark        get              put            capacity
//!  |----------|-----------|################|--------------|
//!             ^ saved     ^ next read      ^ next write
//! ```
//!
//! The invariant `mark <= get <= put <= capacity` holds after every
//! operation; setters that would break it return [`BufferError::OutOfBounds`].
//! Writes past capacity are clipped, never errors.
//!
//! [`Buffer`] owns its storage (heap, anonymous mapping or file mapping).
//! [`View`] borrows a parent's storage with its own cursors and can never
//! outlive the parent.
//!
//! [`BufferError::OutOfBounds`]: crate::error::BufferError::OutOfBounds

mod byte_buffer;
mod cursor;
mod derived;
mod ops;
mod storage;
mod view;

use std::fmt;

pub use byte_buffer::Buffer;
pub use cursor::Cursors;
pub use derived::Derived;
pub use ops::{Buf, BufMut};
pub use view::View;

/// Who may change a buffer's bytes and cursors.
///
/// Ordered so that `access <= Access::ReadOnly` reads as "not writable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    /// Neither content nor cursors ever change.
    Immutable = 0,
    /// Cursors move, content does not.
    ReadOnly = 1,
    ReadWrite = 2,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Immutable => "IMMUTABLE",
            Access::ReadOnly => "READONLY",
            Access::ReadWrite => "READWRITE",
        })
    }
}

/// Backing storage of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Heap byte array. The only array-backed kind.
    ByteArray,
    /// Anonymous memory mapping outside the allocator.
    Direct,
    /// Memory-mapped file.
    Mapped,
}

/// How content is compared and hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Case {
    #[default]
    Sensitive,
    /// ASCII letters compare and hash as their uppercase form.
    Insensitive,
}

/// `31 * h + b` over ASCII-uppercased bytes.
///
/// Folding keeps the hash consistent with case-insensitive equality.
#[inline]
pub(crate) fn folded_hash(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |h, &b| {
        h.wrapping_mul(31).wrapping_add(u32::from(b.to_ascii_uppercase()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_ordering() {
        assert!(Access::Immutable < Access::ReadOnly);
        assert!(Access::ReadOnly < Access::ReadWrite);
        assert_eq!(Access::ReadWrite.to_string(), "READWRITE");
    }

    #[test]
    fn test_folded_hash_ignores_case() {
        assert_eq!(folded_hash(b"Content-Length"), folded_hash(b"CONTENT-LENGTH"));
        assert_ne!(folded_hash(b"GET"), folded_hash(b"PUT"));
        assert_eq!(folded_hash(b""), 0);
    }
}
