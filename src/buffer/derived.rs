//! Result of the `as_*` access conversions

use super::{Access, Buf, Buffer, BufferKind, Case, Cursors, View};

/// A buffer seen under a different access level or volatility.
///
/// Either the original itself, a read-only view onto it, or an owned copy.
/// Conversions never widen access through an alias: anything that would
/// needs a copy.
pub enum Derived<'a, B: ?Sized> {
    Same(&'a B),
    View(View<'a>),
    Owned(Buffer),
}

impl<'a, B: Buf> Derived<'a, B> {
    pub fn is_same(&self) -> bool {
        matches!(self, Derived::Same(_))
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, Derived::Owned(_))
    }

    /// Detaches from the original, copying when borrowed.
    pub fn into_owned(self) -> Buffer {
        match self {
            Derived::Same(b) => b.duplicate(b.access()),
            Derived::View(v) => v.duplicate(v.access()),
            Derived::Owned(b) => b,
        }
    }

    fn inner(&self) -> &dyn Buf {
        match self {
            Derived::Same(b) => *b as &dyn Buf,
            Derived::View(v) => v,
            Derived::Owned(b) => b,
        }
    }
}

impl<B: Buf> Buf for Derived<'_, B> {
    fn storage(&self) -> &[u8] {
        self.inner().storage()
    }

    fn cursors(&self) -> &Cursors {
        self.inner().cursors()
    }

    fn access(&self) -> Access {
        self.inner().access()
    }

    fn kind(&self) -> BufferKind {
        self.inner().kind()
    }

    fn case(&self) -> Case {
        self.inner().case()
    }

    fn is_volatile(&self) -> bool {
        self.inner().is_volatile()
    }
}
