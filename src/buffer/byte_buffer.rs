//! Owned buffers

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;

use super::storage::Storage;
use super::{Access, Buf, BufMut, BufferKind, Case, Cursors, View};
use crate::error::BufferError;

/// A buffer that owns its storage.
///
/// ```text
/// Buffer::new(16)              heap, read-write, empty
/// Buffer::from_vec(bytes)      heap, read-write, full
/// Buffer::immutable(bytes)     heap, immutable, full
/// Buffer::direct(16)           anonymous mapping, read-write, empty
/// Buffer::map_file(path, cap)  file mapping, read-write, volatile
/// ```
pub struct Buffer {
    storage: Storage,
    kind: BufferKind,
    cursors: Cursors,
    access: Access,
    volatile: bool,
    case: Case,
}

impl Buffer {
    fn from_storage(storage: Storage, kind: BufferKind, get: usize, put: usize, access: Access) -> Self {
        Self {
            storage,
            kind,
            cursors: Cursors::new(get, put),
            access,
            volatile: false,
            case: Case::Sensitive,
        }
    }

    /// Empty read-write heap buffer.
    pub fn new(capacity: usize) -> Self {
        Self::from_storage(Storage::heap(capacity), BufferKind::ByteArray, 0, 0, Access::ReadWrite)
    }

    /// Empty read-write buffer outside the heap allocator.
    pub fn direct(capacity: usize) -> Result<Self, BufferError> {
        let storage = Storage::anonymous(capacity)?;
        Ok(Self::from_storage(storage, BufferKind::Direct, 0, 0, Access::ReadWrite))
    }

    /// Empty read-write buffer of the given kind. File mappings need a path
    /// and are rejected.
    pub fn allocate(kind: BufferKind, capacity: usize) -> Result<Self, BufferError> {
        match kind {
            BufferKind::ByteArray => Ok(Self::new(capacity)),
            BufferKind::Direct => Self::direct(capacity),
            BufferKind::Mapped => Err(BufferError::UnsupportedKind(kind)),
        }
    }

    /// Read-write heap buffer whose content is all of `bytes`.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self::from_storage(Storage::from_vec(bytes), BufferKind::ByteArray, 0, len, Access::ReadWrite)
    }

    /// Immutable heap buffer holding a copy of `bytes`.
    pub fn immutable(bytes: impl AsRef<[u8]>) -> Self {
        Self::with_content(bytes.as_ref().to_vec(), Access::Immutable, Case::Sensitive)
    }

    /// Heap buffer over `bytes` with the given access and folding.
    pub fn with_content(bytes: Vec<u8>, access: Access, case: Case) -> Self {
        let mut buffer = Self::from_vec(bytes);
        buffer.access = access;
        buffer.case = case;
        buffer
    }

    /// Maps `path` read-write with room for `capacity` bytes. Existing file
    /// content becomes the readable content.
    ///
    /// The mapping is volatile: other processes may change the bytes.
    pub fn map_file<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, BufferError> {
        let (storage, existing) = Storage::map_file(path, capacity)?;
        let mut buffer = Self::from_storage(storage, BufferKind::Mapped, 0, existing, Access::ReadWrite);
        buffer.volatile = true;
        Ok(buffer)
    }

    /// Maps all of `path` as immutable content.
    pub fn map_read_only<P: AsRef<Path>>(path: P) -> Result<Self, BufferError> {
        let storage = Storage::map_read_only(path)?;
        let len = storage.as_slice().len();
        Ok(Self::from_storage(storage, BufferKind::Mapped, 0, len, Access::Immutable))
    }

    /// Compare and hash ASCII letters case-insensitively.
    pub fn case_insensitive(mut self) -> Self {
        self.case = Case::Insensitive;
        self.cursors.invalidate();
        self
    }

    /// Marks the buffer volatile. Immutable buffers cannot be.
    pub fn into_volatile(mut self) -> Result<Self, BufferError> {
        if self.access == Access::Immutable {
            return Err(BufferError::ImmutableVolatile);
        }
        self.volatile = true;
        Ok(self)
    }

    /// Changes the access level of an owned buffer.
    pub fn with_access(mut self, access: Access) -> Result<Self, BufferError> {
        if access == Access::Immutable && self.volatile {
            return Err(BufferError::ImmutableVolatile);
        }
        if access == Access::ReadWrite && self.storage.as_mut_slice().is_none() {
            return Err(BufferError::NotWritable(Access::ReadOnly));
        }
        self.access = access;
        Ok(self)
    }

    /// Identity of the backing storage. Stable for the buffer's lifetime and
    /// distinct between live buffers with non-empty storage.
    pub fn id(&self) -> usize {
        self.storage.id()
    }

    /// Flushes a writable file mapping to disk. No-op for other kinds.
    pub fn sync(&self) -> io::Result<()> {
        self.storage.flush()
    }

    /// Writable view over `[get, put)`.
    pub fn slice_mut(&mut self) -> Result<View<'_>, BufferError> {
        let (get, put) = (self.cursors.get(), self.cursors.put());
        self.view_mut(get, put - get)
    }

    /// Writable view over `[index, index + len)`, clipped to capacity.
    pub fn view_mut(&mut self, index: usize, len: usize) -> Result<View<'_>, BufferError> {
        let (kind, case, access) = (self.kind, self.case, self.access);
        let bytes = self.storage_mut()?;
        Ok(View::exclusive(bytes, kind, case, index, index.saturating_add(len), access))
    }
}

impl Buf for Buffer {
    #[inline(always)]
    fn storage(&self) -> &[u8] {
        self.storage.as_slice()
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
        self.volatile
    }
}

impl BufMut for Buffer {
    #[inline(always)]
    fn cursors_mut(&mut self) -> &mut Cursors {
        &mut self.cursors
    }

    fn storage_raw_mut(&mut self) -> Option<&mut [u8]> {
        self.storage.as_mut_slice()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.content_eq(other)
    }
}

impl PartialEq<View<'_>> for Buffer {
    fn eq(&self, other: &View<'_>) -> bool {
        self.content_eq(other)
    }
}

impl Eq for Buffer {}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash_code());
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}{}", self.kind, self.access, self.detail())
    }
}

impl From<&'static str> for Buffer {
    fn from(s: &'static str) -> Self {
        Buffer::immutable(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_scenario_put_past_capacity() {
        let mut b = Buffer::new(16);
        assert_eq!(b.put(&[b'x'; 20]).unwrap(), 16);
        assert_eq!(b.space(), 0);
        assert_eq!(b.len(), 16);
    }

    #[test]
    fn test_case_insensitive_equality() {
        let upper = Buffer::from("GET");
        let lower = Buffer::from("get");
        assert_ne!(upper, lower);

        let upper = upper.case_insensitive();
        let lower = lower.case_insensitive();
        assert_eq!(upper, lower);
        assert_eq!(upper.hash_code(), lower.hash_code());

        let mut set = HashSet::new();
        set.insert(upper);
        assert!(set.contains(&lower));
    }

    #[test]
    fn test_round_trip_each_kind() {
        let path = std::env::temp_dir().join(format!("spindle_buffer_{}.dat", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let buffers = vec![
            Buffer::new(32),
            Buffer::direct(32).unwrap(),
            Buffer::map_file(&path, 32).unwrap(),
        ];
        for mut b in buffers {
            assert_eq!(b.put(b"round trip").unwrap(), 10);
            let mut out = [0u8; 10];
            assert_eq!(b.get_into(&mut out), 10);
            assert_eq!(&out, b"round trip");
            assert!(b.is_empty());
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mapped_buffer_reopens_content() {
        let path = std::env::temp_dir().join(format!("spindle_mapped_{}.dat", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut b = Buffer::map_file(&path, 16).unwrap();
            assert!(b.is_volatile());
            b.put(b"persist").unwrap();
            b.sync().unwrap();
        }
        let ro = Buffer::map_read_only(&path).unwrap();
        assert!(ro.is_immutable());
        assert_eq!(&ro.content()[..7], b"persist");
        assert!(!ro.is_array_backed());
        assert!(matches!(ro.as_array(), std::borrow::Cow::Owned(_)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_as_array_borrows_heap() {
        let b = Buffer::from_vec(b"abc".to_vec());
        assert!(matches!(b.as_array(), std::borrow::Cow::Borrowed(b"abc")));
    }

    #[test]
    fn test_immutable_cannot_be_volatile() {
        assert!(matches!(
            Buffer::immutable(b"x").into_volatile(),
            Err(BufferError::ImmutableVolatile)
        ));
        let v = Buffer::new(4).into_volatile().unwrap();
        assert!(matches!(v.with_access(Access::Immutable), Err(BufferError::ImmutableVolatile)));
    }

    #[test]
    fn test_immutable_rejects_cursor_moves() {
        let mut b = Buffer::immutable(b"abc");
        assert!(b.clear().is_err());
        assert!(b.set_get_index(1).is_err());
        assert!(b.put(b"x").is_err());
    }

    #[test]
    fn test_clear_idempotent() {
        let mut b = Buffer::new(8);
        b.put(b"abc").unwrap();
        b.mark();
        b.clear().unwrap();
        b.clear().unwrap();
        assert_eq!((b.mark_index(), b.get_index(), b.put_index()), (None, 0, 0));
    }

    #[test]
    fn test_allocate_mapped_unsupported() {
        assert!(matches!(
            Buffer::allocate(BufferKind::Mapped, 8),
            Err(BufferError::UnsupportedKind(BufferKind::Mapped))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(Vec<u8>),
        Get,
        Skip(usize),
        Mark,
        Reset,
        Compact,
        SetGet(usize),
        SetPut(usize),
        Clear,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Op::Put),
            Just(Op::Get),
            (0usize..20).prop_map(Op::Skip),
            Just(Op::Mark),
            Just(Op::Reset),
            Just(Op::Compact),
            (0usize..40).prop_map(Op::SetGet),
            (0usize..40).prop_map(Op::SetPut),
            Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_cursor_invariant_holds(ops in proptest::collection::vec(op(), 0..64)) {
            let mut b = Buffer::new(32);
            for op in ops {
                match op {
                    Op::Put(bytes) => {
                        let before = b.space();
                        let n = b.put(&bytes).unwrap();
                        prop_assert_eq!(n, bytes.len().min(before));
                    }
                    Op::Get => {
                        let _ = b.get();
                    }
                    Op::Skip(n) => {
                        let _ = b.skip(n);
                    }
                    Op::Mark => b.mark(),
                    Op::Reset => b.reset(),
                    Op::Compact => b.compact().unwrap(),
                    Op::SetGet(i) => {
                        let _ = b.set_get_index(i);
                    }
                    Op::SetPut(i) => {
                        let _ = b.set_put_index(i);
                    }
                    Op::Clear => b.clear().unwrap(),
                }
                prop_assert!(b.cursors().holds(b.capacity()));
            }
        }
    }
}
