//! Storage backings for owned buffers
//!
//! - Heap: plain boxed slice, the only array-backed kind
//! - Anonymous: `mmap(MAP_ANONYMOUS)` region, kept outside the allocator
//! - File: file mapping, read-write (volatile) or read-only (immutable)

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

pub(crate) enum Storage {
    Heap(Box<[u8]>),
    Anonymous(MmapMut),
    File(MmapMut),
    FileReadOnly(Mmap),
}

impl Storage {
    pub(crate) fn heap(capacity: usize) -> Self {
        Storage::Heap(vec![0u8; capacity].into_boxed_slice())
    }

    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        Storage::Heap(bytes.into_boxed_slice())
    }

    /// Zero-filled anonymous mapping of `capacity` bytes.
    pub(crate) fn anonymous(capacity: usize) -> io::Result<Self> {
        // mmap rejects zero-length regions
        if capacity == 0 {
            return Ok(Storage::Heap(Box::default()));
        }
        let mmap = MmapOptions::new().len(capacity).map_anon()?;
        Ok(Storage::Anonymous(mmap))
    }

    /// Maps `path` read-write with room for `capacity` bytes.
    ///
    /// The file is created if missing and extended to `capacity`. Returns the
    /// storage and the file's length before extension, which is where the
    /// existing content ends.
    pub(crate) fn map_file<P: AsRef<Path>>(path: P, capacity: usize) -> io::Result<(Self, usize)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existing = file.metadata()?.len() as usize;
        if existing > capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file holds {existing} bytes, capacity is {capacity}"),
            ));
        }
        if capacity == 0 {
            return Ok((Storage::Heap(Box::default()), 0));
        }
        if existing < capacity {
            file.set_len(capacity as u64)?;
        }

        // SAFETY: file was opened read/write and sized to `capacity` above.
        // Concurrent modification by other processes is the caller's concern,
        // as with any shared mapping.
        let mmap = unsafe { MmapOptions::new().len(capacity).map_mut(&file)? };
        Ok((Storage::File(mmap), existing))
    }

    /// Maps the whole of `path` read-only.
    pub(crate) fn map_read_only<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Storage::Heap(Box::default()));
        }
        // SAFETY: mapping is read-only; the file is never written through it.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Storage::FileReadOnly(mmap))
    }

    #[inline(always)]
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Heap(b) => &b[..],
            Storage::Anonymous(m) | Storage::File(m) => &m[..],
            Storage::FileReadOnly(m) => &m[..],
        }
    }

    /// `None` for read-only mappings.
    #[inline(always)]
    pub(crate) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Storage::Heap(b) => Some(&mut b[..]),
            Storage::Anonymous(m) | Storage::File(m) => Some(&mut m[..]),
            Storage::FileReadOnly(_) => None,
        }
    }

    /// Address of the first byte, stable for the storage's lifetime.
    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }

    /// Flushes dirty pages of a writable file mapping.
    pub(crate) fn flush(&self) -> io::Result<()> {
        match self {
            Storage::File(m) => m.flush(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_anonymous_is_zeroed() {
        let storage = Storage::anonymous(4096).unwrap();
        assert_eq!(storage.as_slice().len(), 4096);
        assert!(storage.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_map_file_persists() {
        let path = std::env::temp_dir().join(format!("spindle_storage_{}.dat", std::process::id()));

        {
            let (mut storage, existing) = Storage::map_file(&path, 64).unwrap();
            assert_eq!(existing, 0);
            storage.as_mut_slice().unwrap()[..5].copy_from_slice(b"hello");
            storage.flush().unwrap();
        }

        {
            let storage = Storage::map_read_only(&path).unwrap();
            assert_eq!(&storage.as_slice()[..5], b"hello");
        }

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_map_file_rejects_short_capacity() {
        let path = std::env::temp_dir().join(format!("spindle_short_{}.dat", std::process::id()));
        fs::write(&path, b"0123456789").unwrap();
        assert!(Storage::map_file(&path, 4).is_err());
        fs::remove_file(&path).ok();
    }
}
