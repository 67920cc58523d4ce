// src/mmap.rs
use std::fs::File;
use std::io;
use std::ops::Deref;

use memmap2::{Mmap, MmapOptions};

/// Read-only, private mapping of a whole file.
///
/// The mapping and its length live and die together, and the region is
/// unmapped exactly once when the value is dropped.
#[derive(Debug)]
pub struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    /// Maps the first `len` bytes of `file`. Zero-length mappings are
    /// rejected by the kernel, so callers must special-case empty files.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // SAFETY: the mapping is copy-on-write private and read-only; a
        // concurrent truncation of the file is the caller's risk, as with any
        // file-backed mapping.
        let map = unsafe { MmapOptions::new().len(len).map_copy_read_only(file)? };
        Ok(Self { map })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_file_contents() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"hello mapped world").unwrap();

        let map = MappedFile::map(&f, 18).unwrap();
        assert_eq!(map.len(), 18);
        assert_eq!(&map[..], b"hello mapped world");
    }

    #[test]
    fn empty_file_is_rejected() {
        let f = tempfile::tempfile().unwrap();
        let err = MappedFile::map(&f, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn mapping_outlives_file_handle() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"abc").unwrap();
        let map = MappedFile::map(&f, 3).unwrap();
        drop(f);
        assert_eq!(map.as_slice(), b"abc");
    }
}
