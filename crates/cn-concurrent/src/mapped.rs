//! Memory-mapped file ownership.
//!
//! Log buffers and the cnc file are plain files mapped read-write into every
//! participating process.  `MappedFile` owns the mapping; [`AtomicBuffer`]
//! views are handed out to components and must not outlive the owner, which
//! the driver guarantees by keeping `Arc<MappedFile>` alive alongside every
//! view.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::buffer::AtomicBuffer;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("mapping '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// An owned read-write file mapping.
pub struct MappedFile {
    map: MmapMut,
    path: PathBuf,
}

impl MappedFile {
    /// Create (or truncate) a file of `len` bytes and map it.
    ///
    /// The file is extended with `set_len`, so unwritten pages are sparse
    /// until first touch.  Callers needing eagerly-committed pages pre-touch
    /// via [`MappedFile::pre_touch`].
    pub fn create(path: &Path, len: usize) -> Result<Self, MapError> {
        let io = |source| MapError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io)?;
        file.set_len(len as u64).map_err(io)?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io)?;
        Ok(MappedFile {
            map,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing file in full.
    pub fn open(path: &Path) -> Result<Self, MapError> {
        let io = |source| MapError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io)?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io)?;
        Ok(MappedFile {
            map,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// View over the whole mapping.
    pub fn buffer(&self) -> AtomicBuffer {
        unsafe { AtomicBuffer::new(self.map.as_ptr() as *mut u8, self.map.len()) }
    }

    /// View over a sub-range of the mapping.
    pub fn buffer_at(&self, offset: usize, len: usize) -> AtomicBuffer {
        self.buffer().view(offset, len)
    }

    /// Touch every page so the kernel commits backing store up front.
    pub fn pre_touch(&self) {
        let page = page_size();
        let buf = self.buffer();
        let mut offset = 0;
        while offset < buf.capacity() {
            buf.get_u8(offset);
            offset += page;
        }
    }

    /// Delete the backing file.  The mapping stays valid until drop.
    pub fn delete_file(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// The system page size in bytes.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_map_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.map");

        let mapped = MappedFile::create(&path, 4096).unwrap();
        mapped.buffer().put_i64(128, 0x1234_5678);
        drop(mapped);

        let reopened = MappedFile::open(&path).unwrap();
        assert_eq!(reopened.len(), 4096);
        assert_eq!(reopened.buffer().get_i64(128), 0x1234_5678);
    }

    #[test]
    fn delete_removes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.map");

        let mapped = MappedFile::create(&path, 1024).unwrap();
        assert!(path.exists());
        mapped.delete_file().unwrap();
        assert!(!path.exists());
    }
}
