//! Mapped raw log: the on-disk lifecycle of one stream's log buffer.
//!
//! File layout: three term partitions back to back, then a fixed-size
//! metadata section.  Publications and images each own one of these; the
//! same file is mapped by the driver and by every client process attached
//! to the stream.

use std::path::{Path, PathBuf};

use cn_concurrent::mapped::{MapError, MappedFile};
use cn_concurrent::AtomicBuffer;

use crate::{check_term_length, descriptor, LogBufferError, PARTITION_COUNT};

/// Fixed length of the metadata section at the end of every log file.
pub const LOG_META_DATA_SECTION_LENGTH: usize = 4096;

/// Total file length for a given term length.
pub fn compute_log_length(term_length: usize) -> usize {
    PARTITION_COUNT * term_length + LOG_META_DATA_SECTION_LENGTH
}

/// Recover the term length from a mapped file's length.
pub fn compute_term_length(log_length: usize) -> usize {
    (log_length - LOG_META_DATA_SECTION_LENGTH) / PARTITION_COUNT
}

#[derive(Debug, thiserror::Error)]
pub enum RawLogError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Layout(#[from] LogBufferError),
}

/// An owned mapping of one log buffer file.
pub struct MappedRawLog {
    mapped: MappedFile,
    term_length: usize,
}

impl MappedRawLog {
    /// Create a log file of `term_length` sized terms at `path`.
    pub fn create(path: &Path, term_length: usize) -> Result<Self, RawLogError> {
        check_term_length(term_length)?;
        let mapped = MappedFile::create(path, compute_log_length(term_length))?;
        Ok(MappedRawLog {
            mapped,
            term_length,
        })
    }

    /// Map an existing log file, recovering the term length from its size.
    pub fn open(path: &Path) -> Result<Self, RawLogError> {
        let mapped = MappedFile::open(path)?;
        let term_length = compute_term_length(mapped.len());
        check_term_length(term_length)?;
        Ok(MappedRawLog {
            mapped,
            term_length,
        })
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn path(&self) -> PathBuf {
        self.mapped.path().to_path_buf()
    }

    pub fn term_buffer(&self, index: usize) -> AtomicBuffer {
        debug_assert!(index < PARTITION_COUNT);
        self.mapped
            .buffer_at(index * self.term_length, self.term_length)
    }

    pub fn metadata_buffer(&self) -> AtomicBuffer {
        self.mapped.buffer_at(
            PARTITION_COUNT * self.term_length,
            LOG_META_DATA_SECTION_LENGTH,
        )
    }

    /// The term buffer holding the partition currently being appended.
    pub fn active_term_buffer(&self) -> AtomicBuffer {
        let meta = self.metadata_buffer();
        let index = descriptor::index_by_term_count(descriptor::active_term_count(&meta));
        self.term_buffer(index)
    }

    /// Touch every page so first appends do not fault.
    pub fn pre_touch(&self) {
        self.mapped.pre_touch();
    }

    /// Delete the backing file (mapping stays valid until drop).
    pub fn delete_file(&self) -> std::io::Result<()> {
        self.mapped.delete_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TERM_MIN_LENGTH;

    #[test]
    fn create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1001.logbuffer");

        let log = MappedRawLog::create(&path, TERM_MIN_LENGTH).unwrap();
        let meta = log.metadata_buffer();
        descriptor::initialize(&meta, 1001, 7, TERM_MIN_LENGTH, 4096, 1408, 100, 42);
        drop(log);

        let reopened = MappedRawLog::open(&path).unwrap();
        assert_eq!(reopened.term_length(), TERM_MIN_LENGTH);
        let meta = reopened.metadata_buffer();
        assert_eq!(descriptor::correlation_id(&meta), 1001);
        assert_eq!(descriptor::initial_term_id(&meta), 7);
    }

    #[test]
    fn rejects_invalid_term_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.logbuffer");
        assert!(MappedRawLog::create(&path, 1000).is_err());
    }

    #[test]
    fn term_buffers_are_distinct_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parts.logbuffer");
        let log = MappedRawLog::create(&path, TERM_MIN_LENGTH).unwrap();

        log.term_buffer(0).put_i32(0, 1);
        log.term_buffer(1).put_i32(0, 2);
        log.term_buffer(2).put_i32(0, 3);

        assert_eq!(log.term_buffer(0).get_i32(0), 1);
        assert_eq!(log.term_buffer(1).get_i32(0), 2);
        assert_eq!(log.term_buffer(2).get_i32(0), 3);
    }
}
