//! The command-and-control (`cnc.dat`) file.
//!
//! One per driver instance directory.  Clients map it to reach the
//! to-driver ring, the to-clients broadcast, the counters regions, and the
//! error log.  A fixed metadata header leads the file:
//!
//! ```text
//! 0        4        8        12       16       20       24       32   40   48
//! | version| ring   | bcast  | cntr md| cntr v | errlog | liveness| ts | pid| page |
//! ```
//!
//! followed (cache-line aligned) by the five sections in that order.  The
//! version is semantic: clients with a different major must refuse to
//! attach.

use std::path::{Path, PathBuf};

use crate::buffer::AtomicBuffer;
use crate::mapped::{MapError, MappedFile};
use crate::{align, broadcast, ring_buffer, CACHE_LINE_LENGTH};

/// File name within the driver directory.
pub const CNC_FILE_NAME: &str = "cnc.dat";

const VERSION_OFFSET: usize = 0;
const TO_DRIVER_LENGTH_OFFSET: usize = 4;
const TO_CLIENTS_LENGTH_OFFSET: usize = 8;
const COUNTERS_METADATA_LENGTH_OFFSET: usize = 12;
const COUNTERS_VALUES_LENGTH_OFFSET: usize = 16;
const ERROR_LOG_LENGTH_OFFSET: usize = 20;
const CLIENT_LIVENESS_TIMEOUT_OFFSET: usize = 24;
const START_TIMESTAMP_OFFSET: usize = 32;
const PID_OFFSET: usize = 40;
const FILE_PAGE_SIZE_OFFSET: usize = 48;

/// Bytes of header before the first section.
pub const END_OF_METADATA: usize = CACHE_LINE_LENGTH;

/// Compose a semantic version into its on-disk form.
pub const fn semantic_version(major: u8, minor: u8, patch: u8) -> i32 {
    ((major as i32) << 16) | ((minor as i32) << 8) | (patch as i32)
}

pub const fn semantic_version_major(version: i32) -> u8 {
    ((version >> 16) & 0xFF) as u8
}

/// Current cnc file version.
pub const CNC_VERSION: i32 = semantic_version(0, 10, 0);

#[derive(Debug, thiserror::Error)]
pub enum CncError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("cnc version {actual:#x} incompatible with {expected:#x} (major must match)")]
    IncompatibleVersion { actual: i32, expected: i32 },
    #[error("cnc file truncated: {0} bytes")]
    Truncated(usize),
}

/// Section lengths used to create a cnc file.
#[derive(Debug, Clone, Copy)]
pub struct CncLayout {
    pub to_driver_length: usize,
    pub to_clients_length: usize,
    pub counters_metadata_length: usize,
    pub counters_values_length: usize,
    pub error_log_length: usize,
}

impl CncLayout {
    pub fn total_file_length(&self) -> usize {
        END_OF_METADATA
            + self.to_driver_length
            + self.to_clients_length
            + self.counters_metadata_length
            + self.counters_values_length
            + self.error_log_length
    }
}

/// A mapped cnc file with resolved section offsets.
pub struct CncFile {
    mapped: MappedFile,
    layout: CncLayout,
}

impl CncFile {
    /// Create and initialize a new cnc file in `dir`.
    ///
    /// `to_driver_length` and `to_clients_length` must include their ring /
    /// broadcast trailers.
    pub fn create(
        dir: &Path,
        layout: CncLayout,
        client_liveness_timeout_ns: i64,
        start_timestamp_ms: i64,
        file_page_size: usize,
    ) -> Result<Self, CncError> {
        debug_assert!(crate::is_power_of_two(
            layout.to_driver_length - ring_buffer::TRAILER_LENGTH
        ));
        debug_assert!(crate::is_power_of_two(
            layout.to_clients_length - broadcast::TRAILER_LENGTH
        ));

        let path = dir.join(CNC_FILE_NAME);
        let total = align(layout.total_file_length(), file_page_size);
        let mapped = MappedFile::create(&path, total)?;

        let buf = mapped.buffer();
        buf.put_i32(TO_DRIVER_LENGTH_OFFSET, layout.to_driver_length as i32);
        buf.put_i32(TO_CLIENTS_LENGTH_OFFSET, layout.to_clients_length as i32);
        buf.put_i32(
            COUNTERS_METADATA_LENGTH_OFFSET,
            layout.counters_metadata_length as i32,
        );
        buf.put_i32(
            COUNTERS_VALUES_LENGTH_OFFSET,
            layout.counters_values_length as i32,
        );
        buf.put_i32(ERROR_LOG_LENGTH_OFFSET, layout.error_log_length as i32);
        buf.put_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET, client_liveness_timeout_ns);
        buf.put_i64(START_TIMESTAMP_OFFSET, start_timestamp_ms);
        buf.put_i64(PID_OFFSET, std::process::id() as i64);
        buf.put_i32(FILE_PAGE_SIZE_OFFSET, file_page_size as i32);
        // Version last: attaching clients spin until it appears.
        buf.put_i32_ordered(VERSION_OFFSET, CNC_VERSION);

        Ok(CncFile { mapped, layout })
    }

    /// Map an existing cnc file and validate its version.
    pub fn open(dir: &Path) -> Result<Self, CncError> {
        let path = dir.join(CNC_FILE_NAME);
        let mapped = MappedFile::open(&path)?;
        if mapped.len() < END_OF_METADATA {
            return Err(CncError::Truncated(mapped.len()));
        }

        let buf = mapped.buffer();
        let version = buf.get_i32_volatile(VERSION_OFFSET);
        if semantic_version_major(version) != semantic_version_major(CNC_VERSION) {
            return Err(CncError::IncompatibleVersion {
                actual: version,
                expected: CNC_VERSION,
            });
        }

        let layout = CncLayout {
            to_driver_length: buf.get_i32(TO_DRIVER_LENGTH_OFFSET) as usize,
            to_clients_length: buf.get_i32(TO_CLIENTS_LENGTH_OFFSET) as usize,
            counters_metadata_length: buf.get_i32(COUNTERS_METADATA_LENGTH_OFFSET) as usize,
            counters_values_length: buf.get_i32(COUNTERS_VALUES_LENGTH_OFFSET) as usize,
            error_log_length: buf.get_i32(ERROR_LOG_LENGTH_OFFSET) as usize,
        };
        if mapped.len() < layout.total_file_length() {
            return Err(CncError::Truncated(mapped.len()));
        }

        Ok(CncFile { mapped, layout })
    }

    pub fn path(&self) -> PathBuf {
        self.mapped.path().to_path_buf()
    }

    pub fn client_liveness_timeout_ns(&self) -> i64 {
        self.mapped.buffer().get_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET)
    }

    pub fn start_timestamp_ms(&self) -> i64 {
        self.mapped.buffer().get_i64(START_TIMESTAMP_OFFSET)
    }

    pub fn pid(&self) -> i64 {
        self.mapped.buffer().get_i64(PID_OFFSET)
    }

    pub fn to_driver_buffer(&self) -> AtomicBuffer {
        self.mapped
            .buffer_at(END_OF_METADATA, self.layout.to_driver_length)
    }

    pub fn to_clients_buffer(&self) -> AtomicBuffer {
        let offset = END_OF_METADATA + self.layout.to_driver_length;
        self.mapped.buffer_at(offset, self.layout.to_clients_length)
    }

    pub fn counters_metadata_buffer(&self) -> AtomicBuffer {
        let offset =
            END_OF_METADATA + self.layout.to_driver_length + self.layout.to_clients_length;
        self.mapped
            .buffer_at(offset, self.layout.counters_metadata_length)
    }

    pub fn counters_values_buffer(&self) -> AtomicBuffer {
        let offset = END_OF_METADATA
            + self.layout.to_driver_length
            + self.layout.to_clients_length
            + self.layout.counters_metadata_length;
        self.mapped
            .buffer_at(offset, self.layout.counters_values_length)
    }

    pub fn error_log_buffer(&self) -> AtomicBuffer {
        let offset = END_OF_METADATA
            + self.layout.to_driver_length
            + self.layout.to_clients_length
            + self.layout.counters_metadata_length
            + self.layout.counters_values_length;
        self.mapped.buffer_at(offset, self.layout.error_log_length)
    }
}

/// `true` if a driver appears to be running in `dir`: a cnc file exists and
/// its to-driver consumer heartbeat is fresher than `timeout_ms`.
pub fn is_driver_active(dir: &Path, now_ms: i64, timeout_ms: i64) -> bool {
    let Ok(cnc) = CncFile::open(dir) else {
        return false;
    };
    let Ok(ring) = ring_buffer::ManyToOneRingBuffer::new(cnc.to_driver_buffer()) else {
        return false;
    };
    let heartbeat = ring.consumer_heartbeat_time_ms();
    heartbeat > 0 && now_ms - heartbeat <= timeout_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{METADATA_LENGTH, VALUE_LENGTH};

    fn test_layout() -> CncLayout {
        CncLayout {
            to_driver_length: 64 * 1024 + ring_buffer::TRAILER_LENGTH,
            to_clients_length: 64 * 1024 + broadcast::TRAILER_LENGTH,
            counters_metadata_length: METADATA_LENGTH * 64,
            counters_values_length: VALUE_LENGTH * 64,
            error_log_length: 8192,
        }
    }

    #[test]
    fn create_then_open_resolves_same_sections() {
        let dir = tempfile::tempdir().unwrap();
        let created = CncFile::create(dir.path(), test_layout(), 5_000_000_000, 1234, 4096).unwrap();
        created.to_driver_buffer().put_i64(256, 777);
        drop(created);

        let opened = CncFile::open(dir.path()).unwrap();
        assert_eq!(opened.client_liveness_timeout_ns(), 5_000_000_000);
        assert_eq!(opened.start_timestamp_ms(), 1234);
        assert_eq!(opened.to_driver_buffer().get_i64(256), 777);
        assert_eq!(opened.error_log_buffer().capacity(), 8192);
    }

    #[test]
    fn driver_activity_follows_heartbeat_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let cnc = CncFile::create(dir.path(), test_layout(), 5_000_000_000, 0, 4096).unwrap();
        let ring = ring_buffer::ManyToOneRingBuffer::new(cnc.to_driver_buffer()).unwrap();

        assert!(!is_driver_active(dir.path(), 10_000, 1_000));

        ring.update_consumer_heartbeat(9_500);
        assert!(is_driver_active(dir.path(), 10_000, 1_000));
        assert!(!is_driver_active(dir.path(), 20_000, 1_000));
    }
}
