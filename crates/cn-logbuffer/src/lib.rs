//! Term-partitioned log buffers.
//!
//! A log buffer holds one stream: three equal-sized term partitions plus a
//! metadata section, memory-mapped by every process touching the stream.
//! Publishers append to the active term with a lock-free tail fetch-add;
//! subscribers scan committed frames with acquire reads of the frame
//! length.  When a term fills, appenders rotate to the next partition and
//! the retired term stays available for lagging consumers and retransmits
//! until the rotation comes around again.

pub mod descriptor;
pub mod frame_descriptor;
pub mod log;
pub mod term_appender;
pub mod term_gap_scanner;
pub mod term_reader;
pub mod term_rebuilder;
pub mod term_scanner;
pub mod term_unblocker;

pub use log::MappedRawLog;

/// Number of term partitions per log.
pub const PARTITION_COUNT: usize = 3;

/// Minimum term length: 64 KiB.
pub const TERM_MIN_LENGTH: usize = 64 * 1024;

/// Maximum term length: 1 GiB.
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Minimum page size for log files.
pub const PAGE_MIN_SIZE: usize = 4 * 1024;

/// Maximum page size for log files.
pub const PAGE_MAX_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogBufferError {
    #[error("term length {0} must be a power of two in [{TERM_MIN_LENGTH}, {TERM_MAX_LENGTH}]")]
    InvalidTermLength(usize),
    #[error("page size {0} must be a power of two in [{PAGE_MIN_SIZE}, {PAGE_MAX_SIZE}]")]
    InvalidPageSize(usize),
}

/// Validate a term length against the protocol bounds.
pub fn check_term_length(term_length: usize) -> Result<(), LogBufferError> {
    if term_length < TERM_MIN_LENGTH
        || term_length > TERM_MAX_LENGTH
        || !cn_concurrent::is_power_of_two(term_length)
    {
        return Err(LogBufferError::InvalidTermLength(term_length));
    }
    Ok(())
}

/// Validate a page size against the protocol bounds.
pub fn check_page_size(page_size: usize) -> Result<(), LogBufferError> {
    if page_size < PAGE_MIN_SIZE
        || page_size > PAGE_MAX_SIZE
        || !cn_concurrent::is_power_of_two(page_size)
    {
        return Err(LogBufferError::InvalidPageSize(page_size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_length_bounds() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(1024 * 1024 * 1024).is_ok());
        assert!(check_term_length(32 * 1024).is_err());
        assert!(check_term_length(96 * 1024).is_err());
        assert!(check_term_length(2 * 1024 * 1024 * 1024).is_err());
    }
}
