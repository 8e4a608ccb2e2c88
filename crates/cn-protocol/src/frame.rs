//! UDP wire frames.
//!
//! Every frame starts with the common 8-byte header:
//!
//! ```text
//! 0................4........5........6................8
//! | frame length   | version| flags  | type (u16 LE)  |
//! ```
//!
//! All multi-byte fields are little-endian.  DATA frames are 32-byte
//! aligned within terms; PAD frames fill the unusable end of a term.
//! Control frames (SM/NAK/SETUP/RTT/ERR) travel at their natural length.
//!
//! Decoding borrows from the receive buffer; encoding writes into a
//! caller-provided slice or vec.  Nothing here allocates on the data path.

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;
pub const HDR_TYPE_NAK: u16 = 0x02;
pub const HDR_TYPE_SM: u16 = 0x03;
pub const HDR_TYPE_ERR: u16 = 0x04;
pub const HDR_TYPE_SETUP: u16 = 0x05;
pub const HDR_TYPE_RTTM: u16 = 0x06;
pub const HDR_TYPE_RES: u16 = 0x07;
pub const HDR_TYPE_ATS_DATA: u16 = 0x08;
pub const HDR_TYPE_ATS_SM: u16 = 0x09;
pub const HDR_TYPE_ATS_SETUP: u16 = 0x0A;
pub const HDR_TYPE_RSP_SETUP: u16 = 0x0B;
pub const HDR_TYPE_EXT: u16 = 0xFFFF;

/// Protocol version carried in every frame.
pub const CURRENT_VERSION: u8 = 0x0;

/// Alignment of frames within terms.
pub const FRAME_ALIGNMENT: usize = 32;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// First fragment of a message.
pub const BEGIN_FLAG: u8 = 0x80;
/// Last fragment of a message.
pub const END_FLAG: u8 = 0x40;
/// Publisher has ended the stream at this position.
pub const EOS_FLAG: u8 = 0x20;
/// Stream is part of a flow-control group.
pub const GROUP_FLAG: u8 = 0x10;
/// Publication was administratively revoked.
pub const REVOKED_FLAG: u8 = 0x08;
/// Single-fragment message.
pub const UNFRAGMENTED: u8 = BEGIN_FLAG | END_FLAG;

/// Status message flag asking the sender to (re)send SETUP.
pub const SEND_SETUP_FLAG: u8 = 0x80;
/// Status message flag carrying an appended group tag.
pub const GROUP_TAG_FLAG: u8 = 0x40;
/// RTT measurement flag distinguishing a reply from a request.
pub const RTT_REPLY_FLAG: u8 = 0x80;

// ---------------------------------------------------------------------------
// Common header
// ---------------------------------------------------------------------------

pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const HEADER_LENGTH: usize = 8;

/// Bytes of a DATA frame header preceding the payload.
pub const DATA_HEADER_LENGTH: usize = 32;

pub const MAX_ERROR_MESSAGE_LENGTH: usize = 1023;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes shorter than header")]
    TooShort(usize),
    #[error("unsupported frame version {0}")]
    BadVersion(u8),
    #[error("frame length {length} does not match datagram of {datagram} bytes")]
    LengthMismatch { length: i32, datagram: usize },
}

#[inline]
fn get_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

#[inline]
fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

#[inline]
fn put_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// The common frame header, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LENGTH {
            return Err(FrameError::TooShort(buf.len()));
        }
        let header = FrameHeader {
            frame_length: get_i32(buf, FRAME_LENGTH_OFFSET),
            version: buf[VERSION_OFFSET],
            flags: buf[FLAGS_OFFSET],
            frame_type: u16::from_le_bytes(buf[TYPE_OFFSET..TYPE_OFFSET + 2].try_into().unwrap()),
        };
        if header.version != CURRENT_VERSION {
            return Err(FrameError::BadVersion(header.version));
        }
        Ok(header)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_i32(buf, FRAME_LENGTH_OFFSET, self.frame_length);
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&self.frame_type.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// DATA / PAD
// ---------------------------------------------------------------------------

pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_VALUE_OFFSET: usize = 24;

/// DATA (and PAD) frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl DataHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::decode(buf)?;
        if buf.len() < DATA_HEADER_LENGTH {
            return Err(FrameError::TooShort(buf.len()));
        }
        Ok(DataHeader {
            frame_length: header.frame_length,
            flags: header.flags,
            frame_type: header.frame_type,
            term_offset: get_i32(buf, TERM_OFFSET_OFFSET),
            session_id: get_i32(buf, SESSION_ID_OFFSET),
            stream_id: get_i32(buf, STREAM_ID_OFFSET),
            term_id: get_i32(buf, TERM_ID_OFFSET),
            reserved_value: get_i64(buf, RESERVED_VALUE_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        FrameHeader {
            frame_length: self.frame_length,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: self.frame_type,
        }
        .encode(buf);
        put_i32(buf, TERM_OFFSET_OFFSET, self.term_offset);
        put_i32(buf, SESSION_ID_OFFSET, self.session_id);
        put_i32(buf, STREAM_ID_OFFSET, self.stream_id);
        put_i32(buf, TERM_ID_OFFSET, self.term_id);
        put_i64(buf, RESERVED_VALUE_OFFSET, self.reserved_value);
    }

    /// A heartbeat is a DATA frame with no payload.
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == HDR_TYPE_DATA && self.frame_length == DATA_HEADER_LENGTH as i32
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & EOS_FLAG != 0
    }
}

/// The 32-byte template header a publication writes at the front of every
/// frame in its log buffer.
pub fn default_data_header(session_id: i32, stream_id: i32, initial_term_id: i32) -> [u8; 32] {
    let mut template = [0u8; 32];
    DataHeader {
        frame_length: 0,
        flags: 0,
        frame_type: HDR_TYPE_DATA,
        term_offset: 0,
        session_id,
        stream_id,
        term_id: initial_term_id,
        reserved_value: 0,
    }
    .encode(&mut template);
    template
}

// ---------------------------------------------------------------------------
// SETUP
// ---------------------------------------------------------------------------

pub const SETUP_TERM_OFFSET_OFFSET: usize = 8;
pub const SETUP_SESSION_ID_OFFSET: usize = 12;
pub const SETUP_STREAM_ID_OFFSET: usize = 16;
pub const SETUP_INITIAL_TERM_ID_OFFSET: usize = 20;
pub const SETUP_ACTIVE_TERM_ID_OFFSET: usize = 24;
pub const SETUP_TERM_LENGTH_OFFSET: usize = 28;
pub const SETUP_MTU_OFFSET: usize = 32;
pub const SETUP_TTL_OFFSET: usize = 36;
pub const SETUP_FRAME_LENGTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupFrame {
    pub flags: u8,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_length: i32,
    pub mtu: i32,
    pub ttl: i32,
}

impl SetupFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::decode(buf)?;
        if buf.len() < SETUP_FRAME_LENGTH {
            return Err(FrameError::TooShort(buf.len()));
        }
        Ok(SetupFrame {
            flags: header.flags,
            term_offset: get_i32(buf, SETUP_TERM_OFFSET_OFFSET),
            session_id: get_i32(buf, SETUP_SESSION_ID_OFFSET),
            stream_id: get_i32(buf, SETUP_STREAM_ID_OFFSET),
            initial_term_id: get_i32(buf, SETUP_INITIAL_TERM_ID_OFFSET),
            active_term_id: get_i32(buf, SETUP_ACTIVE_TERM_ID_OFFSET),
            term_length: get_i32(buf, SETUP_TERM_LENGTH_OFFSET),
            mtu: get_i32(buf, SETUP_MTU_OFFSET),
            ttl: get_i32(buf, SETUP_TTL_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        FrameHeader {
            frame_length: SETUP_FRAME_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: HDR_TYPE_SETUP,
        }
        .encode(buf);
        put_i32(buf, SETUP_TERM_OFFSET_OFFSET, self.term_offset);
        put_i32(buf, SETUP_SESSION_ID_OFFSET, self.session_id);
        put_i32(buf, SETUP_STREAM_ID_OFFSET, self.stream_id);
        put_i32(buf, SETUP_INITIAL_TERM_ID_OFFSET, self.initial_term_id);
        put_i32(buf, SETUP_ACTIVE_TERM_ID_OFFSET, self.active_term_id);
        put_i32(buf, SETUP_TERM_LENGTH_OFFSET, self.term_length);
        put_i32(buf, SETUP_MTU_OFFSET, self.mtu);
        put_i32(buf, SETUP_TTL_OFFSET, self.ttl);
        SETUP_FRAME_LENGTH
    }
}

// ---------------------------------------------------------------------------
// Status message
// ---------------------------------------------------------------------------

pub const SM_SESSION_ID_OFFSET: usize = 8;
pub const SM_STREAM_ID_OFFSET: usize = 12;
pub const SM_CONSUMPTION_TERM_ID_OFFSET: usize = 16;
pub const SM_CONSUMPTION_TERM_OFFSET_OFFSET: usize = 20;
pub const SM_RECEIVER_WINDOW_OFFSET: usize = 24;
pub const SM_RECEIVER_ID_OFFSET: usize = 28;
pub const SM_FRAME_LENGTH: usize = 36;
pub const SM_GROUP_TAG_OFFSET: usize = 36;
pub const SM_FRAME_LENGTH_WITH_GROUP_TAG: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessage {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
    pub group_tag: Option<i64>,
}

impl StatusMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::decode(buf)?;
        if buf.len() < SM_FRAME_LENGTH {
            return Err(FrameError::TooShort(buf.len()));
        }
        let group_tag = if header.flags & GROUP_TAG_FLAG != 0 {
            if buf.len() < SM_FRAME_LENGTH_WITH_GROUP_TAG {
                return Err(FrameError::TooShort(buf.len()));
            }
            Some(get_i64(buf, SM_GROUP_TAG_OFFSET))
        } else {
            None
        };
        Ok(StatusMessage {
            flags: header.flags,
            session_id: get_i32(buf, SM_SESSION_ID_OFFSET),
            stream_id: get_i32(buf, SM_STREAM_ID_OFFSET),
            consumption_term_id: get_i32(buf, SM_CONSUMPTION_TERM_ID_OFFSET),
            consumption_term_offset: get_i32(buf, SM_CONSUMPTION_TERM_OFFSET_OFFSET),
            receiver_window: get_i32(buf, SM_RECEIVER_WINDOW_OFFSET),
            receiver_id: get_i64(buf, SM_RECEIVER_ID_OFFSET),
            group_tag,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let (length, flags) = match self.group_tag {
            Some(_) => (SM_FRAME_LENGTH_WITH_GROUP_TAG, self.flags | GROUP_TAG_FLAG),
            None => (SM_FRAME_LENGTH, self.flags),
        };
        FrameHeader {
            frame_length: length as i32,
            version: CURRENT_VERSION,
            flags,
            frame_type: HDR_TYPE_SM,
        }
        .encode(buf);
        put_i32(buf, SM_SESSION_ID_OFFSET, self.session_id);
        put_i32(buf, SM_STREAM_ID_OFFSET, self.stream_id);
        put_i32(buf, SM_CONSUMPTION_TERM_ID_OFFSET, self.consumption_term_id);
        put_i32(
            buf,
            SM_CONSUMPTION_TERM_OFFSET_OFFSET,
            self.consumption_term_offset,
        );
        put_i32(buf, SM_RECEIVER_WINDOW_OFFSET, self.receiver_window);
        put_i64(buf, SM_RECEIVER_ID_OFFSET, self.receiver_id);
        if let Some(tag) = self.group_tag {
            put_i64(buf, SM_GROUP_TAG_OFFSET, tag);
        }
        length
    }
}

// ---------------------------------------------------------------------------
// NAK
// ---------------------------------------------------------------------------

pub const NAK_SESSION_ID_OFFSET: usize = 8;
pub const NAK_STREAM_ID_OFFSET: usize = 12;
pub const NAK_TERM_ID_OFFSET: usize = 16;
pub const NAK_TERM_OFFSET_OFFSET: usize = 20;
pub const NAK_LENGTH_OFFSET: usize = 24;
pub const NAK_FRAME_LENGTH: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

impl NakFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        FrameHeader::decode(buf)?;
        if buf.len() < NAK_FRAME_LENGTH {
            return Err(FrameError::TooShort(buf.len()));
        }
        Ok(NakFrame {
            session_id: get_i32(buf, NAK_SESSION_ID_OFFSET),
            stream_id: get_i32(buf, NAK_STREAM_ID_OFFSET),
            term_id: get_i32(buf, NAK_TERM_ID_OFFSET),
            term_offset: get_i32(buf, NAK_TERM_OFFSET_OFFSET),
            length: get_i32(buf, NAK_LENGTH_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        FrameHeader {
            frame_length: NAK_FRAME_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: HDR_TYPE_NAK,
        }
        .encode(buf);
        put_i32(buf, NAK_SESSION_ID_OFFSET, self.session_id);
        put_i32(buf, NAK_STREAM_ID_OFFSET, self.stream_id);
        put_i32(buf, NAK_TERM_ID_OFFSET, self.term_id);
        put_i32(buf, NAK_TERM_OFFSET_OFFSET, self.term_offset);
        put_i32(buf, NAK_LENGTH_OFFSET, self.length);
        NAK_FRAME_LENGTH
    }
}

// ---------------------------------------------------------------------------
// RTT measurement
// ---------------------------------------------------------------------------

pub const RTT_SESSION_ID_OFFSET: usize = 8;
pub const RTT_STREAM_ID_OFFSET: usize = 12;
pub const RTT_ECHO_TIMESTAMP_OFFSET: usize = 16;
pub const RTT_RECEPTION_DELTA_OFFSET: usize = 24;
pub const RTT_RECEIVER_ID_OFFSET: usize = 32;
pub const RTT_FRAME_LENGTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttMeasurement {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub echo_timestamp_ns: i64,
    pub reception_delta_ns: i64,
    pub receiver_id: i64,
}

impl RttMeasurement {
    pub fn is_reply(&self) -> bool {
        self.flags & RTT_REPLY_FLAG != 0
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::decode(buf)?;
        if buf.len() < RTT_FRAME_LENGTH {
            return Err(FrameError::TooShort(buf.len()));
        }
        Ok(RttMeasurement {
            flags: header.flags,
            session_id: get_i32(buf, RTT_SESSION_ID_OFFSET),
            stream_id: get_i32(buf, RTT_STREAM_ID_OFFSET),
            echo_timestamp_ns: get_i64(buf, RTT_ECHO_TIMESTAMP_OFFSET),
            reception_delta_ns: get_i64(buf, RTT_RECEPTION_DELTA_OFFSET),
            receiver_id: get_i64(buf, RTT_RECEIVER_ID_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        FrameHeader {
            frame_length: RTT_FRAME_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: HDR_TYPE_RTTM,
        }
        .encode(buf);
        put_i32(buf, RTT_SESSION_ID_OFFSET, self.session_id);
        put_i32(buf, RTT_STREAM_ID_OFFSET, self.stream_id);
        put_i64(buf, RTT_ECHO_TIMESTAMP_OFFSET, self.echo_timestamp_ns);
        put_i64(buf, RTT_RECEPTION_DELTA_OFFSET, self.reception_delta_ns);
        put_i64(buf, RTT_RECEIVER_ID_OFFSET, self.receiver_id);
        RTT_FRAME_LENGTH
    }
}

// ---------------------------------------------------------------------------
// Error frame
// ---------------------------------------------------------------------------

pub const ERR_SESSION_ID_OFFSET: usize = 8;
pub const ERR_STREAM_ID_OFFSET: usize = 12;
pub const ERR_CODE_OFFSET: usize = 16;
pub const ERR_MESSAGE_LENGTH_OFFSET: usize = 20;
pub const ERR_MESSAGE_OFFSET: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub error_code: i32,
    pub message: String,
}

impl ErrorFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        FrameHeader::decode(buf)?;
        if buf.len() < ERR_MESSAGE_OFFSET {
            return Err(FrameError::TooShort(buf.len()));
        }
        let msg_len = (get_i32(buf, ERR_MESSAGE_LENGTH_OFFSET) as usize)
            .min(MAX_ERROR_MESSAGE_LENGTH)
            .min(buf.len() - ERR_MESSAGE_OFFSET);
        Ok(ErrorFrame {
            session_id: get_i32(buf, ERR_SESSION_ID_OFFSET),
            stream_id: get_i32(buf, ERR_STREAM_ID_OFFSET),
            error_code: get_i32(buf, ERR_CODE_OFFSET),
            message: String::from_utf8_lossy(&buf[ERR_MESSAGE_OFFSET..ERR_MESSAGE_OFFSET + msg_len])
                .into_owned(),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let msg = self.message.as_bytes();
        let msg_len = msg.len().min(MAX_ERROR_MESSAGE_LENGTH);
        let frame_length = ERR_MESSAGE_OFFSET + msg_len;
        FrameHeader {
            frame_length: frame_length as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: HDR_TYPE_ERR,
        }
        .encode(buf);
        put_i32(buf, ERR_SESSION_ID_OFFSET, self.session_id);
        put_i32(buf, ERR_STREAM_ID_OFFSET, self.stream_id);
        put_i32(buf, ERR_CODE_OFFSET, self.error_code);
        put_i32(buf, ERR_MESSAGE_LENGTH_OFFSET, msg_len as i32);
        buf[ERR_MESSAGE_OFFSET..ERR_MESSAGE_OFFSET + msg_len].copy_from_slice(&msg[..msg_len]);
        frame_length
    }
}
