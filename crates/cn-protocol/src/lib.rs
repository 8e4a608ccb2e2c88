//! Protocol definitions for the conduit media driver.
//!
//! Three layers share this crate:
//! - [`frame`]: the UDP wire frames (DATA/SETUP/SM/NAK/RTT/ERR/PAD/RES),
//!   fixed little-endian layouts, version byte 0x0.
//! - [`control`]: the shared-memory client control protocol: commands into
//!   the to-driver ring, events out over the to-clients broadcast.
//! - [`uri`]: channel URIs (`aeron:udp?...` / `aeron:ipc?...`) and their
//!   canonical forms.

pub mod control;
pub mod error_codes;
pub mod frame;
pub mod uri;

pub use error_codes::ErrorCode;
pub use uri::ChannelUri;
