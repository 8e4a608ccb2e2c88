//! The conduit media driver.
//!
//! A long-running process multiplexing publisher and subscriber streams
//! over UDP and shared-memory IPC on behalf of local clients.  Three
//! single-threaded agents cooperate: the Conductor owns all bookkeeping,
//! the Sender walks publication log buffers onto the wire, and the
//! Receiver rebuilds inbound streams into image log buffers.

pub mod conductor;
pub mod config;
pub mod congestion;
pub mod context;
pub mod driver;
pub mod duty_cycle;
pub mod error;
pub mod flow_control;
pub mod image;
pub mod ipc_publication;
pub mod loss_detector;
pub mod loss_report;
pub mod media;
pub mod name_resolver;
pub mod proxy;
pub mod publication;
pub mod receiver;
pub mod retransmit;
pub mod sender;
pub mod system_counters;

pub use config::{DriverConfig, ThreadingMode};
pub use driver::{DriverAgents, MediaDriver};
pub use error::DriverError;
