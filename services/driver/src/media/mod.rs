//! The media layer: UDP channels, sockets, and the send/receive endpoints
//! that multiplex streams onto them.

pub mod receive_endpoint;
pub mod send_endpoint;
pub mod udp_channel;
pub mod udp_transport;

pub use udp_channel::UdpChannel;
pub use udp_transport::UdpTransport;
