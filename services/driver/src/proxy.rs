//! Inter-agent commands and the client event proxy.
//!
//! The Conductor drives the Sender and Receiver through bounded SPSC
//! queues; both agents post completions (and the Receiver posts image
//! creation requests) back through an unbounded MPSC task queue.  Commands
//! carry ownership: a `Box` moving through a queue transfers the resource
//! to the receiving agent, and back again on release.
//!
//! Threading modes only change where the agents run; the queues are used
//! in every mode so the ownership discipline stays uniform.

use std::net::SocketAddr;
use std::sync::Arc;

use cn_concurrent::broadcast::BroadcastTransmitter;
use cn_concurrent::queues::{CommandQueue, TaskQueue};
use cn_protocol::control;

use crate::image::PublicationImage;
use crate::media::receive_endpoint::ReceiveChannelEndpoint;
use crate::media::send_endpoint::SendChannelEndpoint;
use crate::media::udp_transport::UdpTransport;
use crate::publication::NetworkPublication;

/// Commands into the Sender.
pub enum SenderCmd {
    RegisterEndpoint(Box<SendChannelEndpoint>),
    CloseEndpoint { endpoint_id: usize },
    AddPublication(Box<NetworkPublication>),
    RemovePublication { registration_id: i64 },
    AddDestination { endpoint_id: usize, address: SocketAddr },
    RemoveDestination { endpoint_id: usize, address: SocketAddr },
}

/// Commands into the Receiver.
pub enum ReceiverCmd {
    RegisterEndpoint(Box<ReceiveChannelEndpoint>),
    CloseEndpoint { endpoint_id: usize },
    AddSubscription { endpoint_id: usize, stream_id: i32, session_id: Option<i32> },
    RemoveSubscription { endpoint_id: usize, stream_id: i32 },
    NewPublicationImage(Box<PublicationImage>),
    RemoveImage { correlation_id: i64 },
    AddDestination { endpoint_id: usize, transport: Arc<UdpTransport> },
    RemoveDestination { endpoint_id: usize, local_addr: SocketAddr },
}

/// Parameters the Receiver learned from a SETUP (or first DATA) frame.
#[derive(Debug, Clone)]
pub struct ImageCreationRequest {
    pub endpoint_id: usize,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_offset: i32,
    pub term_length: usize,
    pub mtu: usize,
    pub control_address: SocketAddr,
    pub source_identity: String,
}

/// Completions and requests flowing back to the Conductor.
pub enum ConductorCmd {
    CreatePublicationImage(ImageCreationRequest),
    ReleasePublication(Box<NetworkPublication>),
    ReleaseImage(Box<PublicationImage>),
    ReleaseSendEndpoint(Box<SendChannelEndpoint>),
    ReleaseReceiveEndpoint(Box<ReceiveChannelEndpoint>),
    RecordError(String),
}

/// Conductor-side handle to the Sender's queue.
pub struct SenderProxy {
    queue: Arc<CommandQueue<SenderCmd>>,
}

impl SenderProxy {
    pub fn new(queue: Arc<CommandQueue<SenderCmd>>) -> Self {
        SenderProxy { queue }
    }

    pub fn offer(&self, cmd: SenderCmd) -> Result<(), SenderCmd> {
        self.queue.offer(cmd)
    }

    pub fn remaining(&self) -> usize {
        self.queue.remaining()
    }
}

/// Conductor-side handle to the Receiver's queue.
pub struct ReceiverProxy {
    queue: Arc<CommandQueue<ReceiverCmd>>,
}

impl ReceiverProxy {
    pub fn new(queue: Arc<CommandQueue<ReceiverCmd>>) -> Self {
        ReceiverProxy { queue }
    }

    pub fn offer(&self, cmd: ReceiverCmd) -> Result<(), ReceiverCmd> {
        self.queue.offer(cmd)
    }

    pub fn remaining(&self) -> usize {
        self.queue.remaining()
    }
}

/// Agent-side handle to the Conductor's task queue.
#[derive(Clone)]
pub struct ConductorProxy {
    queue: Arc<TaskQueue<ConductorCmd>>,
}

impl ConductorProxy {
    pub fn new(queue: Arc<TaskQueue<ConductorCmd>>) -> Self {
        ConductorProxy { queue }
    }

    pub fn offer(&self, cmd: ConductorCmd) {
        self.queue.offer(cmd);
    }
}

// ---------------------------------------------------------------------------
// Client proxy
// ---------------------------------------------------------------------------

/// Encodes driver events onto the to-clients broadcast.
pub struct ClientProxy {
    transmitter: BroadcastTransmitter,
    scratch: Vec<u8>,
}

impl ClientProxy {
    pub fn new(transmitter: BroadcastTransmitter) -> Self {
        ClientProxy {
            transmitter,
            scratch: Vec::with_capacity(1024),
        }
    }

    fn transmit(&mut self, msg_type_id: i32) {
        // Broadcast laps slow clients rather than failing; an error here
        // means a message larger than the buffer, which is a bug upstream.
        let _ = self.transmitter.transmit(msg_type_id, &self.scratch);
    }

    pub fn on_error(&mut self, correlation_id: i64, code: cn_protocol::ErrorCode, message: &str) {
        self.scratch.clear();
        control::ErrorResponse {
            offending_correlation_id: correlation_id,
            error_code: code as i32,
            error_message: message.to_owned(),
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_ERROR);
    }

    pub fn on_operation_success(&mut self, correlation_id: i64) {
        self.scratch.clear();
        control::OperationSucceeded { correlation_id }.encode(&mut self.scratch);
        self.transmit(control::ON_OPERATION_SUCCESS);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_publication_ready(
        &mut self,
        correlation_id: i64,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        position_limit_counter_id: i32,
        channel_status_indicator_id: i32,
        log_file: &str,
        is_exclusive: bool,
    ) {
        self.scratch.clear();
        control::PublicationReady {
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            position_limit_counter_id,
            channel_status_indicator_id,
            log_file: log_file.to_owned(),
        }
        .encode(&mut self.scratch);
        let msg_type = if is_exclusive {
            control::ON_EXCLUSIVE_PUBLICATION_READY
        } else {
            control::ON_PUBLICATION_READY
        };
        self.transmit(msg_type);
    }

    pub fn on_subscription_ready(&mut self, correlation_id: i64, channel_status_indicator_id: i32) {
        self.scratch.clear();
        control::SubscriptionReady {
            correlation_id,
            channel_status_indicator_id,
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_SUBSCRIPTION_READY);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_available_image(
        &mut self,
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        subscriber_registration_id: i64,
        subscriber_position_id: i32,
        log_file: &str,
        source_identity: &str,
    ) {
        self.scratch.clear();
        control::ImageReady {
            correlation_id,
            session_id,
            stream_id,
            subscriber_registration_id,
            subscriber_position_id,
            log_file: log_file.to_owned(),
            source_identity: source_identity.to_owned(),
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_AVAILABLE_IMAGE);
    }

    pub fn on_unavailable_image(
        &mut self,
        correlation_id: i64,
        subscriber_registration_id: i64,
        stream_id: i32,
        channel: &str,
    ) {
        self.scratch.clear();
        control::ImageMessage {
            correlation_id,
            subscriber_registration_id,
            stream_id,
            channel: channel.to_owned(),
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_UNAVAILABLE_IMAGE);
    }

    pub fn on_counter_ready(&mut self, correlation_id: i64, counter_id: i32) {
        self.scratch.clear();
        control::CounterUpdate {
            correlation_id,
            counter_id,
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_COUNTER_READY);
    }

    pub fn on_static_counter(&mut self, correlation_id: i64, counter_id: i32) {
        self.scratch.clear();
        control::CounterUpdate {
            correlation_id,
            counter_id,
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_STATIC_COUNTER);
    }

    pub fn on_unavailable_counter(&mut self, correlation_id: i64, counter_id: i32) {
        self.scratch.clear();
        control::CounterUpdate {
            correlation_id,
            counter_id,
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_UNAVAILABLE_COUNTER);
    }

    pub fn on_client_timeout(&mut self, client_id: i64) {
        self.scratch.clear();
        control::ClientTimeout { client_id }.encode(&mut self.scratch);
        self.transmit(control::ON_CLIENT_TIMEOUT);
    }

    pub fn on_next_available_session_id(&mut self, correlation_id: i64, session_id: i32) {
        self.scratch.clear();
        control::NextSessionIdResponse {
            correlation_id,
            next_session_id: session_id,
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_NEXT_AVAILABLE_SESSION_ID);
    }

    pub fn on_channel_endpoint_error(&mut self, status_indicator_id: i64, message: &str) {
        self.scratch.clear();
        control::ErrorResponse {
            offending_correlation_id: status_indicator_id,
            error_code: cn_protocol::ErrorCode::ChannelEndpointError as i32,
            error_message: message.to_owned(),
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_CHANNEL_ENDPOINT_ERROR);
    }

    pub fn on_publication_error(
        &mut self,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        code: cn_protocol::ErrorCode,
        message: &str,
    ) {
        self.scratch.clear();
        control::PublicationErrorEvent {
            registration_id,
            session_id,
            stream_id,
            error_code: code as i32,
            error_message: message.to_owned(),
        }
        .encode(&mut self.scratch);
        self.transmit(control::ON_PUBLICATION_ERROR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::broadcast::{BroadcastReceiver, CopyBroadcastReceiver, TRAILER_LENGTH};
    use cn_concurrent::AlignedBuffer;

    #[test]
    fn events_round_trip_over_broadcast() {
        let mem = AlignedBuffer::with_capacity(64 * 1024 + TRAILER_LENGTH);
        let mut proxy = ClientProxy::new(BroadcastTransmitter::new(mem.buffer()).unwrap());
        let mut rx =
            CopyBroadcastReceiver::new(BroadcastReceiver::new(mem.buffer()).unwrap());

        proxy.on_operation_success(42);
        proxy.on_error(43, cn_protocol::ErrorCode::InvalidChannel, "bad channel");

        let mut seen = Vec::new();
        while rx
            .receive(|t, bytes| seen.push((t, bytes.to_vec())))
            .unwrap()
            > 0
        {}

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, control::ON_OPERATION_SUCCESS);
        let success = control::OperationSucceeded::decode(&seen[0].1).unwrap();
        assert_eq!(success.correlation_id, 42);

        assert_eq!(seen[1].0, control::ON_ERROR);
        let error = control::ErrorResponse::decode(&seen[1].1).unwrap();
        assert_eq!(error.offending_correlation_id, 43);
        assert_eq!(error.error_message, "bad channel");
    }
}
