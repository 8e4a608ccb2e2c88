//! Receiver agent.
//!
//! Owns every publication image and receive channel endpoint.  Each duty
//! cycle: update the cached clock, drain Conductor commands, poll every
//! registered socket and dispatch datagrams by (session id, stream id),
//! then give each image its pending work (status messages, loss, RTT).
//!
//! Image creation is a handshake: a SETUP (or unknown-session DATA) frame
//! with subscriber interest produces a request to the Conductor, which
//! allocates the log and counters and hands back a ready image.  Repeats
//! are deduplicated by a pending-creation list with a timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use cn_concurrent::queues::CommandQueue;
use cn_concurrent::time::{CachedClock, NanoClock};
use cn_protocol::frame::{
    self, DataHeader, FrameHeader, RttMeasurement, SetupFrame,
};
use tracing::{debug, warn};

use crate::duty_cycle::DutyCycleTracker;
use crate::image::PublicationImage;
use crate::media::receive_endpoint::ReceiveChannelEndpoint;
use crate::proxy::{ConductorCmd, ConductorProxy, ImageCreationRequest, ReceiverCmd};
use crate::system_counters::SystemCounters;

const COMMAND_DRAIN_LIMIT: usize = 10;
const POLL_LIMIT: usize = 64;

struct PendingImage {
    endpoint_id: usize,
    session_id: i32,
    stream_id: i32,
    deadline_ns: i64,
}

pub struct Receiver {
    endpoints: Vec<Box<ReceiveChannelEndpoint>>,
    endpoint_index: HashMap<usize, usize>,
    images: Vec<Box<PublicationImage>>,
    pending_images: Vec<PendingImage>,
    commands: Arc<CommandQueue<ReceiverCmd>>,
    conductor: ConductorProxy,
    counters: Arc<SystemCounters>,
    nano_clock: Arc<NanoClock>,
    cached_clock: Arc<CachedClock>,
    duty_cycle: DutyCycleTracker,
    pending_setup_timeout_ns: i64,
    recv_buf: Vec<u8>,
}

impl Receiver {
    pub fn new(
        commands: Arc<CommandQueue<ReceiverCmd>>,
        conductor: ConductorProxy,
        counters: Arc<SystemCounters>,
        nano_clock: Arc<NanoClock>,
        cached_clock: Arc<CachedClock>,
        cycle_threshold_ns: i64,
        pending_setup_timeout_ns: i64,
    ) -> Self {
        Receiver {
            endpoints: Vec::new(),
            endpoint_index: HashMap::new(),
            images: Vec::new(),
            pending_images: Vec::new(),
            commands,
            conductor,
            counters,
            nano_clock,
            cached_clock,
            duty_cycle: DutyCycleTracker::new(cycle_threshold_ns),
            pending_setup_timeout_ns,
            recv_buf: vec![0u8; 64 * 1024],
        }
    }

    /// One duty cycle.  Returns the work count for the idle strategy.
    pub fn do_work(&mut self) -> usize {
        let now_ns = self.nano_clock.nanos();
        self.cached_clock.update(now_ns);
        self.duty_cycle.measure_and_update(now_ns);

        let mut work = self.drain_commands();
        work += self.poll_transports(now_ns);
        work += self.do_image_work(now_ns);
        self.expire_pending_images(now_ns);
        work
    }

    fn drain_commands(&mut self) -> usize {
        let mut work = 0;
        for _ in 0..COMMAND_DRAIN_LIMIT {
            let Some(cmd) = self.commands.poll() else { break };
            work += 1;
            match cmd {
                ReceiverCmd::RegisterEndpoint(endpoint) => {
                    debug!(endpoint = %endpoint.canonical_form, "receiver endpoint registered");
                    self.endpoint_index
                        .insert(endpoint.id, self.endpoints.len());
                    self.endpoints.push(endpoint);
                }
                ReceiverCmd::CloseEndpoint { endpoint_id } => {
                    if let Some(slot) = self.endpoint_index.remove(&endpoint_id) {
                        let endpoint = self.endpoints.swap_remove(slot);
                        endpoint.close();
                        self.reindex_endpoints();
                        self.conductor
                            .offer(ConductorCmd::ReleaseReceiveEndpoint(endpoint));
                    }
                }
                ReceiverCmd::AddSubscription {
                    endpoint_id,
                    stream_id,
                    session_id,
                } => {
                    if let Some(&slot) = self.endpoint_index.get(&endpoint_id) {
                        self.endpoints[slot].add_stream_interest(stream_id, session_id);
                    }
                }
                ReceiverCmd::RemoveSubscription {
                    endpoint_id,
                    stream_id,
                } => {
                    if let Some(&slot) = self.endpoint_index.get(&endpoint_id) {
                        self.endpoints[slot].remove_stream_interest(stream_id);
                    }
                }
                ReceiverCmd::NewPublicationImage(image) => {
                    debug!(
                        correlation_id = image.correlation_id,
                        session_id = image.session_id,
                        stream_id = image.stream_id,
                        "image activated"
                    );
                    self.pending_images.retain(|p| {
                        !(p.endpoint_id == image.endpoint_id
                            && p.session_id == image.session_id
                            && p.stream_id == image.stream_id)
                    });
                    self.images.push(image);
                }
                ReceiverCmd::RemoveImage { correlation_id } => {
                    if let Some(slot) = self
                        .images
                        .iter()
                        .position(|i| i.correlation_id == correlation_id)
                    {
                        let image = self.images.swap_remove(slot);
                        self.conductor.offer(ConductorCmd::ReleaseImage(image));
                    }
                }
                ReceiverCmd::AddDestination {
                    endpoint_id,
                    transport,
                } => {
                    if let Some(&slot) = self.endpoint_index.get(&endpoint_id) {
                        self.endpoints[slot].add_destination(transport);
                    }
                }
                ReceiverCmd::RemoveDestination {
                    endpoint_id,
                    local_addr,
                } => {
                    if let Some(&slot) = self.endpoint_index.get(&endpoint_id) {
                        self.endpoints[slot].remove_destination(local_addr);
                    }
                }
            }
        }
        work
    }

    fn reindex_endpoints(&mut self) {
        self.endpoint_index.clear();
        for (slot, endpoint) in self.endpoints.iter().enumerate() {
            self.endpoint_index.insert(endpoint.id, slot);
        }
    }

    fn poll_transports(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        for endpoint_slot in 0..self.endpoints.len() {
            let transport_count = self.endpoints[endpoint_slot].transports().len();
            for transport_slot in 0..transport_count {
                for _ in 0..POLL_LIMIT {
                    let endpoint = &self.endpoints[endpoint_slot];
                    let transport = &endpoint.transports()[transport_slot];
                    match transport.recv_from(&mut self.recv_buf) {
                        Ok(Some((length, src))) => {
                            work += 1;
                            self.dispatch_datagram(endpoint_slot, length, src, now_ns);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "receive endpoint socket failed");
                            self.counters.errors.increment();
                            break;
                        }
                    }
                }
            }
        }
        work
    }

    fn dispatch_datagram(
        &mut self,
        endpoint_slot: usize,
        length: usize,
        src: SocketAddr,
        now_ns: i64,
    ) {
        let header = match FrameHeader::decode(&self.recv_buf[..length]) {
            Ok(header) => header,
            Err(e) => {
                self.counters.invalid_packets.increment();
                debug!(error = %e, "dropping malformed datagram");
                return;
            }
        };

        match header.frame_type {
            frame::HDR_TYPE_DATA | frame::HDR_TYPE_PAD => {
                self.on_data(endpoint_slot, length, src, now_ns);
            }
            frame::HDR_TYPE_SETUP => {
                self.on_setup(endpoint_slot, length, src, now_ns);
            }
            frame::HDR_TYPE_RTTM => {
                let Ok(rtt) = RttMeasurement::decode(&self.recv_buf[..length]) else {
                    self.counters.invalid_packets.increment();
                    return;
                };
                if rtt.is_reply() {
                    let endpoint_id = self.endpoints[endpoint_slot].id;
                    if let Some(image) =
                        find_image(&mut self.images, endpoint_id, rtt.session_id, rtt.stream_id)
                    {
                        image.on_rtt_reply(&rtt, src, now_ns);
                    }
                }
            }
            _ => {
                self.counters.invalid_packets.increment();
            }
        }
    }

    fn on_data(&mut self, endpoint_slot: usize, length: usize, src: SocketAddr, now_ns: i64) {
        let header = match DataHeader::decode(&self.recv_buf[..length]) {
            Ok(header) => header,
            Err(_) => {
                self.counters.invalid_packets.increment();
                return;
            }
        };

        let endpoint_id = self.endpoints[endpoint_slot].id;
        if let Some(image) =
            find_image(&mut self.images, endpoint_id, header.session_id, header.stream_id)
        {
            image.on_data(&header, &self.recv_buf[..length], now_ns, &self.counters);
            return;
        }

        // Unknown session with subscriber interest: ask the sender for a
        // SETUP rather than guessing stream parameters from the frame.
        // The image is created when the SETUP arrives, joined at the
        // sender's stated position.
        let endpoint = &self.endpoints[endpoint_slot];
        if endpoint.has_interest_in(header.stream_id, header.session_id) {
            self.elicit_setup(endpoint_slot, &header, src, now_ns);
        }
    }

    /// Send a status message with the send-setup flag toward an unknown
    /// session's source, rate-limited through the pending list.
    fn elicit_setup(
        &mut self,
        endpoint_slot: usize,
        header: &DataHeader,
        src: SocketAddr,
        now_ns: i64,
    ) {
        let endpoint_id = self.endpoints[endpoint_slot].id;
        let already_pending = self.pending_images.iter().any(|p| {
            p.endpoint_id == endpoint_id
                && p.session_id == header.session_id
                && p.stream_id == header.stream_id
        });
        if already_pending {
            return;
        }

        let endpoint = &self.endpoints[endpoint_slot];
        let sm = frame::StatusMessage {
            flags: frame::SEND_SETUP_FLAG,
            session_id: header.session_id,
            stream_id: header.stream_id,
            consumption_term_id: header.term_id,
            consumption_term_offset: header.term_offset,
            receiver_window: 0,
            receiver_id: endpoint.receiver_id,
            group_tag: None,
        };
        let mut buf = [0u8; frame::SM_FRAME_LENGTH_WITH_GROUP_TAG];
        let length = sm.encode(&mut buf);
        if endpoint.send_to(&buf[..length], src).is_ok() {
            debug!(
                session_id = header.session_id,
                stream_id = header.stream_id,
                "eliciting setup from unknown session"
            );
            self.pending_images.push(PendingImage {
                endpoint_id,
                session_id: header.session_id,
                stream_id: header.stream_id,
                deadline_ns: now_ns + self.pending_setup_timeout_ns,
            });
        }
    }

    fn on_setup(&mut self, endpoint_slot: usize, length: usize, src: SocketAddr, now_ns: i64) {
        let setup = match SetupFrame::decode(&self.recv_buf[..length]) {
            Ok(setup) => setup,
            Err(_) => {
                self.counters.invalid_packets.increment();
                return;
            }
        };

        let endpoint_id = self.endpoints[endpoint_slot].id;
        if let Some(image) =
            find_image(&mut self.images, endpoint_id, setup.session_id, setup.stream_id)
        {
            image.on_setup(setup.term_length as usize, now_ns, &self.counters);
            return;
        }

        let endpoint = &self.endpoints[endpoint_slot];
        if endpoint.has_interest_in(setup.stream_id, setup.session_id) {
            self.elicit_image(
                endpoint_slot,
                setup.session_id,
                setup.stream_id,
                setup.initial_term_id,
                setup.active_term_id,
                setup.term_offset,
                setup.term_length as usize,
                setup.mtu as usize,
                src,
                now_ns,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn elicit_image(
        &mut self,
        endpoint_slot: usize,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: usize,
        mtu: usize,
        src: SocketAddr,
        now_ns: i64,
    ) {
        let endpoint_id = self.endpoints[endpoint_slot].id;
        let already_pending = self.pending_images.iter().any(|p| {
            p.endpoint_id == endpoint_id && p.session_id == session_id && p.stream_id == stream_id
        });
        if already_pending {
            return;
        }

        debug!(session_id, stream_id, source = %src, "eliciting image creation");
        self.pending_images.push(PendingImage {
            endpoint_id,
            session_id,
            stream_id,
            deadline_ns: now_ns + self.pending_setup_timeout_ns,
        });
        self.conductor
            .offer(ConductorCmd::CreatePublicationImage(ImageCreationRequest {
                endpoint_id,
                session_id,
                stream_id,
                initial_term_id,
                active_term_id,
                term_offset,
                term_length,
                mtu,
                control_address: src,
                source_identity: src.to_string(),
            }));
    }

    fn do_image_work(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        for image in &mut self.images {
            let Some(&endpoint_slot) = self.endpoint_index.get(&image.endpoint_id) else {
                continue;
            };
            let endpoint = &self.endpoints[endpoint_slot];
            work += image.send_pending_status_message(endpoint, now_ns, &self.counters);
            work += image.process_pending_loss(endpoint, now_ns, &self.counters);
            work += image.send_pending_rtt(endpoint, now_ns);
        }
        work
    }

    /// Expired pending creations are dropped so a later SETUP can retry.
    fn expire_pending_images(&mut self, now_ns: i64) {
        self.pending_images.retain(|p| now_ns < p.deadline_ns);
    }
}

fn find_image<'a>(
    images: &'a mut [Box<PublicationImage>],
    endpoint_id: usize,
    session_id: i32,
    stream_id: i32,
) -> Option<&'a mut Box<PublicationImage>> {
    images.iter_mut().find(|i| {
        i.endpoint_id == endpoint_id && i.session_id == session_id && i.stream_id == stream_id
    })
}
