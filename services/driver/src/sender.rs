//! Sender agent.
//!
//! Owns every network publication and send channel endpoint.  Each duty
//! cycle: update the cached clock, drain Conductor commands, give every
//! publication a round-robin send pass, and poll each endpoint socket for
//! SM / NAK / RTT / ERR frames flowing back from receivers.

use std::collections::HashMap;
use std::sync::Arc;

use cn_concurrent::queues::CommandQueue;
use cn_concurrent::time::{CachedClock, NanoClock};
use cn_protocol::frame::{
    self, FrameHeader, NakFrame, RttMeasurement, StatusMessage,
};
use tracing::{debug, warn};

use crate::duty_cycle::DutyCycleTracker;
use crate::media::send_endpoint::SendChannelEndpoint;
use crate::proxy::{ConductorCmd, ConductorProxy, SenderCmd};
use crate::publication::NetworkPublication;
use crate::system_counters::SystemCounters;

/// Commands drained from the Conductor per duty cycle.
const COMMAND_DRAIN_LIMIT: usize = 10;
/// Datagrams polled per endpoint per duty cycle.
const POLL_LIMIT: usize = 32;

pub struct Sender {
    publications: Vec<Box<NetworkPublication>>,
    endpoints: Vec<Box<SendChannelEndpoint>>,
    endpoint_index: HashMap<usize, usize>,
    commands: Arc<CommandQueue<SenderCmd>>,
    conductor: ConductorProxy,
    counters: Arc<SystemCounters>,
    nano_clock: Arc<NanoClock>,
    cached_clock: Arc<CachedClock>,
    duty_cycle: DutyCycleTracker,
    round_robin: usize,
    recv_buf: Vec<u8>,
}

impl Sender {
    pub fn new(
        commands: Arc<CommandQueue<SenderCmd>>,
        conductor: ConductorProxy,
        counters: Arc<SystemCounters>,
        nano_clock: Arc<NanoClock>,
        cached_clock: Arc<CachedClock>,
        cycle_threshold_ns: i64,
    ) -> Self {
        Sender {
            publications: Vec::new(),
            endpoints: Vec::new(),
            endpoint_index: HashMap::new(),
            commands,
            conductor,
            counters,
            nano_clock,
            cached_clock,
            duty_cycle: DutyCycleTracker::new(cycle_threshold_ns),
            round_robin: 0,
            recv_buf: vec![0u8; 64 * 1024],
        }
    }

    /// One duty cycle.  Returns the work count for the idle strategy.
    pub fn do_work(&mut self) -> usize {
        let now_ns = self.nano_clock.nanos();
        self.cached_clock.update(now_ns);
        self.duty_cycle.measure_and_update(now_ns);

        let mut work = self.drain_commands();
        work += self.poll_endpoints(now_ns);
        work += self.do_send(now_ns);
        work
    }

    fn drain_commands(&mut self) -> usize {
        let mut work = 0;
        for _ in 0..COMMAND_DRAIN_LIMIT {
            let Some(cmd) = self.commands.poll() else { break };
            work += 1;
            match cmd {
                SenderCmd::RegisterEndpoint(endpoint) => {
                    debug!(endpoint = %endpoint.canonical_form, "sender endpoint registered");
                    self.endpoint_index
                        .insert(endpoint.id, self.endpoints.len());
                    self.endpoints.push(endpoint);
                }
                SenderCmd::CloseEndpoint { endpoint_id } => {
                    if let Some(slot) = self.endpoint_index.remove(&endpoint_id) {
                        let endpoint = self.endpoints.swap_remove(slot);
                        endpoint.close();
                        self.reindex_endpoints();
                        self.conductor
                            .offer(ConductorCmd::ReleaseSendEndpoint(endpoint));
                    }
                }
                SenderCmd::AddPublication(publication) => {
                    debug!(
                        registration_id = publication.registration_id,
                        session_id = publication.session_id,
                        stream_id = publication.stream_id,
                        "sender publication added"
                    );
                    self.publications.push(publication);
                }
                SenderCmd::RemovePublication { registration_id } => {
                    if let Some(slot) = self
                        .publications
                        .iter()
                        .position(|p| p.registration_id == registration_id)
                    {
                        let publication = self.publications.swap_remove(slot);
                        self.conductor
                            .offer(ConductorCmd::ReleasePublication(publication));
                    }
                }
                SenderCmd::AddDestination {
                    endpoint_id,
                    address,
                } => {
                    if let Some(&slot) = self.endpoint_index.get(&endpoint_id) {
                        self.endpoints[slot].add_destination(address);
                    }
                }
                SenderCmd::RemoveDestination {
                    endpoint_id,
                    address,
                } => {
                    if let Some(&slot) = self.endpoint_index.get(&endpoint_id) {
                        self.endpoints[slot].remove_destination(address);
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

    fn do_send(&mut self, now_ns: i64) -> usize {
        let count = self.publications.len();
        if count == 0 {
            return 0;
        }
        // Rotate the starting publication so none is starved.
        self.round_robin = (self.round_robin + 1) % count;
        let mut bytes = 0;
        for i in 0..count {
            let slot = (self.round_robin + i) % count;
            let publication = &mut self.publications[slot];
            let Some(&endpoint_slot) = self.endpoint_index.get(&publication.endpoint_id) else {
                continue;
            };
            bytes += publication.send(&self.endpoints[endpoint_slot], now_ns, &self.counters);
        }
        bytes
    }

    fn poll_endpoints(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        for endpoint_slot in 0..self.endpoints.len() {
            for _ in 0..POLL_LIMIT {
                let endpoint = &self.endpoints[endpoint_slot];
                let received = match endpoint.receive(&mut self.recv_buf) {
                    Ok(Some((length, src))) => (length, src),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(endpoint = %endpoint.canonical_form, error = %e, "send endpoint receive failed");
                        self.counters.errors.increment();
                        break;
                    }
                };
                work += 1;
                let (length, src) = received;
                let endpoint_id = endpoint.id;
                self.dispatch_control_frame(endpoint_slot, endpoint_id, length, src, now_ns);
            }
        }
        work
    }

    fn dispatch_control_frame(
        &mut self,
        endpoint_slot: usize,
        endpoint_id: usize,
        length: usize,
        src: std::net::SocketAddr,
        now_ns: i64,
    ) {
        let buf = &self.recv_buf[..length];
        let header = match FrameHeader::decode(buf) {
            Ok(header) => header,
            Err(e) => {
                self.counters.invalid_packets.increment();
                debug!(error = %e, "dropping malformed control frame");
                return;
            }
        };

        match header.frame_type {
            frame::HDR_TYPE_SM => {
                let Ok(sm) = StatusMessage::decode(buf) else {
                    self.counters.invalid_packets.increment();
                    return;
                };
                if let Some(publication) =
                    find_publication(&mut self.publications, endpoint_id, sm.session_id, sm.stream_id)
                {
                    publication.on_status_message(&sm, src, now_ns, &self.counters);
                }
            }
            frame::HDR_TYPE_NAK => {
                let Ok(nak) = NakFrame::decode(buf) else {
                    self.counters.invalid_packets.increment();
                    return;
                };
                let endpoint = &self.endpoints[endpoint_slot];
                if let Some(publication) = find_publication(
                    &mut self.publications,
                    endpoint_id,
                    nak.session_id,
                    nak.stream_id,
                ) {
                    publication.on_nak(&nak, endpoint, now_ns, &self.counters);
                }
            }
            frame::HDR_TYPE_RTTM => {
                let Ok(rtt) = RttMeasurement::decode(buf) else {
                    self.counters.invalid_packets.increment();
                    return;
                };
                let endpoint = &self.endpoints[endpoint_slot];
                if let Some(publication) = find_publication(
                    &mut self.publications,
                    endpoint_id,
                    rtt.session_id,
                    rtt.stream_id,
                ) {
                    publication.on_rtt_measurement(&rtt, src, endpoint);
                }
            }
            frame::HDR_TYPE_ERR => {
                match cn_protocol::frame::ErrorFrame::decode(buf) {
                    Ok(err) => {
                        self.counters.errors.increment();
                        self.conductor.offer(ConductorCmd::RecordError(format!(
                            "error frame from {src}: session={} stream={} code={}: {}",
                            err.session_id, err.stream_id, err.error_code, err.message
                        )));
                    }
                    Err(_) => self.counters.invalid_packets.increment(),
                }
            }
            _ => {
                self.counters.invalid_packets.increment();
            }
        }
    }
}

fn find_publication<'a>(
    publications: &'a mut [Box<NetworkPublication>],
    endpoint_id: usize,
    session_id: i32,
    stream_id: i32,
) -> Option<&'a mut Box<NetworkPublication>> {
    publications.iter_mut().find(|p| {
        p.endpoint_id == endpoint_id && p.session_id == session_id && p.stream_id == stream_id
    })
}
