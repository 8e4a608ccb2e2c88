//! Conductor agent: sole owner of driver bookkeeping.
//!
//! Per duty cycle: update clocks, drain the intra-driver task queue
//! (agent completions, image creation requests, async resolutions), drain
//! the client command ring unless the agent queues are applying
//! back-pressure, pull stream positions into publisher limits, and on the
//! timer interval run liveness checks, lifecycle transitions, and the
//! ring unblock scan.

mod commands;
mod lifecycle;
pub mod types;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cn_concurrent::broadcast::BroadcastTransmitter;
use cn_concurrent::error_log::DistinctErrorLog;
use cn_concurrent::queues::TaskQueue;
use cn_concurrent::ring_buffer::ManyToOneRingBuffer;
use cn_concurrent::time::{CachedClock, EpochClock, NanoClock};
use cn_concurrent::CountersManager;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::context::DriverContext;
use crate::duty_cycle::DutyCycleTracker;
use crate::loss_report::LossReport;
use crate::name_resolver::{AsyncNameResolver, DefaultNameResolver, NameResolver, ResolutionResult};
use crate::proxy::{ClientProxy, ConductorCmd, ReceiverProxy, SenderProxy};
use crate::system_counters::SystemCounters;
use self::types::*;

/// Client commands drained from the ring per duty cycle.
const COMMAND_DRAIN_LIMIT: usize = 10;
/// Intra-driver tasks drained per duty cycle.
const TASK_DRAIN_LIMIT: usize = 20;
/// Queue slots that must remain free before draining more client commands.
const BACK_PRESSURE_THRESHOLD: usize = 4;
/// Consecutive stuck observations before the ring unblock fires.
const STUCK_TICKS_BEFORE_UNBLOCK: u32 = 2;

/// Validates driver termination requests.
pub trait TerminationValidator: Send {
    fn allow_termination(&self, token: &[u8]) -> bool;
}

/// Default validator: only an empty token may terminate the driver.
pub struct EmptyTokenTerminationValidator;

impl TerminationValidator for EmptyTokenTerminationValidator {
    fn allow_termination(&self, token: &[u8]) -> bool {
        token.is_empty()
    }
}

/// Caching resolver: literals resolve inline, names resolve through the
/// async worker and land in the cache; a miss is recorded so the command
/// can be parked until the resolution completes.
pub struct CachingResolver {
    cache: Mutex<HashMap<String, SocketAddr>>,
    misses: Mutex<Vec<String>>,
}

impl CachingResolver {
    pub fn new() -> Self {
        CachingResolver {
            cache: Mutex::new(HashMap::new()),
            misses: Mutex::new(Vec::new()),
        }
    }

    pub fn take_misses(&self) -> Vec<String> {
        std::mem::take(&mut *self.misses.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn cached_names(&self) -> Vec<String> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Replace a cached address.  Returns `true` when it changed.
    pub fn update(&self, endpoint: &str, address: SocketAddr) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.insert(endpoint.to_owned(), address) {
            Some(previous) => previous != address,
            None => true,
        }
    }
}

impl Default for CachingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NameResolver for CachingResolver {
    fn resolve(&self, endpoint: &str) -> Option<SocketAddr> {
        if let Ok(addr) = endpoint.parse::<SocketAddr>() {
            return Some(addr);
        }
        if let Some(addr) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
        {
            return Some(*addr);
        }
        self.misses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(endpoint.to_owned());
        None
    }
}

/// A client command suspended while a name resolves.
pub(crate) struct ParkedCommand {
    pub msg_type_id: i32,
    pub buffer: Vec<u8>,
    pub waiting_on: String,
    pub correlation_id: i64,
}

pub struct DriverConductor {
    pub(crate) config: DriverConfig,
    pub(crate) counters_manager: CountersManager,
    pub(crate) system_counters: Arc<SystemCounters>,
    pub(crate) error_log: Arc<DistinctErrorLog>,
    pub(crate) loss_report: LossReport,
    pub(crate) ring: ManyToOneRingBuffer,
    pub(crate) client_proxy: ClientProxy,
    pub(crate) sender_proxy: SenderProxy,
    pub(crate) receiver_proxy: ReceiverProxy,
    pub(crate) tasks: Arc<TaskQueue<ConductorCmd>>,
    pub(crate) resolution_results: Arc<TaskQueue<ResolutionResult>>,
    pub(crate) async_resolver: AsyncNameResolver,
    pub(crate) resolver: Arc<CachingResolver>,
    pub(crate) parked_commands: Vec<ParkedCommand>,

    pub(crate) nano_clock: Arc<NanoClock>,
    pub(crate) cached_clock: Arc<CachedClock>,
    duty_cycle: DutyCycleTracker,
    pub(crate) now_ms: i64,
    next_timer_deadline_ns: i64,
    next_re_resolution_deadline_ns: i64,
    stuck_ring_ticks: u32,

    pub(crate) clients: Vec<ClientSession>,
    pub(crate) network_publications: Vec<NetworkPublicationEntry>,
    pub(crate) ipc_publications: Vec<crate::ipc_publication::IpcPublication>,
    pub(crate) publication_links: Vec<PublicationLink>,
    pub(crate) subscription_links: Vec<SubscriptionLink>,
    pub(crate) images: Vec<ImageEntry>,
    pub(crate) send_endpoints: Vec<EndpointEntry>,
    pub(crate) receive_endpoints: Vec<EndpointEntry>,
    pub(crate) counter_links: Vec<CounterLink>,

    pub(crate) next_endpoint_id: usize,
    pub(crate) next_session_id: i32,
    pub(crate) publications_dir: PathBuf,
    pub(crate) images_dir: PathBuf,

    termination_validator: Box<dyn TerminationValidator>,
    terminate_flag: Arc<AtomicBool>,

    // Mappings backing the buffer views above; dropped last.
    _cnc: Arc<cn_concurrent::cnc::CncFile>,
    _loss_report_file: cn_concurrent::mapped::MappedFile,
}

impl DriverConductor {
    pub fn new(
        context: DriverContext,
        sender_proxy: SenderProxy,
        receiver_proxy: ReceiverProxy,
        tasks: Arc<TaskQueue<ConductorCmd>>,
        cached_clock: Arc<CachedClock>,
        terminate_flag: Arc<AtomicBool>,
    ) -> Result<Self, crate::error::DriverError> {
        let DriverContext {
            config,
            cnc,
            counters_manager,
            system_counters,
            error_log,
            loss_report,
            nano_clock,
            loss_report_file,
            publications_dir,
            images_dir,
        } = context;

        let ring = ManyToOneRingBuffer::new(cnc.to_driver_buffer())
            .map_err(|e| crate::error::DriverError::Configuration(e.to_string()))?;
        let client_proxy = ClientProxy::new(
            BroadcastTransmitter::new(cnc.to_clients_buffer())
                .map_err(|e| crate::error::DriverError::Configuration(e.to_string()))?,
        );

        let resolver = Arc::new(CachingResolver::new());
        let resolution_results = Arc::new(TaskQueue::new());
        let async_resolver = AsyncNameResolver::new(
            Arc::new(DefaultNameResolver),
            Arc::clone(&resolution_results),
        );

        let duty_cycle = DutyCycleTracker::new(config.conductor_cycle_threshold_ns);
        let next_session_id = rand::thread_rng().gen();

        Ok(DriverConductor {
            config,
            counters_manager,
            system_counters,
            error_log,
            loss_report,
            ring,
            client_proxy,
            sender_proxy,
            receiver_proxy,
            tasks,
            resolution_results,
            async_resolver,
            resolver,
            parked_commands: Vec::new(),
            nano_clock,
            cached_clock,
            duty_cycle,
            now_ms: EpochClock::millis(),
            next_timer_deadline_ns: 0,
            next_re_resolution_deadline_ns: 0,
            stuck_ring_ticks: 0,
            clients: Vec::new(),
            network_publications: Vec::new(),
            ipc_publications: Vec::new(),
            publication_links: Vec::new(),
            subscription_links: Vec::new(),
            images: Vec::new(),
            send_endpoints: Vec::new(),
            receive_endpoints: Vec::new(),
            counter_links: Vec::new(),
            next_endpoint_id: 1,
            next_session_id,
            publications_dir,
            images_dir,
            termination_validator: Box::new(EmptyTokenTerminationValidator),
            terminate_flag,
            _cnc: cnc,
            _loss_report_file: loss_report_file,
        })
    }

    pub fn set_termination_validator(&mut self, validator: Box<dyn TerminationValidator>) {
        self.termination_validator = validator;
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_flag.load(Ordering::Acquire)
    }

    pub(crate) fn request_termination(&mut self, token: &[u8]) -> bool {
        if self.termination_validator.allow_termination(token) {
            info!("driver termination requested and validated");
            self.terminate_flag.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// One duty cycle.  Returns the work count for the idle strategy.
    pub fn do_work(&mut self) -> usize {
        let now_ns = self.nano_clock.nanos();
        self.cached_clock.update(now_ns);
        self.duty_cycle.measure_and_update(now_ns);

        let mut work = 0;
        work += self.drain_tasks(now_ns);
        work += self.drain_resolutions(now_ns);
        work += self.drain_client_commands(now_ns);
        work += self.track_stream_positions(now_ns);

        if now_ns >= self.next_timer_deadline_ns {
            self.now_ms = EpochClock::millis();
            work += self.on_timer_tick(now_ns);
            self.next_timer_deadline_ns = now_ns + self.config.timer_interval_ns;
        }

        if now_ns >= self.next_re_resolution_deadline_ns {
            work += self.check_re_resolutions();
            self.next_re_resolution_deadline_ns =
                now_ns + self.config.re_resolution_check_interval_ns;
        }

        work
    }

    /// Re-resolve every cached endpoint name so a DNS change reaches the
    /// destinations eventually; results land via the resolution queue.
    fn check_re_resolutions(&mut self) -> usize {
        let names = self.resolver.cached_names();
        for name in &names {
            self.async_resolver.resolve(0, name);
        }
        names.len()
    }

    // -----------------------------------------------------------------------
    // Queue draining
    // -----------------------------------------------------------------------

    fn drain_tasks(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        for _ in 0..TASK_DRAIN_LIMIT {
            let Some(task) = self.tasks.poll() else { break };
            work += 1;
            match task {
                ConductorCmd::CreatePublicationImage(request) => {
                    if let Err(e) = self.on_create_publication_image(request, now_ns) {
                        self.record_error(&e.to_string());
                    }
                }
                ConductorCmd::ReleasePublication(publication) => {
                    self.on_publication_released(publication, now_ns);
                }
                ConductorCmd::ReleaseImage(image) => {
                    self.on_image_released(image, now_ns);
                }
                ConductorCmd::ReleaseSendEndpoint(endpoint) => {
                    debug!(endpoint = %endpoint.canonical_form, "send endpoint released");
                    self.counters_manager
                        .free(endpoint.status_counter_id(), self.now_ms);
                }
                ConductorCmd::ReleaseReceiveEndpoint(endpoint) => {
                    debug!(endpoint = %endpoint.canonical_form, "receive endpoint released");
                    self.counters_manager
                        .free(endpoint.status_counter_id(), self.now_ms);
                }
                ConductorCmd::RecordError(description) => {
                    self.record_error(&description);
                }
            }
        }
        work
    }

    fn drain_resolutions(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        while let Some(result) = self.resolution_results.poll() {
            work += 1;
            match result.address {
                Some(address) => {
                    debug!(endpoint = %result.endpoint, %address, "async resolution complete");
                    if self.resolver.update(&result.endpoint, address) {
                        self.system_counters.resolution_changes.increment();
                    }
                    self.resume_parked_commands(&result.endpoint, now_ns);
                }
                None => {
                    warn!(endpoint = %result.endpoint, "async resolution failed");
                    self.fail_parked_commands(&result.endpoint);
                }
            }
        }
        work
    }

    fn drain_client_commands(&mut self, now_ns: i64) -> usize {
        if self.sender_proxy.remaining() < BACK_PRESSURE_THRESHOLD
            || self.receiver_proxy.remaining() < BACK_PRESSURE_THRESHOLD
        {
            self.system_counters.back_pressure_events.increment();
            return 0;
        }

        // The ring handler needs &mut self for dispatch, so copy commands
        // out first; the limit keeps this bounded and small.
        let mut drained: Vec<(i32, Vec<u8>)> = Vec::new();
        let read = self.ring.read(
            |msg_type_id, buffer, offset, length| {
                drained.push((msg_type_id, buffer.as_slice(offset, length).to_vec()));
            },
            COMMAND_DRAIN_LIMIT,
        );

        for (msg_type_id, buffer) in drained {
            self.on_client_command(msg_type_id, &buffer, now_ns);
        }

        if read > 0 {
            self.stuck_ring_ticks = 0;
        }
        read
    }

    pub(crate) fn record_error(&mut self, description: &str) {
        warn!(error = description, "driver error");
        self.system_counters.errors.increment();
        self.error_log.record(description, self.now_ms);
    }

    // -----------------------------------------------------------------------
    // Ring unblock
    // -----------------------------------------------------------------------

    /// Detect a producer that died mid-claim on the to-driver ring.
    pub(crate) fn check_ring_unblock(&mut self) -> usize {
        if self.ring.size() == 0 {
            self.stuck_ring_ticks = 0;
            return 0;
        }

        self.stuck_ring_ticks += 1;
        if self.stuck_ring_ticks >= STUCK_TICKS_BEFORE_UNBLOCK && self.ring.unblock() {
            self.stuck_ring_ticks = 0;
            self.system_counters.unblocked_commands.increment();
            return 1;
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::broadcast::{BroadcastReceiver, CopyBroadcastReceiver};
    use cn_concurrent::queues::CommandQueue;
    use cn_protocol::control;
    use cn_protocol::ErrorCode;

    struct Harness {
        conductor: DriverConductor,
        events: CopyBroadcastReceiver,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            dir: dir.path().join("driver"),
            term_buffer_length: 64 * 1024,
            ipc_term_buffer_length: 64 * 1024,
            initial_window_length: 16 * 1024,
            ..DriverConfig::default()
        };
        let context = DriverContext::launch(config).unwrap();
        let events = CopyBroadcastReceiver::new(
            BroadcastReceiver::new(context.cnc.to_clients_buffer()).unwrap(),
        );

        let sender_queue = Arc::new(CommandQueue::with_capacity(64));
        let receiver_queue = Arc::new(CommandQueue::with_capacity(64));
        let conductor = DriverConductor::new(
            context,
            SenderProxy::new(sender_queue),
            ReceiverProxy::new(receiver_queue),
            Arc::new(TaskQueue::new()),
            Arc::new(CachedClock::new()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        Harness {
            conductor,
            events,
            _dir: dir,
        }
    }

    fn drain(events: &mut CopyBroadcastReceiver) -> Vec<(i32, Vec<u8>)> {
        let mut seen = Vec::new();
        loop {
            let mut received = None;
            match events.receive(|t, b| received = Some((t, b.to_vec()))) {
                Ok(0) => break,
                Ok(_) => seen.push(received.unwrap()),
                Err(e) => panic!("broadcast error: {e}"),
            }
        }
        seen
    }

    fn add_ipc_publication(
        harness: &mut Harness,
        correlation_id: i64,
        channel: &str,
        stream_id: i32,
        exclusive: bool,
    ) {
        let mut buf = Vec::new();
        control::PublicationCommand {
            client_id: 1,
            correlation_id,
            stream_id,
            channel: channel.to_owned(),
        }
        .encode(&mut buf);
        let msg_type = if exclusive {
            control::ADD_EXCLUSIVE_PUBLICATION
        } else {
            control::ADD_PUBLICATION
        };
        harness.conductor.on_client_command(msg_type, &buf, 0);
    }

    #[test]
    fn remove_unknown_publication_reports_unknown() {
        let mut h = harness();
        let mut buf = Vec::new();
        control::RemoveCommand {
            client_id: 1,
            correlation_id: 50,
            registration_id: 9999,
        }
        .encode(&mut buf);
        h.conductor.on_client_command(control::REMOVE_PUBLICATION, &buf, 0);

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, control::ON_ERROR);
        let error = control::ErrorResponse::decode(&events[0].1).unwrap();
        assert_eq!(error.offending_correlation_id, 50);
        assert_eq!(
            ErrorCode::from_i32(error.error_code),
            ErrorCode::UnknownPublication
        );
    }

    #[test]
    fn remove_publication_is_idempotent_per_registration() {
        let mut h = harness();
        add_ipc_publication(&mut h, 10, "aeron:ipc", 42, false);

        let ready = drain(&mut h.events);
        assert_eq!(ready[0].0, control::ON_PUBLICATION_READY);

        let mut buf = Vec::new();
        control::RemoveCommand {
            client_id: 1,
            correlation_id: 11,
            registration_id: 10,
        }
        .encode(&mut buf);
        h.conductor.on_client_command(control::REMOVE_PUBLICATION, &buf, 0);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_OPERATION_SUCCESS);

        // A second remove for the same registration id is now unknown.
        let mut buf = Vec::new();
        control::RemoveCommand {
            client_id: 1,
            correlation_id: 12,
            registration_id: 10,
        }
        .encode(&mut buf);
        h.conductor.on_client_command(control::REMOVE_PUBLICATION, &buf, 0);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_ERROR);
    }

    #[test]
    fn clashing_session_id_is_refused_with_reason() {
        let mut h = harness();
        add_ipc_publication(&mut h, 20, "aeron:ipc?session-id=5", 10, false);
        drain(&mut h.events);

        add_ipc_publication(&mut h, 21, "aeron:ipc?session-id=5", 10, true);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_ERROR);
        let error = control::ErrorResponse::decode(&events[0].1).unwrap();
        assert_eq!(
            ErrorCode::from_i32(error.error_code),
            ErrorCode::InvalidChannel
        );
        assert!(error.error_message.contains("clashing sessionId=5"));
    }

    #[test]
    fn ipc_subscription_gets_image_when_publication_arrives() {
        let mut h = harness();
        let mut buf = Vec::new();
        control::SubscriptionCommand {
            client_id: 1,
            correlation_id: 30,
            registration_correlation_id: -1,
            stream_id: 7,
            channel: "aeron:ipc".to_owned(),
        }
        .encode(&mut buf);
        h.conductor.on_client_command(control::ADD_SUBSCRIPTION, &buf, 0);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_SUBSCRIPTION_READY);

        add_ipc_publication(&mut h, 31, "aeron:ipc", 7, false);
        let events = drain(&mut h.events);
        let types: Vec<i32> = events.iter().map(|(t, _)| *t).collect();
        assert!(types.contains(&control::ON_AVAILABLE_IMAGE));
        assert!(types.contains(&control::ON_PUBLICATION_READY));

        let image = events
            .iter()
            .find(|(t, _)| *t == control::ON_AVAILABLE_IMAGE)
            .map(|(_, b)| control::ImageReady::decode(b).unwrap())
            .unwrap();
        assert_eq!(image.subscriber_registration_id, 30);
        assert_eq!(image.stream_id, 7);
    }

    #[test]
    fn tag_reference_adopts_session_of_tag_declaring_publication() {
        let mut h = harness();
        add_ipc_publication(&mut h, 60, "aeron:ipc?tags=77", 10, false);
        let events = drain(&mut h.events);
        let declared = control::PublicationReady::decode(&events[0].1).unwrap();

        // A different stream referencing tag 77 adopts the same session.
        add_ipc_publication(&mut h, 61, "aeron:ipc?session-id=tag:77", 11, true);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_EXCLUSIVE_PUBLICATION_READY);
        let adopted = control::PublicationReady::decode(&events[0].1).unwrap();
        assert_eq!(adopted.session_id, declared.session_id);

        // An unreferenced tag is an invalid channel, not a silent miss.
        add_ipc_publication(&mut h, 62, "aeron:ipc?session-id=tag:78", 12, false);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_ERROR);
        let error = control::ErrorResponse::decode(&events[0].1).unwrap();
        assert!(error.error_message.contains("tag:78"));
    }

    #[test]
    fn registration_id_does_not_satisfy_a_tag_reference() {
        let mut h = harness();
        // Correlation (and thus registration) id 90, but no tags= declared.
        add_ipc_publication(&mut h, 90, "aeron:ipc", 10, false);
        drain(&mut h.events);

        add_ipc_publication(&mut h, 91, "aeron:ipc?session-id=tag:90", 10, false);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_ERROR);
    }

    #[test]
    fn subscription_rcv_wnd_governs_image_window() {
        let mut h = harness();
        let mut buf = Vec::new();
        control::SubscriptionCommand {
            client_id: 1,
            correlation_id: 70,
            registration_correlation_id: -1,
            stream_id: 42,
            channel: "aeron:udp?endpoint=127.0.0.1:0&rcv-wnd=8k".to_owned(),
        }
        .encode(&mut buf);
        h.conductor.on_client_command(control::ADD_SUBSCRIPTION, &buf, 0);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_SUBSCRIPTION_READY);

        let endpoint_id = h.conductor.receive_endpoints[0].endpoint_id;
        h.conductor
            .on_create_publication_image(
                crate::proxy::ImageCreationRequest {
                    endpoint_id,
                    session_id: 100,
                    stream_id: 42,
                    initial_term_id: 7,
                    active_term_id: 7,
                    term_offset: 0,
                    term_length: 64 * 1024,
                    mtu: 1408,
                    control_address: "127.0.0.1:9999".parse().unwrap(),
                    source_identity: "127.0.0.1:9999".to_owned(),
                },
                0,
            )
            .unwrap();

        assert_eq!(h.conductor.images.len(), 1);
        assert_eq!(h.conductor.images[0].receiver_window_length, 8 * 1024);
    }

    #[test]
    fn unknown_command_type_reports_error() {
        let mut h = harness();
        let mut buf = Vec::new();
        control::CorrelatedCommand {
            client_id: 1,
            correlation_id: 40,
        }
        .encode(&mut buf);
        h.conductor.on_client_command(0x7777, &buf, 0);
        let events = drain(&mut h.events);
        assert_eq!(events[0].0, control::ON_ERROR);
        let error = control::ErrorResponse::decode(&events[0].1).unwrap();
        assert_eq!(
            ErrorCode::from_i32(error.error_code),
            ErrorCode::UnknownCommandTypeId
        );
    }
}
