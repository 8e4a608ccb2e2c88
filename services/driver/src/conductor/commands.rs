//! Client command handling.
//!
//! Every command carries (client id, correlation id).  Handlers either
//! reply with the matching ready/success event or return a typed error
//! that the dispatcher converts into an `OnError` event carrying the
//! offending correlation id.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use cn_logbuffer::descriptor as log_descriptor;
use cn_logbuffer::MappedRawLog;
use cn_protocol::uri::{ChannelUri, Media, SessionIdParam};
use cn_protocol::{control, ErrorCode};
use tracing::{debug, info};

use super::types::*;
use super::{DriverConductor, ParkedCommand};
use crate::congestion::StaticWindowCongestionControl;
use crate::error::DriverError;
use crate::flow_control;
use crate::image::{
    ImageSharedState, PublicationImage, SubscriberPosition, TetherState, IMAGE_STATE_ACTIVE,
};
use crate::ipc_publication::IpcPublication;
use crate::loss_detector::{
    LossDetector, MulticastBackoffDelayGenerator, StaticDelayGenerator,
};
use crate::media::receive_endpoint::ReceiveChannelEndpoint;
use crate::media::send_endpoint::SendChannelEndpoint;
use crate::media::udp_channel::UdpChannel;
use crate::media::udp_transport::UdpTransport;
use crate::proxy::{ImageCreationRequest, ReceiverCmd, SenderCmd};
use crate::publication::{NetworkPublication, PublicationSharedState};
use crate::retransmit::RetransmitHandler;
use crate::system_counters::{self, stream_counter_label};

impl DriverConductor {
    pub(crate) fn on_client_command(&mut self, msg_type_id: i32, buffer: &[u8], now_ns: i64) {
        let Ok(correlated) = control::CorrelatedCommand::decode(buffer) else {
            self.record_error("malformed client command header");
            return;
        };
        self.ensure_client(correlated.client_id);
        // Discard stale resolution misses so parking reflects this command
        // alone.
        let _ = self.resolver.take_misses();

        let result = match msg_type_id {
            control::ADD_PUBLICATION => self.on_add_publication(buffer, false, now_ns),
            control::ADD_EXCLUSIVE_PUBLICATION => self.on_add_publication(buffer, true, now_ns),
            control::REMOVE_PUBLICATION => self.on_remove_publication(buffer, now_ns),
            control::ADD_SUBSCRIPTION => self.on_add_subscription(buffer, now_ns),
            control::REMOVE_SUBSCRIPTION => self.on_remove_subscription(buffer, now_ns),
            control::CLIENT_KEEPALIVE => self.on_client_keepalive(buffer),
            control::CLIENT_CLOSE => self.on_client_close(buffer, now_ns),
            control::ADD_COUNTER => self.on_add_counter(buffer, false),
            control::ADD_STATIC_COUNTER => self.on_add_counter(buffer, true),
            control::REMOVE_COUNTER => self.on_remove_counter(buffer),
            control::ADD_DESTINATION => self.on_add_destination(buffer),
            control::REMOVE_DESTINATION => self.on_remove_destination(buffer),
            control::ADD_RCV_DESTINATION => self.on_add_rcv_destination(buffer),
            control::REMOVE_RCV_DESTINATION => self.on_remove_rcv_destination(buffer),
            control::TERMINATE_DRIVER => self.on_terminate_driver(buffer),
            control::NEXT_AVAILABLE_SESSION_ID => self.on_next_available_session_id(buffer),
            control::REJECT_IMAGE => self.on_reject_image(buffer, now_ns),
            other => Err(DriverError::control(
                ErrorCode::UnknownCommandTypeId,
                format!("unknown command type id {other}"),
            )),
        };

        match result {
            Ok(()) => {}
            Err(e) => {
                let parked = matches!(e, DriverError::InvalidChannel(_))
                    && self.park_on_miss(msg_type_id, buffer, correlated.correlation_id);
                if parked {
                    debug!(error = %e, "command parked awaiting name resolution");
                } else {
                    let message = e.to_string();
                    self.record_error(&message);
                    self.client_proxy
                        .on_error(correlated.correlation_id, e.error_code(), &message);
                }
            }
        }
    }

    /// Park the command if the failure was an unresolved name.
    fn park_on_miss(&mut self, msg_type_id: i32, buffer: &[u8], correlation_id: i64) -> bool {
        let misses = self.resolver.take_misses();
        let Some(endpoint) = misses.into_iter().next() else {
            return false;
        };
        self.async_resolver.resolve(correlation_id, &endpoint);
        self.parked_commands.push(ParkedCommand {
            msg_type_id,
            buffer: buffer.to_vec(),
            waiting_on: endpoint,
            correlation_id,
        });
        true
    }

    pub(crate) fn resume_parked_commands(&mut self, endpoint: &str, now_ns: i64) {
        let ready: Vec<ParkedCommand> = {
            let mut ready = Vec::new();
            let mut i = 0;
            while i < self.parked_commands.len() {
                if self.parked_commands[i].waiting_on == endpoint {
                    ready.push(self.parked_commands.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };
        for parked in ready {
            self.on_client_command(parked.msg_type_id, &parked.buffer, now_ns);
        }
    }

    pub(crate) fn fail_parked_commands(&mut self, endpoint: &str) {
        let mut i = 0;
        while i < self.parked_commands.len() {
            if self.parked_commands[i].waiting_on == endpoint {
                let parked = self.parked_commands.swap_remove(i);
                self.client_proxy.on_error(
                    parked.correlation_id,
                    ErrorCode::UnknownHost,
                    &format!("could not resolve '{endpoint}'"),
                );
            } else {
                i += 1;
            }
        }
    }

    pub(crate) fn ensure_client(&mut self, client_id: i64) {
        if self.clients.iter().any(|c| c.client_id == client_id) {
            return;
        }
        let label = format!("client-heartbeat: {client_id}");
        let Ok(counter_id) = self.counters_manager.allocate(
            system_counters::CLIENT_HEARTBEAT_TYPE_ID,
            &client_id.to_le_bytes(),
            &label,
            self.now_ms,
        ) else {
            self.record_error("counters exhausted allocating client heartbeat");
            return;
        };
        let heartbeat = self.counters_manager.counter(counter_id);
        heartbeat.set_ordered(self.now_ms);
        info!(client_id, "client session started");
        self.clients.push(ClientSession {
            client_id,
            heartbeat,
            heartbeat_counter_id: counter_id,
            time_of_last_keepalive_ms: self.now_ms,
            closed_by_command: false,
            timed_out: false,
        });
    }

    // -----------------------------------------------------------------------
    // Publications
    // -----------------------------------------------------------------------

    fn on_add_publication(
        &mut self,
        buffer: &[u8],
        is_exclusive: bool,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        let cmd = control::PublicationCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let uri = ChannelUri::parse(&cmd.channel)
            .map_err(|e| DriverError::InvalidChannel(format!("{}: {e}", cmd.channel)))?;
        if uri.is_spy {
            return Err(DriverError::InvalidChannel(
                "cannot publish on a spy channel".to_owned(),
            ));
        }

        match uri.media {
            Media::Ipc => self.add_ipc_publication(&cmd, &uri, is_exclusive, now_ns),
            Media::Udp => self.add_network_publication(&cmd, &uri, is_exclusive, now_ns),
        }
    }

    fn add_ipc_publication(
        &mut self,
        cmd: &control::PublicationCommand,
        uri: &ChannelUri,
        is_exclusive: bool,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        let entity_tag = uri
            .int_param("tags")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let session_param = uri
            .session_id()
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let explicit_session = match session_param {
            Some(SessionIdParam::Literal(id)) => Some(id),
            Some(SessionIdParam::Tagged(tag)) => {
                // A tag reference adopts the session of the publication
                // that declared the tag via `tags=<n>`.
                let tagged = self
                    .ipc_publications
                    .iter()
                    .find(|p| p.entity_tag == Some(tag))
                    .ok_or_else(|| {
                        DriverError::InvalidChannel(format!("unknown publication tag:{tag}"))
                    })?;
                Some(tagged.session_id)
            }
            None => None,
        };

        // Non-exclusive publications share an existing stream when the
        // session parameter allows it.
        if !is_exclusive {
            if let Some(slot) = self.ipc_publications.iter().position(|p| {
                p.stream_id == cmd.stream_id
                    && !p.is_exclusive
                    && p.state == crate::ipc_publication::IpcPublicationState::Active
                    && explicit_session.map_or(true, |s| s == p.session_id)
            }) {
                let (registration_id, limit_id, session_id, stream_id, log_file) = {
                    let entry = &mut self.ipc_publications[slot];
                    entry.ref_count += 1;
                    (
                        entry.registration_id,
                        entry.publisher_limit_counter_id(),
                        entry.session_id,
                        entry.stream_id,
                        entry.log().path().display().to_string(),
                    )
                };
                self.publication_links.push(PublicationLink {
                    registration_id: cmd.correlation_id,
                    client_id: cmd.client_id,
                    resource: PublicationRef::Ipc(registration_id),
                });
                self.client_proxy.on_publication_ready(
                    cmd.correlation_id,
                    registration_id,
                    session_id,
                    stream_id,
                    limit_id,
                    -1,
                    &log_file,
                    false,
                );
                return Ok(());
            }
        }

        let session_id = self.allocate_session_id(cmd.stream_id, explicit_session, |c, stream, session| {
            c.ipc_publications
                .iter()
                .any(|p| p.stream_id == stream && p.session_id == session)
        })?;

        let term_length = uri
            .size_param("term-length")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
            .unwrap_or(self.config.ipc_term_buffer_length);
        cn_logbuffer::check_term_length(term_length)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;

        let registration_id = cmd.correlation_id;
        let initial_term_id = self.next_initial_term_id();
        let log_path = self.publications_dir.join(format!("{registration_id}.logbuffer"));
        let log = Arc::new(
            MappedRawLog::create(&log_path, term_length)
                .map_err(|e| DriverError::InvalidChannel(e.to_string()))?,
        );
        log_descriptor::initialize(
            &log.metadata_buffer(),
            registration_id,
            initial_term_id,
            term_length,
            self.config.file_page_size,
            self.config.mtu_length,
            session_id,
            cmd.stream_id,
        );
        if let Some(tag) = entity_tag {
            log_descriptor::set_entity_tag(&log.metadata_buffer(), tag);
        }

        let limit_id = self.allocate_stream_counter(
            system_counters::PUBLISHER_LIMIT_TYPE_ID,
            "pub-lmt",
            registration_id,
            session_id,
            cmd.stream_id,
            &cmd.channel,
        )?;
        let position_id = self.allocate_stream_counter(
            system_counters::PUBLISHER_POSITION_TYPE_ID,
            "pub-pos",
            registration_id,
            session_id,
            cmd.stream_id,
            &cmd.channel,
        )?;

        let term_window = uri
            .size_param("pub-wnd")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
            .unwrap_or(term_length / 2)
            .min(term_length / 2);

        let mut publication = IpcPublication::new(
            registration_id,
            session_id,
            cmd.stream_id,
            initial_term_id,
            cmd.channel.clone(),
            is_exclusive,
            entity_tag,
            log,
            self.counters_manager.counter(limit_id),
            self.counters_manager.counter(position_id),
            term_window,
            self.config.publication_unblock_timeout_ns,
            now_ns,
        );

        // Link interested IPC subscriptions.
        let subscribers: Vec<(i64, bool)> = self
            .subscription_links
            .iter()
            .filter(|l| l.kind == LinkKind::Ipc && l.stream_id == cmd.stream_id)
            .filter(|l| l.session_filter.map_or(true, |s| s == session_id))
            .map(|l| (l.registration_id, l.is_tether))
            .collect();
        let log_file = publication.log().path().display().to_string();
        for (subscriber_registration_id, is_tether) in subscribers {
            let position_counter_id = self.allocate_stream_counter(
                system_counters::SUBSCRIBER_POSITION_TYPE_ID,
                "sub-pos",
                subscriber_registration_id,
                session_id,
                cmd.stream_id,
                &cmd.channel,
            )?;
            let counter = self.counters_manager.counter(position_counter_id);
            let join_position = publication.producer_position();
            counter.set_ordered(join_position);
            publication.subscriber_positions_mut().push(SubscriberPosition {
                subscription_registration_id: subscriber_registration_id,
                counter,
                is_tether,
                tether_state: TetherState::Active,
                time_of_last_tether_change_ns: now_ns,
            });
            self.client_proxy.on_available_image(
                registration_id,
                session_id,
                cmd.stream_id,
                subscriber_registration_id,
                position_counter_id,
                &log_file,
                "aeron:ipc",
            );
        }

        publication.update_publisher_limit();
        info!(
            registration_id,
            session_id,
            stream_id = cmd.stream_id,
            exclusive = is_exclusive,
            "ipc publication added"
        );
        self.ipc_publications.push(publication);
        self.publication_links.push(PublicationLink {
            registration_id: cmd.correlation_id,
            client_id: cmd.client_id,
            resource: PublicationRef::Ipc(registration_id),
        });
        self.client_proxy.on_publication_ready(
            cmd.correlation_id,
            registration_id,
            session_id,
            cmd.stream_id,
            limit_id,
            -1,
            &log_file,
            is_exclusive,
        );
        Ok(())
    }

    fn add_network_publication(
        &mut self,
        cmd: &control::PublicationCommand,
        uri: &ChannelUri,
        is_exclusive: bool,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        let resolver = Arc::clone(&self.resolver);
        let channel = UdpChannel::parse(&cmd.channel, resolver.as_ref())?;
        let canonical = channel.canonical_form.clone();

        let entity_tag = uri
            .int_param("tags")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let session_param = uri
            .session_id()
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let explicit_session = match session_param {
            Some(SessionIdParam::Literal(id)) => Some(id),
            Some(SessionIdParam::Tagged(tag)) => {
                // A tag reference adopts the session of the publication
                // that declared the tag via `tags=<n>`.
                let entry = self
                    .network_publications
                    .iter()
                    .find(|p| p.entity_tag == Some(tag))
                    .ok_or_else(|| {
                        DriverError::InvalidChannel(format!("unknown publication tag:{tag}"))
                    })?;
                Some(entry.session_id)
            }
            None => None,
        };

        if !is_exclusive {
            if let Some(slot) = self.network_publications.iter().position(|p| {
                p.stream_id == cmd.stream_id
                    && p.canonical_form == canonical
                    && !p.is_exclusive
                    && p.lifecycle == Lifecycle::Active
                    && explicit_session.map_or(true, |s| s == p.session_id)
            }) {
                let entry = &mut self.network_publications[slot];
                entry.ref_count += 1;
                let registration_id = entry.registration_id;
                let session_id = entry.session_id;
                let limit_id = entry.publisher_limit.id();
                let log_file = entry.log.path().display().to_string();
                self.publication_links.push(PublicationLink {
                    registration_id: cmd.correlation_id,
                    client_id: cmd.client_id,
                    resource: PublicationRef::Network(registration_id),
                });
                self.client_proxy.on_publication_ready(
                    cmd.correlation_id,
                    registration_id,
                    session_id,
                    cmd.stream_id,
                    limit_id,
                    -1,
                    &log_file,
                    false,
                );
                return Ok(());
            }
        }

        let canonical_for_closure = canonical.clone();
        let session_id = self.allocate_session_id(
            cmd.stream_id,
            explicit_session,
            move |c, stream, session| {
                c.network_publications.iter().any(|p| {
                    p.stream_id == stream
                        && p.session_id == session
                        && p.canonical_form == canonical_for_closure
                })
            },
        )?;

        let term_length = uri
            .size_param("term-length")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
            .unwrap_or(self.config.term_buffer_length);
        cn_logbuffer::check_term_length(term_length)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let mtu = uri
            .size_param("mtu")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
            .unwrap_or(self.config.mtu_length);

        let endpoint_id = self.get_or_create_send_endpoint(&channel)?;

        let registration_id = cmd.correlation_id;
        let initial_term_id = self.next_initial_term_id();
        let log_path = self.publications_dir.join(format!("{registration_id}.logbuffer"));
        let log = Arc::new(
            MappedRawLog::create(&log_path, term_length)
                .map_err(|e| DriverError::InvalidChannel(e.to_string()))?,
        );
        log_descriptor::initialize(
            &log.metadata_buffer(),
            registration_id,
            initial_term_id,
            term_length,
            self.config.file_page_size,
            mtu,
            session_id,
            cmd.stream_id,
        );

        let limit_id = self.allocate_stream_counter(
            system_counters::PUBLISHER_LIMIT_TYPE_ID,
            "pub-lmt",
            registration_id,
            session_id,
            cmd.stream_id,
            &cmd.channel,
        )?;
        let sender_position_id = self.allocate_stream_counter(
            system_counters::SENDER_POSITION_TYPE_ID,
            "snd-pos",
            registration_id,
            session_id,
            cmd.stream_id,
            &cmd.channel,
        )?;
        let sender_limit_id = self.allocate_stream_counter(
            system_counters::SENDER_LIMIT_TYPE_ID,
            "snd-lmt",
            registration_id,
            session_id,
            cmd.stream_id,
            &cmd.channel,
        )?;

        let flow_control = flow_control::supply_flow_control(uri, channel.is_multicast)?;
        let retransmit_handler = RetransmitHandler::new(
            self.config.retransmit_unicast_delay_ns,
            self.config.retransmit_unicast_linger_ns,
            uri.int_param("max-resend")
                .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
                .map_or(self.config.max_resend, |v| v as usize),
            self.system_counters.retransmit_overflow,
        );

        let shared = Arc::new(PublicationSharedState::new());
        let publication = NetworkPublication::new(
            registration_id,
            session_id,
            cmd.stream_id,
            initial_term_id,
            endpoint_id,
            Arc::clone(&log),
            self.counters_manager.counter(sender_position_id),
            self.counters_manager.counter(sender_limit_id),
            flow_control,
            retransmit_handler,
            self.config.retransmit_receiver_window_multiple,
            mtu,
            self.config.publication_heartbeat_timeout_ns,
            Arc::clone(&shared),
        );

        if let Some(tag) = entity_tag {
            log_descriptor::set_entity_tag(&log.metadata_buffer(), tag);
        }

        let term_window = self.config.publication_term_window_length(term_length);
        let mut entry = NetworkPublicationEntry {
            registration_id,
            session_id,
            stream_id: cmd.stream_id,
            channel: cmd.channel.clone(),
            canonical_form: canonical,
            is_exclusive,
            entity_tag,
            endpoint_id,
            log,
            publisher_limit: self.counters_manager.counter(limit_id),
            sender_position: self.counters_manager.counter(sender_position_id),
            sender_limit: self.counters_manager.counter(sender_limit_id),
            shared,
            spy_positions: Vec::new(),
            term_window_length: term_window,
            position_bits: log_descriptor::position_bits_to_shift(term_length),
            initial_term_id,
            ref_count: 1,
            lifecycle: Lifecycle::Active,
            time_of_last_state_change_ns: now_ns,
            last_producer_position: 0,
            time_of_last_producer_change_ns: now_ns,
            cleaned_limit: (cn_logbuffer::PARTITION_COUNT * term_length) as i64,
        };
        entry.publisher_limit.set_ordered(term_window as i64);

        self.link_spy_subscriptions(&mut entry, now_ns)?;

        if self
            .sender_proxy
            .offer(SenderCmd::AddPublication(Box::new(publication)))
            .is_err()
        {
            return Err(DriverError::control(
                ErrorCode::ResourceTemporarilyUnavailable,
                "sender command queue is full",
            ));
        }

        let log_file = entry.log.path().display().to_string();
        info!(
            registration_id,
            session_id,
            stream_id = cmd.stream_id,
            channel = %cmd.channel,
            "network publication added"
        );
        self.network_publications.push(entry);
        self.publication_links.push(PublicationLink {
            registration_id: cmd.correlation_id,
            client_id: cmd.client_id,
            resource: PublicationRef::Network(registration_id),
        });
        self.client_proxy.on_publication_ready(
            cmd.correlation_id,
            registration_id,
            session_id,
            cmd.stream_id,
            limit_id,
            -1,
            &log_file,
            is_exclusive,
        );
        Ok(())
    }

    /// Link existing spy subscriptions to a new network publication.
    fn link_spy_subscriptions(
        &mut self,
        entry: &mut NetworkPublicationEntry,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        let resolver = Arc::clone(&self.resolver);
        let matches: Vec<(i64, bool)> = self
            .subscription_links
            .iter()
            .filter(|l| l.kind == LinkKind::Spy && l.stream_id == entry.stream_id)
            .filter(|l| {
                UdpChannel::parse(l.channel.trim_start_matches("aeron-spy:"), resolver.as_ref())
                    .map(|c| c.canonical_form == entry.canonical_form)
                    .unwrap_or(false)
            })
            .filter(|l| l.session_filter.map_or(true, |s| s == entry.session_id))
            .map(|l| (l.registration_id, l.is_tether))
            .collect();

        let log_file = entry.log.path().display().to_string();
        for (subscriber_registration_id, is_tether) in matches {
            let counter_id = self.allocate_stream_counter(
                system_counters::SUBSCRIBER_POSITION_TYPE_ID,
                "spy-pos",
                subscriber_registration_id,
                entry.session_id,
                entry.stream_id,
                &entry.channel,
            )?;
            let counter = self.counters_manager.counter(counter_id);
            entry.spy_positions.push(SubscriberPosition {
                subscription_registration_id: subscriber_registration_id,
                counter,
                is_tether,
                tether_state: TetherState::Active,
                time_of_last_tether_change_ns: now_ns,
            });
            self.client_proxy.on_available_image(
                entry.registration_id,
                entry.session_id,
                entry.stream_id,
                subscriber_registration_id,
                counter_id,
                &log_file,
                "aeron-spy",
            );
        }
        Ok(())
    }

    fn on_remove_publication(&mut self, buffer: &[u8], now_ns: i64) -> Result<(), DriverError> {
        let cmd = control::RemoveCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;

        let Some(slot) = self
            .publication_links
            .iter()
            .position(|l| l.registration_id == cmd.registration_id)
        else {
            return Err(DriverError::control(
                ErrorCode::UnknownPublication,
                format!("unknown publication: {}", cmd.registration_id),
            ));
        };

        let link = self.publication_links.swap_remove(slot);
        self.release_publication_ref(link.resource, now_ns);
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    pub(crate) fn release_publication_ref(&mut self, resource: PublicationRef, now_ns: i64) {
        match resource {
            PublicationRef::Network(id) => {
                if let Some(entry) = self
                    .network_publications
                    .iter_mut()
                    .find(|p| p.registration_id == id)
                {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count == 0 && entry.lifecycle == Lifecycle::Active {
                        let meta = entry.log.metadata_buffer();
                        let producer = producer_position_of(entry);
                        log_descriptor::set_end_of_stream_position(&meta, producer);
                        entry.lifecycle = Lifecycle::Draining;
                        entry.time_of_last_state_change_ns = now_ns;
                    }
                }
            }
            PublicationRef::Ipc(id) => {
                if let Some(entry) = self
                    .ipc_publications
                    .iter_mut()
                    .find(|p| p.registration_id == id)
                {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count == 0
                        && entry.state == crate::ipc_publication::IpcPublicationState::Active
                    {
                        entry.end_of_stream();
                        entry.state = crate::ipc_publication::IpcPublicationState::Draining;
                        entry.time_of_last_state_change_ns = now_ns;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    fn on_add_subscription(&mut self, buffer: &[u8], now_ns: i64) -> Result<(), DriverError> {
        let cmd = control::SubscriptionCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let uri = ChannelUri::parse(&cmd.channel)
            .map_err(|e| DriverError::InvalidChannel(format!("{}: {e}", cmd.channel)))?;

        let session_filter = match uri
            .session_id()
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
        {
            Some(SessionIdParam::Literal(id)) => Some(id),
            Some(SessionIdParam::Tagged(_)) => {
                return Err(DriverError::InvalidChannel(
                    "session-id tag references are not valid on subscriptions".to_owned(),
                ))
            }
            None => None,
        };

        let is_reliable = uri
            .bool_param("reliable", self.config.reliable_stream)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let is_tether = uri
            .bool_param("tether", self.config.tether_subscriptions)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let is_rejoin = uri
            .bool_param("rejoin", self.config.rejoin_stream)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let is_sparse = uri
            .bool_param("sparse", self.config.sparse_files)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let group_tag = uri
            .int_param("gtag")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;
        let receiver_window = uri
            .size_param("rcv-wnd")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;

        let kind = match (uri.media, uri.is_spy) {
            (Media::Ipc, _) => LinkKind::Ipc,
            (Media::Udp, true) => LinkKind::Spy,
            (Media::Udp, false) => {
                let endpoint_id = self.get_or_create_receive_endpoint(&cmd.channel)?;
                if self
                    .receiver_proxy
                    .offer(ReceiverCmd::AddSubscription {
                        endpoint_id,
                        stream_id: cmd.stream_id,
                        session_id: session_filter,
                    })
                    .is_err()
                {
                    return Err(DriverError::control(
                        ErrorCode::ResourceTemporarilyUnavailable,
                        "receiver command queue is full",
                    ));
                }
                LinkKind::Network { endpoint_id }
            }
        };

        let link = SubscriptionLink {
            registration_id: cmd.correlation_id,
            client_id: cmd.client_id,
            stream_id: cmd.stream_id,
            channel: cmd.channel.clone(),
            kind,
            session_filter,
            is_reliable,
            is_tether,
            is_rejoin,
            is_sparse,
            group_tag,
            receiver_window,
        };

        let status_counter_id = match kind {
            LinkKind::Network { endpoint_id } => self
                .receive_endpoints
                .iter()
                .find(|e| e.endpoint_id == endpoint_id)
                .map_or(-1, |e| e.status_counter_id),
            _ => -1,
        };

        info!(
            registration_id = cmd.correlation_id,
            stream_id = cmd.stream_id,
            channel = %cmd.channel,
            "subscription added"
        );
        self.client_proxy
            .on_subscription_ready(cmd.correlation_id, status_counter_id);

        self.link_new_subscription(&link, now_ns)?;
        self.subscription_links.push(link);
        Ok(())
    }

    /// Attach a new subscription to any live matching streams.
    fn link_new_subscription(
        &mut self,
        link: &SubscriptionLink,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        match link.kind {
            LinkKind::Ipc => {
                let matches: Vec<usize> = self
                    .ipc_publications
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.stream_id == link.stream_id
                            && p.is_accepting_subscribers()
                            && link.session_filter.map_or(true, |s| s == p.session_id)
                    })
                    .map(|(i, _)| i)
                    .collect();
                for slot in matches {
                    let (registration_id, session_id, stream_id, channel, join_position, log_file) = {
                        let p = &self.ipc_publications[slot];
                        (
                            p.registration_id,
                            p.session_id,
                            p.stream_id,
                            p.channel.clone(),
                            p.producer_position(),
                            p.log().path().display().to_string(),
                        )
                    };
                    let counter_id = self.allocate_stream_counter(
                        system_counters::SUBSCRIBER_POSITION_TYPE_ID,
                        "sub-pos",
                        link.registration_id,
                        session_id,
                        stream_id,
                        &channel,
                    )?;
                    let counter = self.counters_manager.counter(counter_id);
                    counter.set_ordered(join_position);
                    self.ipc_publications[slot]
                        .subscriber_positions_mut()
                        .push(SubscriberPosition {
                            subscription_registration_id: link.registration_id,
                            counter,
                            is_tether: link.is_tether,
                            tether_state: TetherState::Active,
                            time_of_last_tether_change_ns: now_ns,
                        });
                    self.client_proxy.on_available_image(
                        registration_id,
                        session_id,
                        stream_id,
                        link.registration_id,
                        counter_id,
                        &log_file,
                        "aeron:ipc",
                    );
                }
            }
            LinkKind::Spy => {
                let resolver = Arc::clone(&self.resolver);
                let spied = UdpChannel::parse(
                    link.channel.trim_start_matches("aeron-spy:"),
                    resolver.as_ref(),
                )?;
                let matches: Vec<usize> = self
                    .network_publications
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.stream_id == link.stream_id
                            && p.canonical_form == spied.canonical_form
                            && p.lifecycle == Lifecycle::Active
                            && link.session_filter.map_or(true, |s| s == p.session_id)
                    })
                    .map(|(i, _)| i)
                    .collect();
                for slot in matches {
                    let (registration_id, session_id, stream_id, channel, join_position, log_file) = {
                        let p = &self.network_publications[slot];
                        (
                            p.registration_id,
                            p.session_id,
                            p.stream_id,
                            p.channel.clone(),
                            p.sender_position.get_volatile(),
                            p.log.path().display().to_string(),
                        )
                    };
                    let counter_id = self.allocate_stream_counter(
                        system_counters::SUBSCRIBER_POSITION_TYPE_ID,
                        "spy-pos",
                        link.registration_id,
                        session_id,
                        stream_id,
                        &channel,
                    )?;
                    let counter = self.counters_manager.counter(counter_id);
                    counter.set_ordered(join_position);
                    self.network_publications[slot].spy_positions.push(SubscriberPosition {
                        subscription_registration_id: link.registration_id,
                        counter,
                        is_tether: link.is_tether,
                        tether_state: TetherState::Active,
                        time_of_last_tether_change_ns: now_ns,
                    });
                    self.client_proxy.on_available_image(
                        registration_id,
                        session_id,
                        stream_id,
                        link.registration_id,
                        counter_id,
                        &log_file,
                        "aeron-spy",
                    );
                }
            }
            LinkKind::Network { endpoint_id } => {
                let matches: Vec<usize> = self
                    .images
                    .iter()
                    .enumerate()
                    .filter(|(_, image)| {
                        image.endpoint_id == endpoint_id
                            && image.stream_id == link.stream_id
                            && image.lifecycle == Lifecycle::Active
                            && link.session_filter.map_or(true, |s| s == image.session_id)
                    })
                    .map(|(i, _)| i)
                    .collect();
                for slot in matches {
                    let (correlation_id, session_id, stream_id, channel, join_position, log_file, source) = {
                        let image = &self.images[slot];
                        (
                            image.correlation_id,
                            image.session_id,
                            image.stream_id,
                            image.channel.clone(),
                            image.rebuild_position.get_volatile(),
                            image.log.path().display().to_string(),
                            image.source_identity.clone(),
                        )
                    };
                    let counter_id = self.allocate_stream_counter(
                        system_counters::SUBSCRIBER_POSITION_TYPE_ID,
                        "sub-pos",
                        link.registration_id,
                        session_id,
                        stream_id,
                        &channel,
                    )?;
                    let counter = self.counters_manager.counter(counter_id);
                    counter.set_ordered(join_position);
                    self.images[slot]
                        .subscriber_positions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(SubscriberPosition {
                            subscription_registration_id: link.registration_id,
                            counter,
                            is_tether: link.is_tether,
                            tether_state: TetherState::Active,
                            time_of_last_tether_change_ns: now_ns,
                        });
                    self.client_proxy.on_available_image(
                        correlation_id,
                        session_id,
                        stream_id,
                        link.registration_id,
                        counter_id,
                        &log_file,
                        &source,
                    );
                }
            }
        }
        Ok(())
    }

    fn on_remove_subscription(&mut self, buffer: &[u8], now_ns: i64) -> Result<(), DriverError> {
        let cmd = control::RemoveCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;

        let Some(slot) = self
            .subscription_links
            .iter()
            .position(|l| l.registration_id == cmd.registration_id)
        else {
            return Err(DriverError::control(
                ErrorCode::UnknownSubscription,
                format!("unknown subscription: {}", cmd.registration_id),
            ));
        };

        let link = self.subscription_links.swap_remove(slot);
        self.unlink_subscription(&link, now_ns);
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    pub(crate) fn unlink_subscription(&mut self, link: &SubscriptionLink, _now_ns: i64) {
        let registration_id = link.registration_id;

        for publication in &mut self.ipc_publications {
            let positions = publication.subscriber_positions_mut();
            if let Some(i) = positions
                .iter()
                .position(|p| p.subscription_registration_id == registration_id)
            {
                let removed = positions.swap_remove(i);
                self.counters_manager.free(removed.counter.id(), self.now_ms);
            }
        }
        for entry in &mut self.network_publications {
            if let Some(i) = entry
                .spy_positions
                .iter()
                .position(|p| p.subscription_registration_id == registration_id)
            {
                let removed = entry.spy_positions.swap_remove(i);
                self.counters_manager.free(removed.counter.id(), self.now_ms);
            }
        }
        for image in &self.images {
            let mut positions = image
                .subscriber_positions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(i) = positions
                .iter()
                .position(|p| p.subscription_registration_id == registration_id)
            {
                let removed = positions.swap_remove(i);
                self.counters_manager.free(removed.counter.id(), self.now_ms);
            }
        }

        if let LinkKind::Network { endpoint_id } = link.kind {
            let _ = self.receiver_proxy.offer(ReceiverCmd::RemoveSubscription {
                endpoint_id,
                stream_id: link.stream_id,
            });
            self.release_receive_endpoint_ref(endpoint_id);
        }
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    fn on_client_keepalive(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::CorrelatedCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let now_ms = self.now_ms;
        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == cmd.client_id) {
            client.time_of_last_keepalive_ms = now_ms;
            client.heartbeat.set_ordered(now_ms);
        }
        Ok(())
    }

    fn on_client_close(&mut self, buffer: &[u8], now_ns: i64) -> Result<(), DriverError> {
        let cmd = control::CorrelatedCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        if let Some(slot) = self.clients.iter().position(|c| c.client_id == cmd.client_id) {
            self.clients[slot].closed_by_command = true;
            self.close_client_resources(cmd.client_id, now_ns);
        }
        Ok(())
    }

    /// Cascade-close everything a dead or departing client owned.
    pub(crate) fn close_client_resources(&mut self, client_id: i64, now_ns: i64) {
        let publication_links: Vec<PublicationLink> = {
            let mut drained = Vec::new();
            let mut i = 0;
            while i < self.publication_links.len() {
                if self.publication_links[i].client_id == client_id {
                    drained.push(self.publication_links.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            drained
        };
        for link in publication_links {
            self.release_publication_ref(link.resource, now_ns);
        }

        let subscription_links: Vec<SubscriptionLink> = {
            let mut drained = Vec::new();
            let mut i = 0;
            while i < self.subscription_links.len() {
                if self.subscription_links[i].client_id == client_id {
                    drained.push(self.subscription_links.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            drained
        };
        for link in &subscription_links {
            self.unlink_subscription(link, now_ns);
        }

        let mut i = 0;
        while i < self.counter_links.len() {
            if self.counter_links[i].client_id == client_id && !self.counter_links[i].is_static {
                let link = self.counter_links.swap_remove(i);
                self.client_proxy
                    .on_unavailable_counter(link.registration_id, link.counter_id);
                self.counters_manager.free(link.counter_id, self.now_ms);
            } else {
                i += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    fn on_add_counter(&mut self, buffer: &[u8], is_static: bool) -> Result<(), DriverError> {
        let cmd = control::CounterCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;

        if is_static {
            // Static counters are idempotent on (type id, registration id).
            let existing = self
                .counter_links
                .iter()
                .find(|l| l.is_static && l.registration_id == cmd.registration_id);
            if let Some(link) = existing {
                self.client_proxy
                    .on_static_counter(cmd.correlation_id, link.counter_id);
                return Ok(());
            }
        }

        let counter_id = self
            .counters_manager
            .allocate(cmd.type_id, &cmd.key, &cmd.label, self.now_ms)
            .map_err(|e| DriverError::control(ErrorCode::GenericError, e.to_string()))?;
        let registration_id = if is_static {
            cmd.registration_id
        } else {
            cmd.correlation_id
        };
        self.counters_manager
            .set_registration_id(counter_id, registration_id);
        self.counters_manager.set_owner_id(counter_id, cmd.client_id);

        self.counter_links.push(CounterLink {
            registration_id,
            client_id: cmd.client_id,
            counter_id,
            is_static,
        });

        if is_static {
            self.client_proxy
                .on_static_counter(cmd.correlation_id, counter_id);
        } else {
            self.client_proxy
                .on_counter_ready(cmd.correlation_id, counter_id);
        }
        Ok(())
    }

    fn on_remove_counter(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::RemoveCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;

        let Some(slot) = self
            .counter_links
            .iter()
            .position(|l| l.registration_id == cmd.registration_id && !l.is_static)
        else {
            return Err(DriverError::control(
                ErrorCode::UnknownCounter,
                format!("unknown counter: {}", cmd.registration_id),
            ));
        };

        let link = self.counter_links.swap_remove(slot);
        self.client_proxy
            .on_unavailable_counter(link.registration_id, link.counter_id);
        self.counters_manager.free(link.counter_id, self.now_ms);
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Destinations
    // -----------------------------------------------------------------------

    fn on_add_destination(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::DestinationCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let (endpoint_id, address) = self.destination_target(&cmd)?;
        let _ = self
            .sender_proxy
            .offer(SenderCmd::AddDestination { endpoint_id, address });
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    fn on_remove_destination(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::DestinationCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let (endpoint_id, address) = self.destination_target(&cmd)?;
        let _ = self
            .sender_proxy
            .offer(SenderCmd::RemoveDestination { endpoint_id, address });
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    fn destination_target(
        &mut self,
        cmd: &control::DestinationCommand,
    ) -> Result<(usize, SocketAddr), DriverError> {
        let link = self
            .publication_links
            .iter()
            .find(|l| l.registration_id == cmd.registration_correlation_id)
            .ok_or_else(|| {
                DriverError::control(
                    ErrorCode::UnknownPublication,
                    format!("unknown publication: {}", cmd.registration_correlation_id),
                )
            })?;
        let PublicationRef::Network(id) = link.resource else {
            return Err(DriverError::InvalidChannel(
                "destinations apply to udp publications only".to_owned(),
            ));
        };
        let entry = self
            .network_publications
            .iter()
            .find(|p| p.registration_id == id)
            .ok_or_else(|| {
                DriverError::control(ErrorCode::UnknownPublication, "publication is closing")
            })?;

        let resolver = Arc::clone(&self.resolver);
        let channel = UdpChannel::parse(&cmd.channel, resolver.as_ref())?;
        let address = channel.remote_data.ok_or_else(|| {
            DriverError::InvalidChannel("destination channel needs an endpoint".to_owned())
        })?;
        Ok((entry.endpoint_id, address))
    }

    fn on_add_rcv_destination(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::DestinationCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let link = self
            .subscription_links
            .iter()
            .find(|l| l.registration_id == cmd.registration_correlation_id)
            .ok_or_else(|| {
                DriverError::control(
                    ErrorCode::UnknownSubscription,
                    format!("unknown subscription: {}", cmd.registration_correlation_id),
                )
            })?;
        let LinkKind::Network { endpoint_id } = link.kind else {
            return Err(DriverError::InvalidChannel(
                "receive destinations apply to udp subscriptions only".to_owned(),
            ));
        };

        let resolver = Arc::clone(&self.resolver);
        let channel = UdpChannel::parse(&cmd.channel, resolver.as_ref())?;
        let transport = Arc::new(UdpTransport::bind(
            channel.receive_bind_address(),
            channel
                .is_multicast
                .then(|| channel.remote_data.unwrap().ip()),
            channel.ttl,
            self.config.socket_sndbuf,
            self.config.socket_rcvbuf,
        )?);
        let _ = self.receiver_proxy.offer(ReceiverCmd::AddDestination {
            endpoint_id,
            transport,
        });
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    fn on_remove_rcv_destination(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::DestinationCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let link = self
            .subscription_links
            .iter()
            .find(|l| l.registration_id == cmd.registration_correlation_id)
            .ok_or_else(|| {
                DriverError::control(
                    ErrorCode::UnknownSubscription,
                    format!("unknown subscription: {}", cmd.registration_correlation_id),
                )
            })?;
        let LinkKind::Network { endpoint_id } = link.kind else {
            return Err(DriverError::InvalidChannel(
                "receive destinations apply to udp subscriptions only".to_owned(),
            ));
        };

        let resolver = Arc::clone(&self.resolver);
        let channel = UdpChannel::parse(&cmd.channel, resolver.as_ref())?;
        let _ = self.receiver_proxy.offer(ReceiverCmd::RemoveDestination {
            endpoint_id,
            local_addr: channel.receive_bind_address(),
        });
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driver control
    // -----------------------------------------------------------------------

    fn on_terminate_driver(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::TerminateDriverCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        if self.request_termination(&cmd.token) {
            self.client_proxy.on_operation_success(cmd.correlation_id);
            Ok(())
        } else {
            Err(DriverError::control(
                ErrorCode::GenericError,
                "termination token rejected",
            ))
        }
    }

    fn on_next_available_session_id(&mut self, buffer: &[u8]) -> Result<(), DriverError> {
        let cmd = control::NextSessionIdCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;
        let session_id =
            self.allocate_session_id(cmd.stream_id, None, |c, stream, session| {
                c.ipc_publications
                    .iter()
                    .any(|p| p.stream_id == stream && p.session_id == session)
                    || c.network_publications
                        .iter()
                        .any(|p| p.stream_id == stream && p.session_id == session)
            })?;
        // Peeked, not consumed: wind the generator back so the id is the
        // next one allocated.
        self.next_session_id = session_id;
        self.client_proxy
            .on_next_available_session_id(cmd.correlation_id, session_id);
        Ok(())
    }

    fn on_reject_image(&mut self, buffer: &[u8], now_ns: i64) -> Result<(), DriverError> {
        let cmd = control::RejectImageCommand::decode(buffer)
            .map_err(|e| DriverError::control(ErrorCode::MalformedCommand, e.to_string()))?;

        let Some(entry) = self
            .images
            .iter_mut()
            .find(|i| i.correlation_id == cmd.image_correlation_id)
        else {
            return Err(DriverError::control(
                ErrorCode::GenericError,
                format!("unknown image: {}", cmd.image_correlation_id),
            ));
        };

        info!(
            correlation_id = cmd.image_correlation_id,
            reason = %cmd.reason,
            "image rejected by client"
        );
        entry.lifecycle = Lifecycle::AwaitingRelease;
        entry.time_of_last_state_change_ns = now_ns;
        let correlation_id = entry.correlation_id;
        self.system_counters.images_rejected.increment();
        let _ = self
            .receiver_proxy
            .offer(ReceiverCmd::RemoveImage { correlation_id });
        self.client_proxy.on_operation_success(cmd.correlation_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Image creation (receiver handshake)
    // -----------------------------------------------------------------------

    pub(crate) fn on_create_publication_image(
        &mut self,
        request: ImageCreationRequest,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        // Find the subscriptions that want this stream.
        let links: Vec<LinkInterest> = self
            .subscription_links
            .iter()
            .filter(|l| {
                matches!(l.kind, LinkKind::Network { endpoint_id } if endpoint_id == request.endpoint_id)
                    && l.stream_id == request.stream_id
                    && l.session_filter.map_or(true, |s| s == request.session_id)
            })
            .map(|l| LinkInterest {
                registration_id: l.registration_id,
                is_tether: l.is_tether,
                is_reliable: l.is_reliable,
                group_tag: l.group_tag,
                receiver_window: l.receiver_window,
                channel: l.channel.clone(),
            })
            .collect();
        if links.is_empty() {
            return Ok(());
        }

        let term_length = if request.term_length == 0 {
            self.config.term_buffer_length
        } else {
            request.term_length
        };
        cn_logbuffer::check_term_length(term_length)
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;

        let correlation_id = self.ring.next_correlation_id();
        let log_path = self.images_dir.join(format!("{correlation_id}.logbuffer"));
        let log = Arc::new(
            MappedRawLog::create(&log_path, term_length)
                .map_err(|e| DriverError::InvalidChannel(e.to_string()))?,
        );
        log_descriptor::initialize(
            &log.metadata_buffer(),
            correlation_id,
            request.initial_term_id,
            term_length,
            self.config.file_page_size,
            if request.mtu == 0 { self.config.mtu_length } else { request.mtu },
            request.session_id,
            request.stream_id,
        );

        let channel = links[0].channel.clone();
        let hwm_id = self.allocate_stream_counter(
            system_counters::RECEIVER_HWM_TYPE_ID,
            "rcv-hwm",
            correlation_id,
            request.session_id,
            request.stream_id,
            &channel,
        )?;
        let rebuild_id = self.allocate_stream_counter(
            system_counters::RECEIVER_POSITION_TYPE_ID,
            "rcv-pos",
            correlation_id,
            request.session_id,
            request.stream_id,
            &channel,
        )?;

        let position_bits = log_descriptor::position_bits_to_shift(term_length);
        let join_position = log_descriptor::compute_position(
            request.active_term_id,
            request.term_offset,
            position_bits,
            request.initial_term_id,
        );

        let is_reliable = links.iter().all(|l| l.is_reliable);
        let group_tag = links.iter().find_map(|l| l.group_tag);

        let mut positions = Vec::new();
        let mut announcements = Vec::new();
        let log_file = log.path().display().to_string();
        for link in &links {
            let counter_id = self.allocate_stream_counter(
                system_counters::SUBSCRIBER_POSITION_TYPE_ID,
                "sub-pos",
                link.registration_id,
                request.session_id,
                request.stream_id,
                &channel,
            )?;
            let counter = self.counters_manager.counter(counter_id);
            counter.set_ordered(join_position);
            positions.push(SubscriberPosition {
                subscription_registration_id: link.registration_id,
                counter,
                is_tether: link.is_tether,
                tether_state: TetherState::Active,
                time_of_last_tether_change_ns: now_ns,
            });
            announcements.push((link.registration_id, counter_id));
        }
        let subscriber_positions = Arc::new(Mutex::new(positions));

        // An explicit `rcv-wnd=` on a subscribing channel wins (the
        // smallest across subscribers, validated by congestion control);
        // otherwise fall back to the configured default clamped to half
        // the term.
        let window = match links.iter().filter_map(|l| l.receiver_window).min() {
            Some(requested) => requested,
            None => self.config.initial_window_length.min(term_length / 2),
        };
        let congestion = StaticWindowCongestionControl::new(window, term_length)
            .map_err(DriverError::InvalidChannel)?;

        let is_multicast = self
            .receive_endpoints
            .iter()
            .find(|e| e.endpoint_id == request.endpoint_id)
            .is_some_and(|e| e.is_multicast);
        let loss_detector = if is_multicast {
            LossDetector::new(
                Box::new(MulticastBackoffDelayGenerator::new(
                    self.config.nak_multicast_max_backoff_ns,
                )),
                self.config.nak_unicast_retry_delay_ns,
            )
        } else {
            LossDetector::new(
                Box::new(StaticDelayGenerator::new(self.config.nak_unicast_delay_ns)),
                self.config.nak_unicast_retry_delay_ns,
            )
        };

        let shared = Arc::new(ImageSharedState::new(now_ns));
        shared.set_state(IMAGE_STATE_ACTIVE, now_ns);

        let receiver_id = self
            .receive_endpoints
            .iter()
            .find(|e| e.endpoint_id == request.endpoint_id)
            .map_or(0, |e| e.endpoint_id as i64);

        let image = PublicationImage::new(
            correlation_id,
            request.session_id,
            request.stream_id,
            request.initial_term_id,
            request.active_term_id,
            request.term_offset,
            request.endpoint_id,
            request.control_address,
            request.source_identity.clone(),
            Arc::clone(&log),
            self.counters_manager.counter(hwm_id),
            self.counters_manager.counter(rebuild_id),
            Arc::clone(&subscriber_positions),
            loss_detector,
            Box::new(congestion),
            receiver_id,
            is_reliable,
            group_tag,
            self.config.status_message_timeout_ns,
            Arc::clone(&shared),
        );

        info!(
            correlation_id,
            session_id = request.session_id,
            stream_id = request.stream_id,
            source = %request.source_identity,
            "publication image created"
        );

        self.images.push(ImageEntry {
            correlation_id,
            session_id: request.session_id,
            stream_id: request.stream_id,
            endpoint_id: request.endpoint_id,
            channel,
            source_identity: request.source_identity.clone(),
            log,
            shared,
            subscriber_positions,
            hwm_position: self.counters_manager.counter(hwm_id),
            rebuild_position: self.counters_manager.counter(rebuild_id),
            receiver_window_length: window,
            lifecycle: Lifecycle::Active,
            time_of_last_state_change_ns: now_ns,
            loss_entry: None,
            last_loss_bytes: 0,
        });

        // Hand the image to the Receiver before announcing it: a client
        // reacting to the announcement must find the driver ready for the
        // stream's data.
        if self
            .receiver_proxy
            .offer(ReceiverCmd::NewPublicationImage(Box::new(image)))
            .is_err()
        {
            return Err(DriverError::control(
                ErrorCode::ResourceTemporarilyUnavailable,
                "receiver command queue is full",
            ));
        }
        for (subscriber_registration_id, counter_id) in announcements {
            self.client_proxy.on_available_image(
                correlation_id,
                request.session_id,
                request.stream_id,
                subscriber_registration_id,
                counter_id,
                &log_file,
                &request.source_identity,
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    fn get_or_create_send_endpoint(&mut self, channel: &UdpChannel) -> Result<usize, DriverError> {
        if let Some(entry) = self
            .send_endpoints
            .iter_mut()
            .find(|e| e.canonical_form == channel.canonical_form)
        {
            entry.ref_count += 1;
            return Ok(entry.endpoint_id);
        }

        let endpoint_id = self.next_endpoint_id;
        self.next_endpoint_id += 1;

        let bind_addr: SocketAddr = match channel.uri.interface() {
            Some(_) => channel.local_data,
            None => "0.0.0.0:0".parse().unwrap(),
        };
        let transport = Arc::new(
            UdpTransport::bind(
                bind_addr,
                None,
                channel.ttl.max(self.config.socket_multicast_ttl),
                self.config.socket_sndbuf,
                self.config.socket_rcvbuf,
            )
            .map_err(|e| DriverError::ChannelEndpoint(e.to_string()))?,
        );

        let status_id = self
            .counters_manager
            .allocate(
                system_counters::SEND_CHANNEL_STATUS_TYPE_ID,
                &[],
                &format!("snd-channel: {}", channel.canonical_form),
                self.now_ms,
            )
            .map_err(|e| DriverError::ChannelEndpoint(e.to_string()))?;

        let endpoint = SendChannelEndpoint::new(
            endpoint_id,
            channel.canonical_form.clone(),
            transport,
            channel.is_multicast,
            channel.remote_data,
            self.counters_manager.counter(status_id),
        );

        if self
            .sender_proxy
            .offer(SenderCmd::RegisterEndpoint(Box::new(endpoint)))
            .is_err()
        {
            self.counters_manager.free(status_id, self.now_ms);
            return Err(DriverError::control(
                ErrorCode::ResourceTemporarilyUnavailable,
                "sender command queue is full",
            ));
        }

        self.send_endpoints.push(EndpointEntry {
            endpoint_id,
            canonical_form: channel.canonical_form.clone(),
            status_counter_id: status_id,
            ref_count: 1,
            is_multicast: channel.is_multicast,
        });
        Ok(endpoint_id)
    }

    fn get_or_create_receive_endpoint(&mut self, channel_str: &str) -> Result<usize, DriverError> {
        let resolver = Arc::clone(&self.resolver);
        let channel = UdpChannel::parse(channel_str, resolver.as_ref())?;

        if let Some(entry) = self
            .receive_endpoints
            .iter_mut()
            .find(|e| e.canonical_form == channel.canonical_form)
        {
            entry.ref_count += 1;
            return Ok(entry.endpoint_id);
        }

        let endpoint_id = self.next_endpoint_id;
        self.next_endpoint_id += 1;

        let transport = Arc::new(
            UdpTransport::bind(
                channel.receive_bind_address(),
                channel
                    .is_multicast
                    .then(|| channel.remote_data.unwrap().ip()),
                channel.ttl,
                self.config.socket_sndbuf,
                self.config.socket_rcvbuf,
            )
            .map_err(|e| DriverError::ChannelEndpoint(e.to_string()))?,
        );

        let status_id = self
            .counters_manager
            .allocate(
                system_counters::RECEIVE_CHANNEL_STATUS_TYPE_ID,
                &[],
                &format!("rcv-channel: {}", channel.canonical_form),
                self.now_ms,
            )
            .map_err(|e| DriverError::ChannelEndpoint(e.to_string()))?;

        let endpoint = ReceiveChannelEndpoint::new(
            endpoint_id,
            channel.canonical_form.clone(),
            transport,
            endpoint_id as i64,
            self.counters_manager.counter(status_id),
        );

        if self
            .receiver_proxy
            .offer(ReceiverCmd::RegisterEndpoint(Box::new(endpoint)))
            .is_err()
        {
            self.counters_manager.free(status_id, self.now_ms);
            return Err(DriverError::control(
                ErrorCode::ResourceTemporarilyUnavailable,
                "receiver command queue is full",
            ));
        }

        self.receive_endpoints.push(EndpointEntry {
            endpoint_id,
            canonical_form: channel.canonical_form.clone(),
            status_counter_id: status_id,
            ref_count: 1,
            is_multicast: channel.is_multicast,
        });
        Ok(endpoint_id)
    }

    pub(crate) fn release_send_endpoint_ref(&mut self, endpoint_id: usize) {
        if let Some(slot) = self
            .send_endpoints
            .iter()
            .position(|e| e.endpoint_id == endpoint_id)
        {
            let entry = &mut self.send_endpoints[slot];
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                let _ = self.sender_proxy.offer(SenderCmd::CloseEndpoint { endpoint_id });
                self.send_endpoints.swap_remove(slot);
            }
        }
    }

    pub(crate) fn release_receive_endpoint_ref(&mut self, endpoint_id: usize) {
        if let Some(slot) = self
            .receive_endpoints
            .iter()
            .position(|e| e.endpoint_id == endpoint_id)
        {
            let entry = &mut self.receive_endpoints[slot];
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                let _ = self
                    .receiver_proxy
                    .offer(ReceiverCmd::CloseEndpoint { endpoint_id });
                self.receive_endpoints.swap_remove(slot);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Allocate a session id, refusing a clash on the requested one.
    fn allocate_session_id<F>(
        &mut self,
        stream_id: i32,
        explicit: Option<i32>,
        in_use: F,
    ) -> Result<i32, DriverError>
    where
        F: Fn(&Self, i32, i32) -> bool,
    {
        match explicit {
            Some(session_id) => {
                if in_use(self, stream_id, session_id) {
                    return Err(DriverError::InvalidChannel(format!(
                        "existing publication has clashing sessionId={session_id}"
                    )));
                }
                Ok(session_id)
            }
            None => {
                let mut candidate = self.next_session_id;
                for _ in 0..1024 {
                    if !in_use(self, stream_id, candidate) {
                        self.next_session_id = candidate.wrapping_add(1);
                        return Ok(candidate);
                    }
                    candidate = candidate.wrapping_add(1);
                }
                Err(DriverError::control(
                    ErrorCode::GenericError,
                    "unable to allocate a session id",
                ))
            }
        }
    }

    fn next_initial_term_id(&mut self) -> i32 {
        rand::Rng::gen(&mut rand::thread_rng())
    }

    pub(crate) fn allocate_stream_counter(
        &mut self,
        type_id: i32,
        name: &str,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        channel: &str,
    ) -> Result<i32, DriverError> {
        let label = stream_counter_label(name, registration_id, session_id, stream_id, channel);
        let counter_id = self
            .counters_manager
            .allocate(type_id, &registration_id.to_le_bytes(), &label, self.now_ms)
            .map_err(|e| DriverError::control(ErrorCode::GenericError, e.to_string()))?;
        self.counters_manager
            .set_registration_id(counter_id, registration_id);
        Ok(counter_id)
    }
}

/// Snapshot of a subscription link's interest in a new image.
struct LinkInterest {
    registration_id: i64,
    is_tether: bool,
    is_reliable: bool,
    group_tag: Option<i64>,
    receiver_window: Option<usize>,
    channel: String,
}

/// Producer position for a conductor-side network publication entry.
pub(crate) fn producer_position_of(entry: &NetworkPublicationEntry) -> i64 {
    let meta = entry.log.metadata_buffer();
    let term_count = log_descriptor::active_term_count(&meta);
    let index = log_descriptor::index_by_term_count(term_count);
    let raw = log_descriptor::raw_tail_volatile(&meta, index);
    log_descriptor::compute_position(
        log_descriptor::term_id_from_raw_tail(raw),
        log_descriptor::term_offset_from_raw_tail(raw, entry.log.term_length()),
        entry.position_bits,
        entry.initial_term_id,
    )
}
