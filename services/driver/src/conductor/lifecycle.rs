//! Timers, liveness, and resource lifecycle.
//!
//! Runs on the Conductor's timer interval: client liveness, publication
//! and image state machines, blocked-publisher recovery, untethered
//! subscriber transitions, loss-report updates, and the to-driver ring
//! unblock check.  Frees are bounded per tick so a mass teardown cannot
//! stall the duty cycle.

use std::sync::atomic::Ordering;

use cn_logbuffer::descriptor as log_descriptor;
use tracing::{debug, info, warn};

use super::commands::producer_position_of;
use super::types::*;
use crate::image::{PublicationImage, SubscriberPosition, TetherState};
use crate::ipc_publication::IpcPublicationState;
use crate::proxy::{ReceiverCmd, SenderCmd};
use crate::publication::NetworkPublication;

/// Resources fully freed per timer tick.
const FREE_LIMIT_PER_TICK: usize = 10;

/// Deferred client-proxy notification gathered while positions are locked.
enum TetherEvent {
    Unavailable {
        correlation_id: i64,
        subscriber_registration_id: i64,
        stream_id: i32,
        channel: String,
    },
    Available {
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        subscriber_registration_id: i64,
        counter_id: i32,
        log_file: String,
        source_identity: String,
    },
}

impl super::DriverConductor {
    // -----------------------------------------------------------------------
    // Per-cycle position tracking
    // -----------------------------------------------------------------------

    pub(crate) fn track_stream_positions(&mut self, now_ns: i64) -> usize {
        let mut work = 0;

        for slot in 0..self.ipc_publications.len() {
            let publication = &mut self.ipc_publications[slot];
            work += publication.update_publisher_limit();
            publication.update_publisher_position(now_ns);
        }

        for slot in 0..self.network_publications.len() {
            let entry = &mut self.network_publications[slot];
            if entry.lifecycle != Lifecycle::Active {
                continue;
            }

            let sender_position = entry.sender_position.get_volatile();
            let has_receivers = entry.shared.has_receivers();
            let has_spies = !entry.spy_positions.is_empty();

            let mut consumer = sender_position;
            for spy in entry.spy_positions.iter().filter(|p| p.drives_consumption()) {
                consumer = consumer.min(spy.counter.get_volatile());
            }

            let connected =
                has_receivers || (has_spies && self.config.spies_simulate_connection);
            log_descriptor::set_is_connected(&entry.log.metadata_buffer(), connected);

            clean_ahead(entry, sender_position);

            if connected || has_spies {
                // Claims may overshoot the limit by one max-length message;
                // keep a margin inside the cleaned region.
                let term_length = entry.log.term_length();
                let cap = entry.cleaned_limit - (term_length / 8) as i64;
                let proposed = (consumer + entry.term_window_length as i64).min(cap);
                if entry.publisher_limit.propose_max_ordered(proposed) {
                    work += 1;
                }
            }
        }

        work
    }

    // -----------------------------------------------------------------------
    // Timer tick
    // -----------------------------------------------------------------------

    pub(crate) fn on_timer_tick(&mut self, now_ns: i64) -> usize {
        self.ring.update_consumer_heartbeat(self.now_ms);

        let mut work = 1;
        work += self.check_clients(now_ns);
        work += self.check_network_publications(now_ns);
        work += self.check_ipc_publications(now_ns);
        work += self.check_images(now_ns);
        work += self.check_ring_unblock();
        work
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    fn check_clients(&mut self, now_ns: i64) -> usize {
        let timeout_ms = self.config.client_liveness_timeout_ns / 1_000_000;
        let now_ms = self.now_ms;
        let mut work = 0;

        let mut slot = 0;
        while slot < self.clients.len() {
            let client = &self.clients[slot];
            if client.closed_by_command {
                let client = self.clients.swap_remove(slot);
                self.counters_manager
                    .free(client.heartbeat_counter_id, now_ms);
                info!(client_id = client.client_id, "client closed");
                work += 1;
                continue;
            }
            if now_ms - client.time_of_last_keepalive_ms > timeout_ms {
                let client = self.clients.swap_remove(slot);
                warn!(client_id = client.client_id, "client liveness timeout");
                self.close_client_resources(client.client_id, now_ns);
                self.counters_manager
                    .free(client.heartbeat_counter_id, now_ms);
                self.system_counters.client_timeouts.increment();
                self.client_proxy.on_client_timeout(client.client_id);
                work += 1;
                continue;
            }
            slot += 1;
        }
        work
    }

    // -----------------------------------------------------------------------
    // Network publications
    // -----------------------------------------------------------------------

    fn check_network_publications(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let mut to_remove: Vec<i64> = Vec::new();

        for slot in 0..self.network_publications.len() {
            let entry = &mut self.network_publications[slot];
            let producer = producer_position_of(entry);
            let sender_position = entry.sender_position.get_volatile();

            match entry.lifecycle {
                Lifecycle::Active => {
                    // Blocked-publisher detection: the sender is stuck behind
                    // an uncommitted claim.
                    if sender_position != entry.last_producer_position {
                        entry.last_producer_position = sender_position;
                        entry.time_of_last_producer_change_ns = now_ns;
                    } else if producer > sender_position
                        && now_ns - entry.time_of_last_producer_change_ns
                            > self.config.publication_unblock_timeout_ns
                    {
                        if unblock_network_publication(entry, sender_position) {
                            entry.time_of_last_producer_change_ns = now_ns;
                            self.system_counters.unblocked_publications.increment();
                            work += 1;
                        }
                    }
                }
                Lifecycle::Draining => {
                    if sender_position >= producer {
                        entry.lifecycle = Lifecycle::Linger {
                            deadline_ns: now_ns + self.config.publication_linger_timeout_ns,
                        };
                        entry.time_of_last_state_change_ns = now_ns;
                        work += 1;
                    }
                }
                Lifecycle::Linger { deadline_ns } => {
                    if now_ns >= deadline_ns {
                        let registration_id = entry.registration_id;
                        entry.lifecycle = Lifecycle::AwaitingRelease;
                        entry.time_of_last_state_change_ns = now_ns;
                        to_remove.push(registration_id);
                        work += 1;
                    }
                }
                Lifecycle::AwaitingRelease => {}
            }
        }

        for registration_id in to_remove {
            let _ = self
                .sender_proxy
                .offer(SenderCmd::RemovePublication { registration_id });
        }
        work
    }

    /// The Sender surrendered a publication: free everything it referenced.
    pub(crate) fn on_publication_released(
        &mut self,
        publication: Box<NetworkPublication>,
        now_ns: i64,
    ) {
        let registration_id = publication.registration_id;
        debug!(registration_id, "network publication released by sender");

        let Some(slot) = self
            .network_publications
            .iter()
            .position(|p| p.registration_id == registration_id)
        else {
            return;
        };
        let entry = self.network_publications.swap_remove(slot);

        for spy in &entry.spy_positions {
            self.client_proxy.on_unavailable_image(
                entry.registration_id,
                spy.subscription_registration_id,
                entry.stream_id,
                &entry.channel,
            );
            self.counters_manager.free(spy.counter.id(), self.now_ms);
        }
        self.counters_manager
            .free(entry.publisher_limit.id(), self.now_ms);
        self.counters_manager
            .free(entry.sender_position.id(), self.now_ms);
        self.counters_manager
            .free(entry.sender_limit.id(), self.now_ms);
        self.release_send_endpoint_ref(entry.endpoint_id);

        if let Err(e) = entry.log.delete_file() {
            self.record_error(&format!(
                "deleting publication log {registration_id}: {e}"
            ));
        }
        let _ = now_ns;
        drop(publication);
    }

    // -----------------------------------------------------------------------
    // IPC publications
    // -----------------------------------------------------------------------

    fn check_ipc_publications(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let mut freed = 0;
        let mut events = Vec::new();

        let mut slot = 0;
        while slot < self.ipc_publications.len() {
            let config_window_limit = self.config.untethered_window_limit_timeout_ns;
            let config_linger = self.config.untethered_linger_timeout_ns;
            let config_resting = self.config.untethered_resting_timeout_ns;

            let publication = &mut self.ipc_publications[slot];
            match publication.state {
                IpcPublicationState::Active => {
                    if publication.check_for_blocked_publisher(now_ns) {
                        self.system_counters.unblocked_publications.increment();
                        work += 1;
                    }
                    let producer = publication.producer_position();
                    let window = publication.subscriber_window();
                    let correlation_id = publication.registration_id;
                    let session_id = publication.session_id;
                    let stream_id = publication.stream_id;
                    let channel = publication.channel.clone();
                    let log_file = publication.log().path().display().to_string();
                    transition_untethered(
                        publication.subscriber_positions_mut(),
                        producer,
                        window,
                        now_ns,
                        config_window_limit,
                        config_linger,
                        config_resting,
                        correlation_id,
                        session_id,
                        stream_id,
                        &channel,
                        &log_file,
                        "aeron:ipc",
                        &mut events,
                    );
                }
                IpcPublicationState::Draining => {
                    if publication.is_drained() {
                        publication.state = IpcPublicationState::Linger;
                        publication.time_of_last_state_change_ns = now_ns;
                        work += 1;
                    }
                }
                IpcPublicationState::Linger => {
                    if now_ns - publication.time_of_last_state_change_ns
                        >= self.config.publication_linger_timeout_ns
                    {
                        publication.state = IpcPublicationState::Done;
                        work += 1;
                    }
                }
                IpcPublicationState::Done => {
                    if freed < FREE_LIMIT_PER_TICK {
                        let publication = self.ipc_publications.swap_remove(slot);
                        self.free_ipc_publication(publication);
                        freed += 1;
                        work += 1;
                        continue;
                    }
                }
            }
            slot += 1;
        }

        self.emit_tether_events(events);
        work
    }

    fn free_ipc_publication(&mut self, publication: crate::ipc_publication::IpcPublication) {
        info!(
            registration_id = publication.registration_id,
            "ipc publication freed"
        );
        for position in publication.subscriber_positions() {
            self.client_proxy.on_unavailable_image(
                publication.registration_id,
                position.subscription_registration_id,
                publication.stream_id,
                &publication.channel,
            );
            self.counters_manager
                .free(position.counter.id(), self.now_ms);
        }
        self.counters_manager
            .free(publication.publisher_limit_counter_id(), self.now_ms);
        if let Err(e) = publication.log().delete_file() {
            self.record_error(&format!(
                "deleting ipc publication log {}: {e}",
                publication.registration_id
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Images
    // -----------------------------------------------------------------------

    fn check_images(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let mut freed = 0;
        let mut to_remove: Vec<i64> = Vec::new();
        let mut events = Vec::new();

        let mut slot = 0;
        while slot < self.images.len() {
            let config_window_limit = self.config.untethered_window_limit_timeout_ns;
            let config_linger = self.config.untethered_linger_timeout_ns;
            let config_resting = self.config.untethered_resting_timeout_ns;
            let liveness_timeout = self.config.image_liveness_timeout_ns;

            let entry = &mut self.images[slot];
            match entry.lifecycle {
                Lifecycle::Active => {
                    // Loss report: pull the receiver's observed gap bytes.
                    let observed = entry.shared.loss_bytes_observed.load(Ordering::Acquire);
                    let delta = observed - entry.last_loss_bytes;
                    if delta > 0 {
                        entry.last_loss_bytes = observed;
                        match entry.loss_entry {
                            Some(handle) => {
                                self.loss_report.record_observation(handle, delta, self.now_ms);
                            }
                            None => {
                                entry.loss_entry = self.loss_report.create_entry(
                                    delta,
                                    self.now_ms,
                                    entry.session_id,
                                    entry.stream_id,
                                    &entry.channel,
                                    &entry.source_identity,
                                );
                            }
                        }
                        work += 1;
                    }

                    let last_packet =
                        entry.shared.time_of_last_packet_ns.load(Ordering::Acquire);
                    let is_eos = entry.shared.is_end_of_stream.load(Ordering::Acquire) == 1;
                    let eos_position = entry.shared.eos_position.load(Ordering::Acquire);
                    let all_past_eos = is_eos && {
                        let positions = entry
                            .subscriber_positions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        positions
                            .iter()
                            .filter(|p| p.drives_consumption())
                            .all(|p| p.counter.get_volatile() >= eos_position)
                    };

                    if all_past_eos || now_ns - last_packet > liveness_timeout {
                        entry.lifecycle = Lifecycle::AwaitingRelease;
                        entry.time_of_last_state_change_ns = now_ns;
                        to_remove.push(entry.correlation_id);
                        work += 1;
                    } else {
                        let rebuild = entry.rebuild_position.get_volatile();
                        let window = entry.receiver_window_length;
                        let correlation_id = entry.correlation_id;
                        let session_id = entry.session_id;
                        let stream_id = entry.stream_id;
                        let channel = entry.channel.clone();
                        let source = entry.source_identity.clone();
                        let log_file = entry.log.path().display().to_string();
                        let mut positions = entry
                            .subscriber_positions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        transition_untethered(
                            &mut positions,
                            rebuild,
                            window,
                            now_ns,
                            config_window_limit,
                            config_linger,
                            config_resting,
                            correlation_id,
                            session_id,
                            stream_id,
                            &channel,
                            &log_file,
                            &source,
                            &mut events,
                        );
                    }
                }
                Lifecycle::Draining | Lifecycle::AwaitingRelease => {}
                Lifecycle::Linger { deadline_ns } => {
                    if now_ns >= deadline_ns && freed < FREE_LIMIT_PER_TICK {
                        let entry = self.images.swap_remove(slot);
                        self.free_image(entry);
                        freed += 1;
                        work += 1;
                        continue;
                    }
                }
            }
            slot += 1;
        }

        for correlation_id in to_remove {
            let _ = self
                .receiver_proxy
                .offer(ReceiverCmd::RemoveImage { correlation_id });
        }
        self.emit_tether_events(events);
        work
    }

    /// The Receiver surrendered an image: notify subscribers and linger
    /// before freeing the log.
    pub(crate) fn on_image_released(&mut self, image: Box<PublicationImage>, now_ns: i64) {
        let correlation_id = image.correlation_id;
        debug!(correlation_id, "image released by receiver");

        if let Some(entry) = self
            .images
            .iter_mut()
            .find(|i| i.correlation_id == correlation_id)
        {
            entry.lifecycle = Lifecycle::Linger {
                deadline_ns: now_ns + self.config.publication_linger_timeout_ns,
            };
            entry.time_of_last_state_change_ns = now_ns;

            let events: Vec<(i64, i32, String)> = {
                let positions = entry
                    .subscriber_positions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                positions
                    .iter()
                    .map(|p| {
                        (
                            p.subscription_registration_id,
                            entry.stream_id,
                            entry.channel.clone(),
                        )
                    })
                    .collect()
            };
            for (subscriber_registration_id, stream_id, channel) in events {
                self.client_proxy.on_unavailable_image(
                    correlation_id,
                    subscriber_registration_id,
                    stream_id,
                    &channel,
                );
            }
        }
        drop(image);
    }

    fn free_image(&mut self, entry: ImageEntry) {
        info!(correlation_id = entry.correlation_id, "image freed");
        {
            let positions = entry
                .subscriber_positions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for position in positions.iter() {
                self.counters_manager
                    .free(position.counter.id(), self.now_ms);
            }
        }
        self.counters_manager
            .free(entry.hwm_position.id(), self.now_ms);
        self.counters_manager
            .free(entry.rebuild_position.id(), self.now_ms);
        if let Err(e) = entry.log.delete_file() {
            self.record_error(&format!(
                "deleting image log {}: {e}",
                entry.correlation_id
            ));
        }
    }

    fn emit_tether_events(&mut self, events: Vec<TetherEvent>) {
        for event in events {
            match event {
                TetherEvent::Unavailable {
                    correlation_id,
                    subscriber_registration_id,
                    stream_id,
                    channel,
                } => {
                    self.client_proxy.on_unavailable_image(
                        correlation_id,
                        subscriber_registration_id,
                        stream_id,
                        &channel,
                    );
                }
                TetherEvent::Available {
                    correlation_id,
                    session_id,
                    stream_id,
                    subscriber_registration_id,
                    counter_id,
                    log_file,
                    source_identity,
                } => {
                    self.client_proxy.on_available_image(
                        correlation_id,
                        session_id,
                        stream_id,
                        subscriber_registration_id,
                        counter_id,
                        &log_file,
                        &source_identity,
                    );
                }
            }
        }
    }
}

/// Zero the next recycled partition of a network publication once every
/// local reader is past it, keeping a cleaned term of runway ahead of the
/// producer.
fn clean_ahead(entry: &mut NetworkPublicationEntry, sender_position: i64) {
    let term_length = entry.log.term_length() as i64;
    if entry.cleaned_limit - producer_position_of(entry) >= term_length {
        return;
    }

    let mut min_reader = sender_position;
    for spy in entry
        .spy_positions
        .iter()
        .filter(|p| p.tether_state != TetherState::Resting)
    {
        min_reader = min_reader.min(spy.counter.get_volatile());
    }
    // The partition to zero holds [limit - 3T, limit - 2T).
    if min_reader + 2 * term_length < entry.cleaned_limit {
        return;
    }

    let index = log_descriptor::index_by_position(entry.cleaned_limit, entry.position_bits);
    let term = entry.log.term_buffer(index);
    term.set_memory(0, term_length as usize, 0);
    entry.cleaned_limit += term_length;
}

/// Pad over an uncommitted claim blocking a network publication's sender.
fn unblock_network_publication(entry: &mut NetworkPublicationEntry, sender_position: i64) -> bool {
    let index = log_descriptor::index_by_position(sender_position, entry.position_bits);
    let term = entry.log.term_buffer(index);
    let blocked_offset =
        log_descriptor::compute_term_offset_from_position(sender_position, entry.position_bits)
            as usize;

    let raw_tail = log_descriptor::raw_tail_volatile(&entry.log.metadata_buffer(), index);
    let term_id = log_descriptor::term_id_from_raw_tail(raw_tail);
    let tail_offset =
        log_descriptor::term_offset_from_raw_tail(raw_tail, entry.log.term_length()) as usize;

    cn_logbuffer::term_unblocker::unblock(
        &term,
        blocked_offset,
        tail_offset,
        term_id,
        entry.session_id,
        entry.stream_id,
    )
}

/// Walk untethered subscriber positions through
/// active -> linger -> resting -> rejoin.
#[allow(clippy::too_many_arguments)]
fn transition_untethered(
    positions: &mut Vec<SubscriberPosition>,
    stream_position: i64,
    window: usize,
    now_ns: i64,
    window_limit_timeout_ns: i64,
    linger_timeout_ns: i64,
    resting_timeout_ns: i64,
    correlation_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: &str,
    log_file: &str,
    source_identity: &str,
    events: &mut Vec<TetherEvent>,
) {
    for position in positions.iter_mut().filter(|p| !p.is_tether) {
        match position.tether_state {
            TetherState::Active => {
                let lagging =
                    stream_position - position.counter.get_volatile() > window as i64;
                if lagging
                    && now_ns - position.time_of_last_tether_change_ns > window_limit_timeout_ns
                {
                    position.tether_state = TetherState::Linger;
                    position.time_of_last_tether_change_ns = now_ns;
                    events.push(TetherEvent::Unavailable {
                        correlation_id,
                        subscriber_registration_id: position.subscription_registration_id,
                        stream_id,
                        channel: channel.to_owned(),
                    });
                } else if !lagging {
                    position.time_of_last_tether_change_ns = now_ns;
                }
            }
            TetherState::Linger => {
                if now_ns - position.time_of_last_tether_change_ns > linger_timeout_ns {
                    position.tether_state = TetherState::Resting;
                    position.time_of_last_tether_change_ns = now_ns;
                }
            }
            TetherState::Resting => {
                if now_ns - position.time_of_last_tether_change_ns > resting_timeout_ns {
                    // Rejoin at the live edge: the subscriber never observes
                    // bytes from before its rejoin point.
                    position.counter.set_ordered(stream_position);
                    position.tether_state = TetherState::Active;
                    position.time_of_last_tether_change_ns = now_ns;
                    events.push(TetherEvent::Available {
                        correlation_id,
                        session_id,
                        stream_id,
                        subscriber_registration_id: position.subscription_registration_id,
                        counter_id: position.counter.id(),
                        log_file: log_file.to_owned(),
                        source_identity: source_identity.to_owned(),
                    });
                }
            }
        }
    }
}
