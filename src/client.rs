//! Client attachment to a running driver.
//!
//! # Protocol
//! 1. Map `cnc.dat` in the driver directory; verify the version.
//! 2. Allocate a client id from the ring's correlation counter.
//! 3. Write commands into the to-driver ring; each carries a fresh
//!    correlation id.
//! 4. Poll the to-clients broadcast for the response, bounded by the
//!    driver timeout.
//! 5. Send `ClientKeepalive` periodically from [`Client::do_work`].
//!
//! Blocking waits only ever block the calling client thread; the driver
//! is never waited on inline.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cn_concurrent::broadcast::{BroadcastReceiver, CopyBroadcastReceiver};
use cn_concurrent::cnc::{CncError, CncFile};
use cn_concurrent::ring_buffer::{ManyToOneRingBuffer, RingBufferError};
use cn_concurrent::time::EpochClock;
use cn_concurrent::{AtomicBuffer, AtomicCounter};
use cn_logbuffer::log::RawLogError;
use cn_logbuffer::MappedRawLog;
use cn_protocol::{control, ErrorCode};
use tracing::{debug, warn};

use crate::publication::Publication;
use crate::subscription::{Image, Subscription, SubscriptionState};

/// Interval between keepalives written to the driver.
const KEEPALIVE_INTERVAL_MS: i64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Cnc(#[from] CncError),
    #[error(transparent)]
    Ring(#[from] RingBufferError),
    #[error(transparent)]
    Log(#[from] RawLogError),
    #[error("driver did not respond within {0} ms")]
    DriverTimeout(i64),
    #[error("driver rejected command: {code}: {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("unexpected driver event {0:#x}")]
    UnexpectedEvent(i32),
}

/// A client attached to one driver instance.
pub struct Client {
    #[allow(dead_code)]
    cnc: CncFile,
    ring: ManyToOneRingBuffer,
    broadcast: CopyBroadcastReceiver,
    counters_values: AtomicBuffer,
    client_id: i64,
    driver_timeout_ms: i64,
    next_keepalive_ms: i64,
    subscriptions: Vec<Arc<Mutex<SubscriptionState>>>,
    scratch: Vec<u8>,
}

impl Client {
    /// Attach to the driver running in `dir`.
    pub fn connect(dir: &Path) -> Result<Client, ClientError> {
        let cnc = CncFile::open(dir)?;
        let ring = ManyToOneRingBuffer::new(cnc.to_driver_buffer())?;
        let broadcast = CopyBroadcastReceiver::new(
            BroadcastReceiver::new(cnc.to_clients_buffer())
                .expect("cnc broadcast section validated by driver"),
        );
        let counters_values = cnc.counters_values_buffer();
        let client_id = ring.next_correlation_id();
        let driver_timeout_ms = cnc.client_liveness_timeout_ns() / 1_000_000;

        debug!(client_id, dir = %dir.display(), "client attached");
        Ok(Client {
            cnc,
            ring,
            broadcast,
            counters_values,
            client_id,
            driver_timeout_ms,
            next_keepalive_ms: 0,
            subscriptions: Vec::new(),
            scratch: Vec::with_capacity(256),
        })
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Periodic housekeeping: keepalives and event routing.  Call this
    /// from the application loop; command waits also drive it.
    pub fn do_work(&mut self) -> usize {
        let now_ms = EpochClock::millis();
        let mut work = 0;
        if now_ms >= self.next_keepalive_ms {
            self.send_keepalive();
            self.next_keepalive_ms = now_ms + KEEPALIVE_INTERVAL_MS;
            work += 1;
        }
        work + self.drain_events().len()
    }

    fn send_keepalive(&mut self) {
        self.scratch.clear();
        control::CorrelatedCommand {
            client_id: self.client_id,
            correlation_id: 0,
        }
        .encode(&mut self.scratch);
        let command = std::mem::take(&mut self.scratch);
        if let Err(e) = self.ring.write(control::CLIENT_KEEPALIVE, &command) {
            warn!(error = %e, "keepalive write failed");
        }
        self.scratch = command;
    }

    /// Gracefully detach, releasing driver-side resources.
    pub fn close(mut self) {
        self.scratch.clear();
        control::CorrelatedCommand {
            client_id: self.client_id,
            correlation_id: 0,
        }
        .encode(&mut self.scratch);
        let command = std::mem::take(&mut self.scratch);
        let _ = self.ring.write(control::CLIENT_CLOSE, &command);
    }

    // -----------------------------------------------------------------------
    // Publications
    // -----------------------------------------------------------------------

    pub fn add_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, ClientError> {
        self.add_publication_with(channel, stream_id, false)
    }

    pub fn add_exclusive_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, ClientError> {
        self.add_publication_with(channel, stream_id, true)
    }

    fn add_publication_with(
        &mut self,
        channel: &str,
        stream_id: i32,
        is_exclusive: bool,
    ) -> Result<Publication, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        self.scratch.clear();
        control::PublicationCommand {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_owned(),
        }
        .encode(&mut self.scratch);
        let msg_type = if is_exclusive {
            control::ADD_EXCLUSIVE_PUBLICATION
        } else {
            control::ADD_PUBLICATION
        };
        let command = std::mem::take(&mut self.scratch);
        self.ring.write(msg_type, &command)?;
        self.scratch = command;

        let (event_type, event) = self.await_response(correlation_id)?;
        match event_type {
            control::ON_PUBLICATION_READY | control::ON_EXCLUSIVE_PUBLICATION_READY => {
                let ready = control::PublicationReady::decode(&event)
                    .map_err(|_| ClientError::UnexpectedEvent(event_type))?;
                let log = Arc::new(MappedRawLog::open(Path::new(&ready.log_file))?);
                let limit =
                    AtomicCounter::new(self.counters_values, ready.position_limit_counter_id);
                Ok(Publication::new(
                    ready.registration_id,
                    ready.session_id,
                    ready.stream_id,
                    log,
                    limit,
                ))
            }
            other => Err(ClientError::UnexpectedEvent(other)),
        }
    }

    /// Release a publication handle on the driver.
    pub fn remove_publication(&mut self, registration_id: i64) -> Result<(), ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        self.scratch.clear();
        control::RemoveCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        }
        .encode(&mut self.scratch);
        let command = std::mem::take(&mut self.scratch);
        self.ring.write(control::REMOVE_PUBLICATION, &command)?;
        self.scratch = command;

        match self.await_response(correlation_id)? {
            (control::ON_OPERATION_SUCCESS, _) => Ok(()),
            (other, _) => Err(ClientError::UnexpectedEvent(other)),
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Subscription, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        self.scratch.clear();
        control::SubscriptionCommand {
            client_id: self.client_id,
            correlation_id,
            registration_correlation_id: -1,
            stream_id,
            channel: channel.to_owned(),
        }
        .encode(&mut self.scratch);
        let command = std::mem::take(&mut self.scratch);
        self.ring.write(control::ADD_SUBSCRIPTION, &command)?;
        self.scratch = command;

        // Register before awaiting so an immediately-available image is
        // routed rather than dropped.
        let state = Arc::new(Mutex::new(SubscriptionState::new(correlation_id)));
        self.subscriptions.push(Arc::clone(&state));

        match self.await_response(correlation_id) {
            Ok((control::ON_SUBSCRIPTION_READY, _)) => {
                Ok(Subscription::new(correlation_id, state))
            }
            Ok((other, _)) => {
                self.forget_subscription(correlation_id);
                Err(ClientError::UnexpectedEvent(other))
            }
            Err(e) => {
                self.forget_subscription(correlation_id);
                Err(e)
            }
        }
    }

    pub fn remove_subscription(&mut self, registration_id: i64) -> Result<(), ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        self.scratch.clear();
        control::RemoveCommand {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        }
        .encode(&mut self.scratch);
        let command = std::mem::take(&mut self.scratch);
        self.ring.write(control::REMOVE_SUBSCRIPTION, &command)?;
        self.scratch = command;
        self.forget_subscription(registration_id);

        match self.await_response(correlation_id)? {
            (control::ON_OPERATION_SUCCESS, _) => Ok(()),
            (other, _) => Err(ClientError::UnexpectedEvent(other)),
        }
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Allocate a user counter in the driver's counters file.  Returns the
    /// counter id.
    pub fn add_counter(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
    ) -> Result<i32, ClientError> {
        let correlation_id = self.ring.next_correlation_id();
        self.scratch.clear();
        control::CounterCommand {
            client_id: self.client_id,
            correlation_id,
            type_id,
            registration_id: -1,
            key: key.to_vec(),
            label: label.to_owned(),
        }
        .encode(&mut self.scratch);
        let command = std::mem::take(&mut self.scratch);
        self.ring.write(control::ADD_COUNTER, &command)?;
        self.scratch = command;

        match self.await_response(correlation_id)? {
            (control::ON_COUNTER_READY, event) => {
                let update = control::CounterUpdate::decode(&event)
                    .map_err(|_| ClientError::UnexpectedEvent(control::ON_COUNTER_READY))?;
                Ok(update.counter_id)
            }
            (other, _) => Err(ClientError::UnexpectedEvent(other)),
        }
    }

    fn forget_subscription(&mut self, registration_id: i64) {
        self.subscriptions.retain(|s| {
            s.lock().unwrap_or_else(|e| e.into_inner()).registration_id != registration_id
        });
    }

    // -----------------------------------------------------------------------
    // Event plumbing
    // -----------------------------------------------------------------------

    /// Poll the broadcast until the response for `correlation_id` arrives.
    fn await_response(&mut self, correlation_id: i64) -> Result<(i32, Vec<u8>), ClientError> {
        let deadline = EpochClock::millis() + self.driver_timeout_ms;
        loop {
            for (event_type, event) in self.drain_events() {
                if let Some(matched) = self.match_response(correlation_id, event_type, &event)? {
                    return Ok(matched);
                }
            }
            if EpochClock::millis() > deadline {
                return Err(ClientError::DriverTimeout(self.driver_timeout_ms));
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn match_response(
        &mut self,
        correlation_id: i64,
        event_type: i32,
        event: &[u8],
    ) -> Result<Option<(i32, Vec<u8>)>, ClientError> {
        let matches = match event_type {
            control::ON_PUBLICATION_READY | control::ON_EXCLUSIVE_PUBLICATION_READY => {
                control::PublicationReady::decode(event)
                    .map(|e| e.correlation_id == correlation_id)
                    .unwrap_or(false)
            }
            control::ON_SUBSCRIPTION_READY => control::SubscriptionReady::decode(event)
                .map(|e| e.correlation_id == correlation_id)
                .unwrap_or(false),
            control::ON_OPERATION_SUCCESS => control::OperationSucceeded::decode(event)
                .map(|e| e.correlation_id == correlation_id)
                .unwrap_or(false),
            control::ON_NEXT_AVAILABLE_SESSION_ID => {
                control::NextSessionIdResponse::decode(event)
                    .map(|e| e.correlation_id == correlation_id)
                    .unwrap_or(false)
            }
            control::ON_COUNTER_READY | control::ON_STATIC_COUNTER => {
                control::CounterUpdate::decode(event)
                    .map(|e| e.correlation_id == correlation_id)
                    .unwrap_or(false)
            }
            control::ON_ERROR => {
                if let Ok(error) = control::ErrorResponse::decode(event) {
                    if error.offending_correlation_id == correlation_id {
                        return Err(ClientError::Rejected {
                            code: ErrorCode::from_i32(error.error_code),
                            message: error.error_message,
                        });
                    }
                }
                false
            }
            _ => false,
        };
        Ok(matches.then(|| (event_type, event.to_vec())))
    }

    /// Drain broadcast events, routing image availability to subscriptions.
    /// Returns the events not consumed by routing (command responses).
    fn drain_events(&mut self) -> Vec<(i32, Vec<u8>)> {
        let mut unrouted = Vec::new();
        loop {
            let mut received = None;
            match self
                .broadcast
                .receive(|event_type, bytes| received = Some((event_type, bytes.to_vec())))
            {
                Ok(0) => break,
                Ok(_) => {
                    let (event_type, bytes) = received.expect("handler ran on receipt");
                    if !self.route_event(event_type, &bytes) {
                        unrouted.push((event_type, bytes));
                    }
                }
                Err(e) => {
                    // Lapped: events were lost; any waiter this breaks hits
                    // the driver timeout.
                    warn!(error = %e, "broadcast receiver lapped");
                }
            }
        }
        unrouted
    }

    /// Route an event to its subscription.  Returns `true` if consumed.
    fn route_event(&mut self, event_type: i32, event: &[u8]) -> bool {
        match event_type {
            control::ON_AVAILABLE_IMAGE => {
                let Ok(ready) = control::ImageReady::decode(event) else {
                    return true;
                };
                for state in &self.subscriptions {
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    if state.registration_id == ready.subscriber_registration_id {
                        match MappedRawLog::open(Path::new(&ready.log_file)) {
                            Ok(log) => {
                                let position = AtomicCounter::new(
                                    self.counters_values,
                                    ready.subscriber_position_id,
                                );
                                state.add_image(Image::new(
                                    ready.correlation_id,
                                    ready.session_id,
                                    Arc::new(log),
                                    position,
                                ));
                                debug!(
                                    correlation_id = ready.correlation_id,
                                    session_id = ready.session_id,
                                    "image available"
                                );
                            }
                            Err(e) => warn!(error = %e, "could not map image log"),
                        }
                        return true;
                    }
                }
                true
            }
            control::ON_UNAVAILABLE_IMAGE => {
                if let Ok(message) = control::ImageMessage::decode(event) {
                    for state in &self.subscriptions {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        if state.registration_id == message.subscriber_registration_id {
                            state.remove_image(message.correlation_id);
                        }
                    }
                }
                true
            }
            control::ON_CLIENT_TIMEOUT => {
                if let Ok(timeout) = control::ClientTimeout::decode(event) {
                    if timeout.client_id == self.client_id {
                        warn!("driver timed this client out");
                    }
                }
                true
            }
            _ => false,
        }
    }
}
