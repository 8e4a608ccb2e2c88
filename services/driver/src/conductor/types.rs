//! Conductor bookkeeping records.
//!
//! The Conductor is the sole owner of these collections.  Resources owned
//! by other agents (network publications, images) appear here as entries
//! holding the shared atomics and counters the Conductor observes, plus
//! the lifecycle state only the Conductor advances.

use std::sync::{Arc, Mutex};

use cn_concurrent::{AtomicCounter, Position};
use cn_logbuffer::MappedRawLog;

use crate::image::{ImageSharedState, SubscriberPosition};
use crate::loss_report::LossEntryHandle;
use crate::publication::PublicationSharedState;

/// A registered client with its liveness token.
pub struct ClientSession {
    pub client_id: i64,
    pub heartbeat: AtomicCounter,
    pub heartbeat_counter_id: i32,
    pub time_of_last_keepalive_ms: i64,
    pub closed_by_command: bool,
    pub timed_out: bool,
}

/// Lifecycle shared by publications and images on the conductor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Draining,
    Linger { deadline_ns: i64 },
    AwaitingRelease,
}

/// Conductor-side record of a sender-owned network publication.
pub struct NetworkPublicationEntry {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub canonical_form: String,
    pub is_exclusive: bool,
    /// Tag declared via `tags=<n>`, the target of `session-id=tag:<n>`
    /// references from other channels.
    pub entity_tag: Option<i64>,
    pub endpoint_id: usize,
    pub log: Arc<MappedRawLog>,
    pub publisher_limit: Position,
    pub sender_position: Position,
    pub sender_limit: Position,
    pub shared: Arc<PublicationSharedState>,
    /// Spy subscribers reading the log locally.
    pub spy_positions: Vec<SubscriberPosition>,
    pub term_window_length: usize,
    pub position_bits: u32,
    pub initial_term_id: i32,
    pub ref_count: usize,
    pub lifecycle: Lifecycle,
    pub time_of_last_state_change_ns: i64,
    // Blocked-publisher detection.
    pub last_producer_position: i64,
    pub time_of_last_producer_change_ns: i64,
    /// Positions below this lie in zeroed (or never-written) partitions.
    pub cleaned_limit: i64,
}

/// Conductor-side record of a receiver-owned image.
pub struct ImageEntry {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub endpoint_id: usize,
    pub channel: String,
    pub source_identity: String,
    pub log: Arc<MappedRawLog>,
    pub shared: Arc<ImageSharedState>,
    pub subscriber_positions: Arc<Mutex<Vec<SubscriberPosition>>>,
    pub hwm_position: Position,
    pub rebuild_position: Position,
    pub receiver_window_length: usize,
    pub lifecycle: Lifecycle,
    pub time_of_last_state_change_ns: i64,
    pub loss_entry: Option<LossEntryHandle>,
    pub last_loss_bytes: i64,
}

/// What kind of stream a subscription binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// UDP subscription on a receive endpoint.
    Network { endpoint_id: usize },
    /// Shared-memory subscription.
    Ipc,
    /// Local read-only view of a network publication.
    Spy,
}

/// A client's subscription and its parameters.
pub struct SubscriptionLink {
    pub registration_id: i64,
    pub client_id: i64,
    pub stream_id: i32,
    pub channel: String,
    pub kind: LinkKind,
    pub session_filter: Option<i32>,
    pub is_reliable: bool,
    pub is_tether: bool,
    pub is_rejoin: bool,
    pub is_sparse: bool,
    pub group_tag: Option<i64>,
    /// Receiver window requested via `rcv-wnd=`, if any.
    pub receiver_window: Option<usize>,
}

/// Which publication a client publication handle references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationRef {
    Network(i64),
    Ipc(i64),
}

/// A client's handle on a publication.
pub struct PublicationLink {
    pub registration_id: i64,
    pub client_id: i64,
    pub resource: PublicationRef,
}

/// A client-owned counter.
pub struct CounterLink {
    pub registration_id: i64,
    pub client_id: i64,
    pub counter_id: i32,
    /// Static counters survive client death.
    pub is_static: bool,
}

/// A send or receive endpoint deduplicated by canonical form.
pub struct EndpointEntry {
    pub endpoint_id: usize,
    pub canonical_form: String,
    pub status_counter_id: i32,
    pub ref_count: usize,
    pub is_multicast: bool,
}
