//! System counters and stream counter type ids.
//!
//! System counters are allocated once at startup from the counters file and
//! handed to the agents as cheap handles.  Stream counters (positions,
//! limits) are allocated per publication/image/subscription with labels
//! that identify the stream.

use cn_concurrent::counters::CountersError;
use cn_concurrent::{AtomicCounter, CountersManager};

// ---------------------------------------------------------------------------
// Counter type ids
// ---------------------------------------------------------------------------

pub const SYSTEM_COUNTER_TYPE_ID: i32 = 0;
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;
pub const SENDER_POSITION_TYPE_ID: i32 = 2;
pub const SENDER_LIMIT_TYPE_ID: i32 = 3;
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 4;
pub const RECEIVER_HWM_TYPE_ID: i32 = 5;
pub const RECEIVER_POSITION_TYPE_ID: i32 = 6;
pub const PUBLISHER_POSITION_TYPE_ID: i32 = 7;
pub const SEND_CHANNEL_STATUS_TYPE_ID: i32 = 8;
pub const RECEIVE_CHANNEL_STATUS_TYPE_ID: i32 = 9;
pub const CLIENT_HEARTBEAT_TYPE_ID: i32 = 11;

/// Channel status indicator values.
pub const CHANNEL_STATUS_INITIALIZING: i64 = 0;
pub const CHANNEL_STATUS_ACTIVE: i64 = 1;
pub const CHANNEL_STATUS_ERRORED: i64 = -1;
pub const CHANNEL_STATUS_CLOSING: i64 = 2;

// ---------------------------------------------------------------------------
// System counters
// ---------------------------------------------------------------------------

macro_rules! system_counters {
    ($(($field:ident, $label:expr)),+ $(,)?) => {
        /// Handles to the driver-wide telemetry counters.
        pub struct SystemCounters {
            $(pub $field: AtomicCounter),+
        }

        impl SystemCounters {
            pub fn allocate(
                manager: &mut CountersManager,
                now_ms: i64,
            ) -> Result<SystemCounters, CountersError> {
                Ok(SystemCounters {
                    $($field: {
                        let id = manager.allocate(SYSTEM_COUNTER_TYPE_ID, &[], $label, now_ms)?;
                        manager.counter(id)
                    }),+
                })
            }
        }
    };
}

system_counters! {
    (bytes_sent, "bytes-sent"),
    (bytes_received, "bytes-received"),
    (naks_sent, "naks-sent"),
    (naks_received, "naks-received"),
    (status_messages_sent, "status-messages-sent"),
    (status_messages_received, "status-messages-received"),
    (retransmits_sent, "retransmits-sent"),
    (retransmitted_bytes, "retransmitted-bytes"),
    (retransmit_overflow, "retransmit-overflow"),
    (heartbeats_sent, "heartbeats-sent"),
    (heartbeats_received, "heartbeats-received"),
    (errors, "errors"),
    (short_sends, "short-sends"),
    (invalid_packets, "invalid-packets"),
    (client_timeouts, "client-timeouts"),
    (unblocked_publications, "unblocked-publications"),
    (unblocked_commands, "unblocked-commands"),
    (back_pressure_events, "back-pressure-events"),
    (possible_ttl_asymmetry, "possible-ttl-asymmetry"),
    (resolution_changes, "resolution-changes"),
    (images_rejected, "images-rejected"),
}

/// Label for a per-stream counter.
pub fn stream_counter_label(
    name: &str,
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: &str,
) -> String {
    let label = format!("{name}: {registration_id} {session_id} {stream_id} {channel}");
    // Labels are bounded by the metadata record; keep the head, which
    // carries the identifying ids.
    if label.len() > cn_concurrent::counters::MAX_LABEL_LENGTH {
        label[..cn_concurrent::counters::MAX_LABEL_LENGTH].to_owned()
    } else {
        label
    }
}
