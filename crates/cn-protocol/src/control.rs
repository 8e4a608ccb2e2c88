//! Client control protocol.
//!
//! Commands flow from clients to the driver through the many-to-one ring;
//! events flow back over the to-clients broadcast.  Every command carries a
//! correlation id allocated from the ring; responses echo it.
//!
//! Encodings are fixed little-endian layouts with length-prefixed strings,
//! written by the small reader/writer helpers at the bottom of this module.

// ---------------------------------------------------------------------------
// Command type ids (client -> driver)
// ---------------------------------------------------------------------------

pub const ADD_PUBLICATION: i32 = 0x01;
pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x02;
pub const REMOVE_PUBLICATION: i32 = 0x03;
pub const ADD_SUBSCRIPTION: i32 = 0x04;
pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
pub const CLIENT_KEEPALIVE: i32 = 0x06;
pub const ADD_DESTINATION: i32 = 0x07;
pub const REMOVE_DESTINATION: i32 = 0x08;
pub const ADD_COUNTER: i32 = 0x09;
pub const REMOVE_COUNTER: i32 = 0x0A;
pub const CLIENT_CLOSE: i32 = 0x0B;
pub const ADD_RCV_DESTINATION: i32 = 0x0C;
pub const REMOVE_RCV_DESTINATION: i32 = 0x0D;
pub const TERMINATE_DRIVER: i32 = 0x0E;
pub const ADD_STATIC_COUNTER: i32 = 0x0F;
pub const NEXT_AVAILABLE_SESSION_ID: i32 = 0x10;
pub const REJECT_IMAGE: i32 = 0x11;

// ---------------------------------------------------------------------------
// Event type ids (driver -> clients)
// ---------------------------------------------------------------------------

pub const ON_ERROR: i32 = 0x0F01;
pub const ON_AVAILABLE_IMAGE: i32 = 0x0F02;
pub const ON_PUBLICATION_READY: i32 = 0x0F03;
pub const ON_OPERATION_SUCCESS: i32 = 0x0F04;
pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F05;
pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x0F06;
pub const ON_SUBSCRIPTION_READY: i32 = 0x0F07;
pub const ON_COUNTER_READY: i32 = 0x0F08;
pub const ON_UNAVAILABLE_COUNTER: i32 = 0x0F09;
pub const ON_CLIENT_TIMEOUT: i32 = 0x0F0A;
pub const ON_STATIC_COUNTER: i32 = 0x0F0B;
pub const ON_PUBLICATION_ERROR: i32 = 0x0F0C;
pub const ON_NEXT_AVAILABLE_SESSION_ID: i32 = 0x0F0D;
pub const ON_CHANNEL_ENDPOINT_ERROR: i32 = 0x0F0E;
pub const ON_ASYNC_ERROR: i32 = 0x0F0F;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("control message truncated at {0} bytes")]
    Truncated(usize),
    #[error("string field is not valid utf-8")]
    BadString,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Common prefix of every command: (client id, correlation id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatedCommand {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl CorrelatedCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(CorrelatedCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
        })
    }
}

/// AddPublication / AddExclusivePublication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl PublicationCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i32(self.stream_id);
        w.put_str(&self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(PublicationCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            stream_id: r.get_i32()?,
            channel: r.get_str()?,
        })
    }
}

/// RemovePublication / RemoveCounter: resource release by registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub registration_id: i64,
}

impl RemoveCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i64(self.registration_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(RemoveCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            registration_id: r.get_i64()?,
        })
    }
}

/// AddSubscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    /// Registration id of a prior subscription to share an endpoint with,
    /// or -1.
    pub registration_correlation_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl SubscriptionCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i64(self.registration_correlation_id);
        w.put_i32(self.stream_id);
        w.put_str(&self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(SubscriptionCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            registration_correlation_id: r.get_i64()?,
            stream_id: r.get_i32()?,
            channel: r.get_str()?,
        })
    }
}

/// AddDestination / RemoveDestination / AddRcvDestination / RemoveRcvDestination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    /// The publication or subscription the destination applies to.
    pub registration_correlation_id: i64,
    pub channel: String,
}

impl DestinationCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i64(self.registration_correlation_id);
        w.put_str(&self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(DestinationCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            registration_correlation_id: r.get_i64()?,
            channel: r.get_str()?,
        })
    }
}

/// AddCounter / AddStaticCounter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub type_id: i32,
    /// Registration id for static counters, -1 otherwise.
    pub registration_id: i64,
    pub key: Vec<u8>,
    pub label: String,
}

impl CounterCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i32(self.type_id);
        w.put_i64(self.registration_id);
        w.put_bytes(&self.key);
        w.put_str(&self.label);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(CounterCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            type_id: r.get_i32()?,
            registration_id: r.get_i64()?,
            key: r.get_bytes()?,
            label: r.get_str()?,
        })
    }
}

/// TerminateDriver with its validation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateDriverCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub token: Vec<u8>,
}

impl TerminateDriverCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_bytes(&self.token);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(TerminateDriverCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            token: r.get_bytes()?,
        })
    }
}

/// NextAvailableSessionId for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSessionIdCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub stream_id: i32,
}

impl NextSessionIdCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i32(self.stream_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(NextSessionIdCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            stream_id: r.get_i32()?,
        })
    }
}

/// RejectImage: force an inbound image into an error-terminated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectImageCommand {
    pub client_id: i64,
    pub correlation_id: i64,
    pub image_correlation_id: i64,
    pub position: i64,
    pub reason: String,
}

impl RejectImageCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.client_id);
        w.put_i64(self.correlation_id);
        w.put_i64(self.image_correlation_id);
        w.put_i64(self.position);
        w.put_str(&self.reason);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(RejectImageCommand {
            client_id: r.get_i64()?,
            correlation_id: r.get_i64()?,
            image_correlation_id: r.get_i64()?,
            position: r.get_i64()?,
            reason: r.get_str()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// OnError / OnAsyncError.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub offending_correlation_id: i64,
    pub error_code: i32,
    pub error_message: String,
}

impl ErrorResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.offending_correlation_id);
        w.put_i32(self.error_code);
        w.put_str(&self.error_message);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(ErrorResponse {
            offending_correlation_id: r.get_i64()?,
            error_code: r.get_i32()?,
            error_message: r.get_str()?,
        })
    }
}

/// OnPublicationReady / OnExclusivePublicationReady.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReady {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub position_limit_counter_id: i32,
    pub channel_status_indicator_id: i32,
    pub log_file: String,
}

impl PublicationReady {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.correlation_id);
        w.put_i64(self.registration_id);
        w.put_i32(self.session_id);
        w.put_i32(self.stream_id);
        w.put_i32(self.position_limit_counter_id);
        w.put_i32(self.channel_status_indicator_id);
        w.put_str(&self.log_file);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(PublicationReady {
            correlation_id: r.get_i64()?,
            registration_id: r.get_i64()?,
            session_id: r.get_i32()?,
            stream_id: r.get_i32()?,
            position_limit_counter_id: r.get_i32()?,
            channel_status_indicator_id: r.get_i32()?,
            log_file: r.get_str()?,
        })
    }
}

/// OnSubscriptionReady.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionReady {
    pub correlation_id: i64,
    pub channel_status_indicator_id: i32,
}

impl SubscriptionReady {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.correlation_id);
        w.put_i32(self.channel_status_indicator_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(SubscriptionReady {
            correlation_id: r.get_i64()?,
            channel_status_indicator_id: r.get_i32()?,
        })
    }
}

/// OnOperationSuccess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSucceeded {
    pub correlation_id: i64,
}

impl OperationSucceeded {
    pub fn encode(&self, out: &mut Vec<u8>) {
        Writer(out).put_i64(self.correlation_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        Ok(OperationSucceeded {
            correlation_id: Reader::new(buf).get_i64()?,
        })
    }
}

/// OnAvailableImage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReady {
    /// The image correlation id, also naming its log file.
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub subscriber_registration_id: i64,
    pub subscriber_position_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

impl ImageReady {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.correlation_id);
        w.put_i32(self.session_id);
        w.put_i32(self.stream_id);
        w.put_i64(self.subscriber_registration_id);
        w.put_i32(self.subscriber_position_id);
        w.put_str(&self.log_file);
        w.put_str(&self.source_identity);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(ImageReady {
            correlation_id: r.get_i64()?,
            session_id: r.get_i32()?,
            stream_id: r.get_i32()?,
            subscriber_registration_id: r.get_i64()?,
            subscriber_position_id: r.get_i32()?,
            log_file: r.get_str()?,
            source_identity: r.get_str()?,
        })
    }
}

/// OnUnavailableImage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMessage {
    pub correlation_id: i64,
    pub subscriber_registration_id: i64,
    pub stream_id: i32,
    pub channel: String,
}

impl ImageMessage {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.correlation_id);
        w.put_i64(self.subscriber_registration_id);
        w.put_i32(self.stream_id);
        w.put_str(&self.channel);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(ImageMessage {
            correlation_id: r.get_i64()?,
            subscriber_registration_id: r.get_i64()?,
            stream_id: r.get_i32()?,
            channel: r.get_str()?,
        })
    }
}

/// OnCounterReady / OnUnavailableCounter / OnStaticCounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub correlation_id: i64,
    pub counter_id: i32,
}

impl CounterUpdate {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.correlation_id);
        w.put_i32(self.counter_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(CounterUpdate {
            correlation_id: r.get_i64()?,
            counter_id: r.get_i32()?,
        })
    }
}

/// OnClientTimeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeout {
    pub client_id: i64,
}

impl ClientTimeout {
    pub fn encode(&self, out: &mut Vec<u8>) {
        Writer(out).put_i64(self.client_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        Ok(ClientTimeout {
            client_id: Reader::new(buf).get_i64()?,
        })
    }
}

/// OnNextAvailableSessionId.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSessionIdResponse {
    pub correlation_id: i64,
    pub next_session_id: i32,
}

impl NextSessionIdResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.correlation_id);
        w.put_i32(self.next_session_id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(NextSessionIdResponse {
            correlation_id: r.get_i64()?,
            next_session_id: r.get_i32()?,
        })
    }
}

/// OnPublicationError: an in-flight publication hit a terminal condition
/// (for example a revoke observed by a remote receiver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationErrorEvent {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub error_code: i32,
    pub error_message: String,
}

impl PublicationErrorEvent {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.put_i64(self.registration_id);
        w.put_i32(self.session_id);
        w.put_i32(self.stream_id);
        w.put_i32(self.error_code);
        w.put_str(&self.error_message);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        let mut r = Reader::new(buf);
        Ok(PublicationErrorEvent {
            registration_id: r.get_i64()?,
            session_id: r.get_i32()?,
            stream_id: r.get_i32()?,
            error_code: r.get_i32()?,
            error_message: r.get_str()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Little-endian reader/writer helpers
// ---------------------------------------------------------------------------

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    fn put_i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_i32(bytes.len() as i32);
        self.0.extend_from_slice(bytes);
    }

    fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn get_i32(&mut self) -> Result<i32, ControlError> {
        if self.pos + 4 > self.buf.len() {
            return Err(ControlError::Truncated(self.buf.len()));
        }
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn get_i64(&mut self) -> Result<i64, ControlError> {
        if self.pos + 8 > self.buf.len() {
            return Err(ControlError::Truncated(self.buf.len()));
        }
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn get_bytes(&mut self) -> Result<Vec<u8>, ControlError> {
        let len = self.get_i32()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(ControlError::Truncated(self.buf.len()));
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn get_str(&mut self) -> Result<String, ControlError> {
        String::from_utf8(self.get_bytes()?).map_err(|_| ControlError::BadString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_command_round_trip() {
        let cmd = PublicationCommand {
            client_id: 3,
            correlation_id: 17,
            stream_id: 42,
            channel: "aeron:udp?endpoint=127.0.0.1:40123".to_owned(),
        };
        let mut out = Vec::new();
        cmd.encode(&mut out);
        assert_eq!(PublicationCommand::decode(&out).unwrap(), cmd);
    }

    #[test]
    fn image_ready_round_trip_with_paths() {
        let event = ImageReady {
            correlation_id: 99,
            session_id: 100,
            stream_id: 42,
            subscriber_registration_id: 5,
            subscriber_position_id: 12,
            log_file: "/dev/shm/conduit/images/99.logbuffer".to_owned(),
            source_identity: "127.0.0.1:40123".to_owned(),
        };
        let mut out = Vec::new();
        event.encode(&mut out);
        assert_eq!(ImageReady::decode(&out).unwrap(), event);
    }

    #[test]
    fn truncated_command_is_rejected() {
        let cmd = SubscriptionCommand {
            client_id: 1,
            correlation_id: 2,
            registration_correlation_id: -1,
            stream_id: 7,
            channel: "aeron:ipc".to_owned(),
        };
        let mut out = Vec::new();
        cmd.encode(&mut out);
        assert!(matches!(
            SubscriptionCommand::decode(&out[..out.len() - 3]),
            Err(ControlError::Truncated(_))
        ));
    }

    #[test]
    fn error_response_round_trip() {
        let event = ErrorResponse {
            offending_correlation_id: 55,
            error_code: 1,
            error_message: "existing publication has clashing sessionId=5".to_owned(),
        };
        let mut out = Vec::new();
        event.encode(&mut out);
        assert_eq!(ErrorResponse::decode(&out).unwrap(), event);
    }
}
