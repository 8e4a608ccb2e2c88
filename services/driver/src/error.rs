//! Driver error taxonomy.
//!
//! Command-level failures surface to clients as `OnError` events with an
//! [`ErrorCode`]; infrastructure failures land in the distinct error log.
//! Only [`DriverError::AgentTerminationRequested`] unwinds an agent.

use cn_protocol::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Invalid configuration at startup.  Fatal, no recovery.
    #[error("configuration: {0}")]
    Configuration(String),

    /// A channel URI failed to parse or resolve.  The command fails.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// A client command was rejected.  The command fails with the code.
    #[error("{code}: {message}")]
    ControlProtocol { code: ErrorCode, message: String },

    /// A channel endpoint failed; linked publications and subscriptions
    /// receive an error event and the endpoint closes.
    #[error("channel endpoint: {0}")]
    ChannelEndpoint(String),

    /// The driver stopped responding to this client.
    #[error("driver unresponsive after {0} ms")]
    DriverTimeout(i64),

    /// The conductor missed its own service deadline.  Fatal.
    #[error("conductor service interval exceeded")]
    ConductorServiceTimeout,

    /// Unrecoverable socket or file error.  The owning endpoint closes.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Frame failed validation (bad version, truncated).  Dropped and
    /// counted.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Cooperative agent shutdown.
    #[error("agent termination requested")]
    AgentTerminationRequested,
}

impl DriverError {
    /// The control-protocol code to report for this error, when it is
    /// client-visible.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DriverError::InvalidChannel(_) => ErrorCode::InvalidChannel,
            DriverError::ControlProtocol { code, .. } => *code,
            DriverError::ChannelEndpoint(_) => ErrorCode::ChannelEndpointError,
            _ => ErrorCode::GenericError,
        }
    }

    pub fn control(code: ErrorCode, message: impl Into<String>) -> Self {
        DriverError::ControlProtocol {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_errors_carry_their_code() {
        let err = DriverError::control(ErrorCode::UnknownPublication, "unknown registration id 9");
        assert_eq!(err.error_code(), ErrorCode::UnknownPublication);
        assert_eq!(err.to_string(), "unknown publication: unknown registration id 9");
    }

    #[test]
    fn invalid_channel_maps_to_invalid_channel_code() {
        let err = DriverError::InvalidChannel("bad uri".to_owned());
        assert_eq!(err.error_code(), ErrorCode::InvalidChannel);
    }
}
