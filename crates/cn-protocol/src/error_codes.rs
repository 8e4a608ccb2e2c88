//! Control protocol error codes.
//!
//! Carried in `OnError` events back to clients and in ERR frames on the
//! wire.  Values are stable wire constants.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    GenericError = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    ChannelEndpointError = 4,
    UnknownCounter = 5,
    UnknownCommandTypeId = 6,
    MalformedCommand = 7,
    NotSupported = 8,
    UnknownHost = 9,
    ResourceTemporarilyUnavailable = 10,
    PublicationRevoked = 11,
    ImageRejected = 12,
    StorageSpace = 13,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> ErrorCode {
        match value {
            1 => ErrorCode::InvalidChannel,
            2 => ErrorCode::UnknownSubscription,
            3 => ErrorCode::UnknownPublication,
            4 => ErrorCode::ChannelEndpointError,
            5 => ErrorCode::UnknownCounter,
            6 => ErrorCode::UnknownCommandTypeId,
            7 => ErrorCode::MalformedCommand,
            8 => ErrorCode::NotSupported,
            9 => ErrorCode::UnknownHost,
            10 => ErrorCode::ResourceTemporarilyUnavailable,
            11 => ErrorCode::PublicationRevoked,
            12 => ErrorCode::ImageRejected,
            13 => ErrorCode::StorageSpace,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::GenericError => "generic error",
            ErrorCode::InvalidChannel => "invalid channel",
            ErrorCode::UnknownSubscription => "unknown subscription",
            ErrorCode::UnknownPublication => "unknown publication",
            ErrorCode::ChannelEndpointError => "channel endpoint error",
            ErrorCode::UnknownCounter => "unknown counter",
            ErrorCode::UnknownCommandTypeId => "unknown command type id",
            ErrorCode::MalformedCommand => "malformed command",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::UnknownHost => "unknown host",
            ErrorCode::ResourceTemporarilyUnavailable => "resource temporarily unavailable",
            ErrorCode::PublicationRevoked => "publication revoked",
            ErrorCode::ImageRejected => "image rejected",
            ErrorCode::StorageSpace => "storage space",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_codes() {
        for code in [
            ErrorCode::InvalidChannel,
            ErrorCode::UnknownPublication,
            ErrorCode::MalformedCommand,
        ] {
            assert_eq!(ErrorCode::from_i32(code as i32), code);
        }
    }

    #[test]
    fn unknown_value_maps_to_generic() {
        assert_eq!(ErrorCode::from_i32(9999), ErrorCode::GenericError);
    }
}
