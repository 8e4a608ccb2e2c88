//! Channel URIs.
//!
//! Canonical string form: `aeron:<media>?key=value&key=value` with media
//! `udp` or `ipc`.  Keys are a closed set; unknown keys are rejected so
//! typos surface as command errors rather than silently-ignored settings.
//!
//! The driver derives a canonical form `UDP-<localIfaceOrControl>-<endpoint>`
//! from each UDP channel for endpoint deduplication and log file naming.

use std::collections::BTreeMap;

/// URI scheme prefix.
pub const SPY_PREFIX: &str = "aeron-spy:";
const SCHEME: &str = "aeron:";

/// The closed set of recognized parameter keys.
pub const VALID_KEYS: &[&str] = &[
    "endpoint",
    "interface",
    "init-term-id",
    "term-id",
    "term-offset",
    "term-length",
    "mtu",
    "ttl",
    "control",
    "control-mode",
    "session-id",
    "linger",
    "reliable",
    "tags",
    "sparse",
    "alias",
    "eos",
    "tether",
    "group",
    "rejoin",
    "cc",
    "fc",
    "gtag",
    "ssc",
    "so-sndbuf",
    "so-rcvbuf",
    "rcv-wnd",
    "media-rcv-ts-offset",
    "channel-rcv-ts-offset",
    "channel-snd-ts-offset",
    "response-endpoint",
    "response-correlation-id",
    "nak-delay",
    "untethered-window-limit-timeout",
    "untethered-linger-timeout",
    "untethered-resting-timeout",
    "max-resend",
    "stream-id",
    "pub-wnd",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Udp,
    Ipc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Manual,
    Dynamic,
    Response,
}

/// A session id parameter: either a literal or a `tag:<n>` reference to an
/// existing publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdParam {
    Literal(i32),
    Tagged(i64),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriError {
    #[error("channel must start with '{SCHEME}': {0}")]
    BadScheme(String),
    #[error("unknown media '{0}' (expected udp or ipc)")]
    BadMedia(String),
    #[error("unknown channel parameter '{0}'")]
    UnknownKey(String),
    #[error("malformed parameter '{0}' (expected key=value)")]
    MalformedParam(String),
    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
    #[error("'{0}' is only valid for udp channels")]
    UdpOnly(String),
}

/// A parsed channel URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    pub media: Media,
    pub is_spy: bool,
    params: BTreeMap<String, String>,
}

impl ChannelUri {
    pub fn parse(channel: &str) -> Result<ChannelUri, UriError> {
        let (is_spy, rest) = match channel.strip_prefix(SPY_PREFIX) {
            Some(rest) => (true, format!("{SCHEME}{rest}")),
            None => (false, channel.to_owned()),
        };

        let body = rest
            .strip_prefix(SCHEME)
            .ok_or_else(|| UriError::BadScheme(channel.to_owned()))?;

        let (media_str, query) = match body.split_once('?') {
            Some((m, q)) => (m, Some(q)),
            None => (body, None),
        };

        let media = match media_str {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => return Err(UriError::BadMedia(other.to_owned())),
        };

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| UriError::MalformedParam(pair.to_owned()))?;
                if !VALID_KEYS.contains(&key) {
                    return Err(UriError::UnknownKey(key.to_owned()));
                }
                if media == Media::Ipc
                    && matches!(key, "endpoint" | "interface" | "control" | "ttl")
                {
                    return Err(UriError::UdpOnly(key.to_owned()));
                }
                params.insert(key.to_owned(), value.to_owned());
            }
        }

        Ok(ChannelUri {
            media,
            is_spy,
            params,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.get("endpoint")
    }

    pub fn control(&self) -> Option<&str> {
        self.get("control")
    }

    pub fn interface(&self) -> Option<&str> {
        self.get("interface")
    }

    pub fn control_mode(&self) -> Result<Option<ControlMode>, UriError> {
        match self.get("control-mode") {
            None => Ok(None),
            Some("manual") => Ok(Some(ControlMode::Manual)),
            Some("dynamic") => Ok(Some(ControlMode::Dynamic)),
            Some("response") => Ok(Some(ControlMode::Response)),
            Some(other) => Err(UriError::InvalidValue {
                key: "control-mode".to_owned(),
                value: other.to_owned(),
            }),
        }
    }

    pub fn session_id(&self) -> Result<Option<SessionIdParam>, UriError> {
        match self.get("session-id") {
            None => Ok(None),
            Some(value) => {
                if let Some(tag) = value.strip_prefix("tag:") {
                    let tag = tag.parse::<i64>().map_err(|_| UriError::InvalidValue {
                        key: "session-id".to_owned(),
                        value: value.to_owned(),
                    })?;
                    Ok(Some(SessionIdParam::Tagged(tag)))
                } else {
                    let id = value.parse::<i32>().map_err(|_| UriError::InvalidValue {
                        key: "session-id".to_owned(),
                        value: value.to_owned(),
                    })?;
                    Ok(Some(SessionIdParam::Literal(id)))
                }
            }
        }
    }

    pub fn int_param(&self, key: &str) -> Result<Option<i64>, UriError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| UriError::InvalidValue {
                    key: key.to_owned(),
                    value: value.to_owned(),
                }),
        }
    }

    /// Parse a size parameter accepting `k`/`m`/`g` suffixes.
    pub fn size_param(&self, key: &str) -> Result<Option<usize>, UriError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => parse_size(value).map(Some).ok_or_else(|| UriError::InvalidValue {
                key: key.to_owned(),
                value: value.to_owned(),
            }),
        }
    }

    /// Parse a duration parameter in nanoseconds accepting `ns`/`us`/`ms`/`s`
    /// suffixes; bare numbers are nanoseconds.
    pub fn duration_ns_param(&self, key: &str) -> Result<Option<i64>, UriError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => {
                parse_duration_ns(value)
                    .map(Some)
                    .ok_or_else(|| UriError::InvalidValue {
                        key: key.to_owned(),
                        value: value.to_owned(),
                    })
            }
        }
    }

    pub fn bool_param(&self, key: &str, default: bool) -> Result<bool, UriError> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(UriError::InvalidValue {
                key: key.to_owned(),
                value: other.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_spy {
            f.write_str(SPY_PREFIX)?;
        } else {
            f.write_str(SCHEME)?;
        }
        match self.media {
            Media::Udp => f.write_str("udp")?,
            Media::Ipc => f.write_str("ipc")?,
        }
        let mut sep = '?';
        for (key, value) in &self.params {
            write!(f, "{sep}{key}={value}")?;
            sep = '&';
        }
        Ok(())
    }
}

/// The canonical form used for endpoint deduplication and file naming:
/// `UDP-<localIfaceOrControl>-<endpoint>`.
pub fn udp_canonical_form(local: &str, endpoint: &str) -> String {
    format!("UDP-{local}-{endpoint}")
}

/// Canonical form for the IPC medium.
pub fn ipc_canonical_form() -> String {
    "IPC".to_owned()
}

fn parse_size(value: &str) -> Option<usize> {
    let (digits, multiplier) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok().map(|v| v * multiplier)
}

fn parse_duration_ns(value: &str) -> Option<i64> {
    if let Some(digits) = value.strip_suffix("ms") {
        return digits.parse::<i64>().ok().map(|v| v * 1_000_000);
    }
    if let Some(digits) = value.strip_suffix("us") {
        return digits.parse::<i64>().ok().map(|v| v * 1_000);
    }
    if let Some(digits) = value.strip_suffix("ns") {
        return digits.parse::<i64>().ok();
    }
    if let Some(digits) = value.strip_suffix('s') {
        return digits.parse::<i64>().ok().map(|v| v * 1_000_000_000);
    }
    value.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_channel_with_params() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=224.0.1.1:40456&term-length=64k").unwrap();
        assert_eq!(uri.media, Media::Udp);
        assert_eq!(uri.endpoint(), Some("224.0.1.1:40456"));
        assert_eq!(uri.size_param("term-length").unwrap(), Some(64 * 1024));
    }

    #[test]
    fn parses_plain_ipc() {
        let uri = ChannelUri::parse("aeron:ipc").unwrap();
        assert_eq!(uri.media, Media::Ipc);
        assert_eq!(uri.endpoint(), None);
    }

    #[test]
    fn rejects_unknown_key_and_bad_scheme() {
        assert!(matches!(
            ChannelUri::parse("aeron:udp?bogus=1"),
            Err(UriError::UnknownKey(_))
        ));
        assert!(matches!(
            ChannelUri::parse("http://example"),
            Err(UriError::BadScheme(_))
        ));
        assert!(matches!(
            ChannelUri::parse("aeron:tcp?endpoint=x"),
            Err(UriError::BadMedia(_))
        ));
    }

    #[test]
    fn rejects_udp_only_keys_on_ipc() {
        assert!(matches!(
            ChannelUri::parse("aeron:ipc?endpoint=127.0.0.1:1"),
            Err(UriError::UdpOnly(_))
        ));
    }

    #[test]
    fn session_id_accepts_literal_and_tag_reference() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=localhost:1&session-id=5").unwrap();
        assert_eq!(uri.session_id().unwrap(), Some(SessionIdParam::Literal(5)));

        let uri = ChannelUri::parse("aeron:udp?endpoint=localhost:1&session-id=tag:77").unwrap();
        assert_eq!(uri.session_id().unwrap(), Some(SessionIdParam::Tagged(77)));
    }

    #[test]
    fn spy_prefix_is_recognized() {
        let uri = ChannelUri::parse("aeron-spy:aeron:udp?endpoint=localhost:1").unwrap();
        assert!(uri.is_spy);
        assert_eq!(uri.media, Media::Udp);
    }

    #[test]
    fn duration_suffixes() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=x:1&linger=5s&nak-delay=100us").unwrap();
        assert_eq!(uri.duration_ns_param("linger").unwrap(), Some(5_000_000_000));
        assert_eq!(uri.duration_ns_param("nak-delay").unwrap(), Some(100_000));
    }

    #[test]
    fn control_mode_values() {
        let uri = ChannelUri::parse("aeron:udp?control=127.0.0.1:9999&control-mode=dynamic").unwrap();
        assert_eq!(uri.control_mode().unwrap(), Some(ControlMode::Dynamic));
        let bad = ChannelUri::parse("aeron:udp?control-mode=sometimes").unwrap();
        assert!(bad.control_mode().is_err());
    }

    #[test]
    fn display_round_trips_canonically() {
        let uri = ChannelUri::parse("aeron:udp?mtu=1408&endpoint=127.0.0.1:40123").unwrap();
        // BTreeMap ordering makes the printed form deterministic.
        assert_eq!(uri.to_string(), "aeron:udp?endpoint=127.0.0.1:40123&mtu=1408");
        assert_eq!(ChannelUri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn canonical_form_for_udp() {
        assert_eq!(
            udp_canonical_form("0.0.0.0:0", "127.0.0.1:40123"),
            "UDP-0.0.0.0:0-127.0.0.1:40123"
        );
    }
}
