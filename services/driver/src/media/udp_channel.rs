//! UDP channel: a parsed and resolved channel URI for the UDP medium.
//!
//! Determines the socket addresses involved and the canonical form used to
//! deduplicate endpoints and name their status counters.

use std::net::SocketAddr;

use cn_protocol::uri::{self, ChannelUri, ControlMode, Media};

use crate::error::DriverError;
use crate::name_resolver::NameResolver;

/// A resolved UDP channel.
#[derive(Debug, Clone)]
pub struct UdpChannel {
    pub uri: ChannelUri,
    pub canonical_form: String,
    /// Where DATA is sent (publications) or expected from (subscriptions).
    pub remote_data: Option<SocketAddr>,
    /// The local bind address.
    pub local_data: SocketAddr,
    /// Explicit control address for multi-destination channels.
    pub control: Option<SocketAddr>,
    pub control_mode: Option<ControlMode>,
    pub is_multicast: bool,
    pub ttl: u32,
}

impl UdpChannel {
    /// Parse and resolve `channel`.  Fails when the URI is malformed, the
    /// medium is not UDP, or a name cannot be resolved.
    pub fn parse(channel: &str, resolver: &dyn NameResolver) -> Result<UdpChannel, DriverError> {
        let uri = ChannelUri::parse(channel)
            .map_err(|e| DriverError::InvalidChannel(format!("{channel}: {e}")))?;
        if uri.media != Media::Udp {
            return Err(DriverError::InvalidChannel(format!(
                "{channel}: not a udp channel"
            )));
        }

        let control_mode = uri
            .control_mode()
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?;

        let remote_data = match uri.endpoint() {
            Some(endpoint) => Some(resolve(resolver, endpoint)?),
            None => None,
        };
        let control = match uri.control() {
            Some(control) => Some(resolve(resolver, control)?),
            None => None,
        };

        if remote_data.is_none() && control.is_none() {
            return Err(DriverError::InvalidChannel(format!(
                "{channel}: udp channel needs an endpoint or control address"
            )));
        }

        let local_data = match (uri.interface(), control) {
            (Some(interface), _) => resolve(resolver, interface)?,
            (None, Some(control)) => control,
            (None, None) => "0.0.0.0:0".parse().unwrap(),
        };

        let is_multicast = remote_data.is_some_and(|addr| addr.ip().is_multicast());
        let ttl = uri
            .int_param("ttl")
            .map_err(|e| DriverError::InvalidChannel(e.to_string()))?
            .unwrap_or(0) as u32;

        let endpoint_part = remote_data
            .map(|a| a.to_string())
            .unwrap_or_else(|| "any".to_owned());
        let canonical_form = uri::udp_canonical_form(&local_data.to_string(), &endpoint_part);

        Ok(UdpChannel {
            uri,
            canonical_form,
            remote_data,
            local_data,
            control,
            control_mode,
            is_multicast,
            ttl,
        })
    }

    /// Bind address for a subscription's receive socket: the endpoint
    /// itself (unicast and multicast alike).
    pub fn receive_bind_address(&self) -> SocketAddr {
        self.remote_data.unwrap_or(self.local_data)
    }

    pub fn has_explicit_control(&self) -> bool {
        self.control.is_some()
    }

    pub fn is_manual_control_mode(&self) -> bool {
        self.control_mode == Some(ControlMode::Manual)
    }
}

fn resolve(resolver: &dyn NameResolver, endpoint: &str) -> Result<SocketAddr, DriverError> {
    resolver
        .resolve(endpoint)
        .ok_or_else(|| DriverError::InvalidChannel(format!("unresolvable endpoint '{endpoint}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_resolver::DefaultNameResolver;

    #[test]
    fn unicast_channel_resolves_endpoint() {
        let channel =
            UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40123", &DefaultNameResolver).unwrap();
        assert_eq!(
            channel.remote_data,
            Some("127.0.0.1:40123".parse().unwrap())
        );
        assert!(!channel.is_multicast);
        assert_eq!(
            channel.canonical_form,
            "UDP-0.0.0.0:0-127.0.0.1:40123"
        );
    }

    #[test]
    fn multicast_channel_is_detected() {
        let channel =
            UdpChannel::parse("aeron:udp?endpoint=224.0.1.1:40456&ttl=4", &DefaultNameResolver)
                .unwrap();
        assert!(channel.is_multicast);
        assert_eq!(channel.ttl, 4);
    }

    #[test]
    fn manual_control_mode_channel_needs_no_endpoint() {
        let channel = UdpChannel::parse(
            "aeron:udp?control=127.0.0.1:40100&control-mode=manual",
            &DefaultNameResolver,
        )
        .unwrap();
        assert!(channel.is_manual_control_mode());
        assert_eq!(channel.local_data, "127.0.0.1:40100".parse().unwrap());
    }

    #[test]
    fn channel_without_endpoint_or_control_is_invalid() {
        assert!(matches!(
            UdpChannel::parse("aeron:udp?mtu=1408", &DefaultNameResolver),
            Err(DriverError::InvalidChannel(_))
        ));
    }

    #[test]
    fn ipc_uri_is_rejected_here() {
        assert!(UdpChannel::parse("aeron:ipc", &DefaultNameResolver).is_err());
    }

    #[test]
    fn same_channel_yields_same_canonical_form() {
        let a = UdpChannel::parse("aeron:udp?endpoint=127.0.0.1:40123", &DefaultNameResolver)
            .unwrap();
        let b = UdpChannel::parse(
            "aeron:udp?endpoint=127.0.0.1:40123&mtu=1408",
            &DefaultNameResolver,
        )
        .unwrap();
        assert_eq!(a.canonical_form, b.canonical_form);
    }
}
