// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listener configuration and buffering policy.
//!
//! [`ListenerConfig`] is handed over by the external configuration subsystem. Protocol names
//! are kept as the raw strings that were configured so that an unknown protocol is reported by
//! [`Receiver::start`](crate::receiver::Receiver::start) before any socket is opened.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use serde::Deserialize;

use crate::errors::ReceiverError;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_BUFFER_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Transport a listener socket speaks.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    #[display("tcp")]
    Tcp,
    #[display("udp4")]
    Udp4,
    #[display("udp6")]
    Udp6,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Tcp, Protocol::Udp4, Protocol::Udp6];

    /// Datagram protocols have no close signal, their sessions are evicted when idle.
    #[must_use]
    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Udp4 | Protocol::Udp6)
    }
}

impl FromStr for Protocol {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp4" => Ok(Protocol::Udp4),
            "udp6" => Ok(Protocol::Udp6),
            _ => Err(ReceiverError::UnknownProtocol(s.to_string())),
        }
    }
}

/// Configuration for the listener sockets
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port shared by every enabled protocol, 0 picks an ephemeral port per socket
    pub port: u16,
    /// Address to bind to (e.g., "0.0.0.0", "::", "127.0.0.1")
    pub address: String,
    /// Enabled protocols as configured ("tcp", "udp4", "udp6")
    pub protocols: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            address: DEFAULT_ADDRESS.to_string(),
            protocols: Protocol::ALL.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ListenerConfig {
    /// Listens on every protocol at `port` on the default address.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Parses the configured protocol names, dropping duplicates but keeping the configured order.
    pub fn parsed_protocols(&self) -> Result<Vec<Protocol>, ReceiverError> {
        let mut parsed: Vec<Protocol> = Vec::with_capacity(self.protocols.len());
        for name in &self.protocols {
            let protocol = name.parse::<Protocol>()?;
            if !parsed.contains(&protocol) {
                parsed.push(protocol);
            }
        }
        Ok(parsed)
    }

    /// Resolves the socket address a given protocol binds to.
    ///
    /// The UDP family that does not match the configured address only accepts the unspecified
    /// and loopback addresses, which are mapped onto their counterpart in that family.
    pub fn bind_address(&self, protocol: Protocol) -> Result<SocketAddr, ReceiverError> {
        let ip = IpAddr::from_str(self.address.trim())
            .map_err(|_| ReceiverError::InvalidAddress(self.address.clone()))?;

        let ip = match (protocol, ip) {
            (Protocol::Tcp, ip) => ip,
            (Protocol::Udp4, IpAddr::V4(_)) | (Protocol::Udp6, IpAddr::V6(_)) => ip,
            (Protocol::Udp4, IpAddr::V6(v6)) if v6.is_unspecified() => {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
            (Protocol::Udp4, IpAddr::V6(v6)) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (Protocol::Udp6, IpAddr::V4(v4)) if v4.is_unspecified() => {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            }
            (Protocol::Udp6, IpAddr::V4(v4)) if v4.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            (protocol, ip) => {
                return Err(ReceiverError::InvalidAddress(format!(
                    "{ip} cannot be used for {protocol}"
                )))
            }
        };

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Size and time bounds applied to every sender's pending buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Pending bytes retained per sender before the tail is force-segmented
    pub max_buffer_size: usize,
    /// Idle time after which a non-empty pending buffer is flushed
    pub max_buffer_timeout: Duration,
    /// Cadence of the buffer guard sweep
    pub sweep_interval: Duration,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_buffer_timeout: DEFAULT_MAX_BUFFER_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(" UDP4 ".parse::<Protocol>().unwrap(), Protocol::Udp4);
        assert_eq!("udp6".parse::<Protocol>().unwrap(), Protocol::Udp6);
        assert!(matches!(
            "udp".parse::<Protocol>(),
            Err(ReceiverError::UnknownProtocol(p)) if p == "udp"
        ));
    }

    #[test]
    fn test_default_config_enables_all_protocols() {
        let config = ListenerConfig::new(5140);
        assert_eq!(config.port, 5140);
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(
            config.parsed_protocols().unwrap(),
            vec![Protocol::Tcp, Protocol::Udp4, Protocol::Udp6]
        );
    }

    #[test]
    fn test_parsed_protocols_rejects_unknown() {
        let config = ListenerConfig::new(0).with_protocols(["tcp", "quic"]);
        assert!(matches!(
            config.parsed_protocols(),
            Err(ReceiverError::UnknownProtocol(p)) if p == "quic"
        ));
    }

    #[test]
    fn test_parsed_protocols_dedups() {
        let config = ListenerConfig::new(0).with_protocols(["udp4", "tcp", "UDP4"]);
        assert_eq!(
            config.parsed_protocols().unwrap(),
            vec![Protocol::Udp4, Protocol::Tcp]
        );
    }

    #[test]
    fn test_bind_address_maps_unspecified_across_families() {
        let config = ListenerConfig::new(5140);
        assert_eq!(
            config.bind_address(Protocol::Udp4).unwrap(),
            "0.0.0.0:5140".parse().unwrap()
        );
        assert_eq!(
            config.bind_address(Protocol::Udp6).unwrap(),
            "[::]:5140".parse().unwrap()
        );

        let config = ListenerConfig::new(5140).with_address("::1");
        assert_eq!(
            config.bind_address(Protocol::Udp4).unwrap(),
            "127.0.0.1:5140".parse().unwrap()
        );
        assert_eq!(
            config.bind_address(Protocol::Tcp).unwrap(),
            "[::1]:5140".parse().unwrap()
        );
    }

    #[test]
    fn test_bind_address_rejects_specific_foreign_family() {
        let config = ListenerConfig::new(5140).with_address("10.1.2.3");
        assert!(config.bind_address(Protocol::Udp4).is_ok());
        assert!(matches!(
            config.bind_address(Protocol::Udp6),
            Err(ReceiverError::InvalidAddress(_))
        ));

        let config = ListenerConfig::new(5140).with_address("not-an-ip");
        assert!(matches!(
            config.bind_address(Protocol::Tcp),
            Err(ReceiverError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ListenerConfig = serde_json::from_str(r#"{"port": 6514}"#).unwrap();
        assert_eq!(config, ListenerConfig::new(6514));

        let config: ListenerConfig =
            serde_json::from_str(r#"{"port": 6514, "address": "::", "protocols": ["udp6"]}"#)
                .unwrap();
        assert_eq!(config.address, "::");
        assert_eq!(config.parsed_protocols().unwrap(), vec![Protocol::Udp6]);
    }

    #[test]
    fn test_datagram_protocols() {
        assert!(!Protocol::Tcp.is_datagram());
        assert!(Protocol::Udp4.is_datagram());
        assert!(Protocol::Udp6.is_datagram());
    }
}
