//! The transport boundary: connections are supplied as an opaque
//! bidirectional byte stream. This engine never opens a socket itself;
//! it asks a caller-supplied [`Dialer`] for one.
//!
//! Built on `embedded-io-async` 0.7, whose `Read`/`Write` traits use
//! native `async fn` rather than a GAT-based associated future — a
//! [`Transport`] is simply anything implementing both.

use async_trait::async_trait;
use embedded_io_async::{Read, Write};

use crate::error::MqttError;

/// An established, already-authenticated-at-the-transport-level
/// bidirectional byte stream: a TCP socket, a TLS stream, a WebSocket
/// binary-message adapter, or an in-memory duplex pipe in tests.
pub trait Transport: Read + Write + Unpin + Send {}

impl<T> Transport for T where T: Read + Write + Unpin + Send {}

/// Opens a [`Transport`] for a parsed broker URL. Supplied by the
/// caller; this crate never constructs a `Dialer` itself.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Transport: Transport;

    /// `network` is the scheme-derived hint (`"tcp"`, `"tls"`, or a
    /// caller-defined value for an unrecognized scheme); `address` is
    /// the full URL as given to [`ClientConfig`](crate::config::ClientConfig).
    async fn dial(&self, network: &str, address: &str) -> Result<Self::Transport, MqttError>;
}

/// The scheme-derived connection hint a [`Dialer`] receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tls,
    /// Any scheme this crate doesn't recognize; only usable with a
    /// caller-supplied dialer that knows what to do with it.
    Other,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Other => "other",
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Tcp => Some(1883),
            Self::Tls => Some(8883),
            Self::Other => None,
        }
    }
}

/// A broker URL split into a dial hint plus host/port: `tcp://`/
/// `mqtt://` default to 1883, `tls://`/`ssl://`/`mqtts://` default to
/// 8883, anything else is passed through verbatim to a caller-supplied
/// dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub network: Network,
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl BrokerUrl {
    pub fn parse(url: &str) -> Result<Self, MqttError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| MqttError::Transport(format!("'{url}' has no scheme")))?;

        let network = match scheme {
            "tcp" | "mqtt" => Network::Tcp,
            "tls" | "ssl" | "mqtts" => Network::Tls,
            _ => Network::Other,
        };

        let (host_port, _path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| MqttError::Transport(format!("invalid port in '{url}'")))?;
                (host.to_string(), port)
            }
            None => {
                let port = network
                    .default_port()
                    .ok_or_else(|| MqttError::Transport(format!("'{url}' has no default port for its scheme")))?;
                (host_port.to_string(), port)
            }
        };

        if host.is_empty() {
            return Err(MqttError::Transport(format!("'{url}' has no host")));
        }

        Ok(Self {
            network,
            scheme: scheme.to_string(),
            host,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_scheme_defaults_to_1883() {
        let url = BrokerUrl::parse("tcp://broker.example.com").unwrap();
        assert_eq!(url.network, Network::Tcp);
        assert_eq!(url.port, 1883);
        assert_eq!(url.host, "broker.example.com");
    }

    #[test]
    fn mqtts_scheme_defaults_to_8883() {
        let url = BrokerUrl::parse("mqtts://broker.example.com").unwrap();
        assert_eq!(url.network, Network::Tls);
        assert_eq!(url.port, 8883);
    }

    #[test]
    fn explicit_port_overrides_default() {
        let url = BrokerUrl::parse("tcp://broker.example.com:1884").unwrap();
        assert_eq!(url.port, 1884);
    }

    #[test]
    fn unrecognized_scheme_is_passed_through() {
        let url = BrokerUrl::parse("quic://broker.example.com:4433").unwrap();
        assert_eq!(url.network, Network::Other);
        assert_eq!(url.scheme, "quic");
        assert_eq!(url.port, 4433);
    }

    #[test]
    fn unrecognized_scheme_without_explicit_port_is_rejected() {
        assert!(BrokerUrl::parse("quic://broker.example.com").is_err());
    }

    #[test]
    fn missing_scheme_is_rejected() {
        assert!(BrokerUrl::parse("broker.example.com").is_err());
    }

    #[test]
    fn missing_host_is_rejected() {
        assert!(BrokerUrl::parse("tcp://:1883").is_err());
    }
}
