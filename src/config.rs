//! Client configuration, following the teacher's small typed-wrapper
//! style (`config::client`/`server`/`shared`) generalized into a single
//! builder since this engine has no compile-time capacity parameters to
//! thread through a const-generic config struct.

use std::sync::Arc;
use std::time::Duration;

use crate::callbacks::Authenticator;
use crate::codec::connect::Will;
use crate::flow::InboundPolicy;
use crate::store::SessionStore;
use crate::types::ProtocolVersion;

/// Keep alive mechanism within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// No keepalive probing; the server may time out the connection on
    /// its own terms.
    Disabled,
    /// The maximum time interval in seconds allowed to pass between two
    /// MQTT packets before a PINGREQ is sent.
    Seconds(u16),
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::Seconds(60)
    }
}

impl KeepAlive {
    pub(crate) fn as_u16(self) -> u16 {
        match self {
            Self::Disabled => 0,
            Self::Seconds(s) => s,
        }
    }
}

/// The handling of a session after a disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionExpiry {
    #[default]
    EndOnDisconnect,
    NeverEnd,
    Seconds(u32),
}

impl SessionExpiry {
    pub(crate) fn as_u32(self) -> u32 {
        match self {
            Self::EndOnDisconnect => 0,
            Self::NeverEnd => u32::MAX,
            Self::Seconds(s) => s,
        }
    }
}

/// Exponential backoff parameters for the reconnect loop: defaults to a
/// 1s initial delay, doubling, capped at 120s, reset to 1s on a
/// successful handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
        }
    }
}

/// Client-side configuration. Built with the usual consuming-`self`
/// builder pattern; [`ClientConfig::build`] is infallible since field
/// validation (e.g. empty client id vs. clean_start) happens at connect
/// time against the specific operation being attempted.
#[derive(Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: KeepAlive,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,

    pub receive_maximum: u16,
    pub topic_alias_maximum: u16,
    pub max_packet_size: Option<u32>,
    pub max_topic_length: usize,
    pub max_incoming_packet: u32,
    pub inbound_receive_max_policy: InboundPolicy,
    pub session_expiry_interval: SessionExpiry,

    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub session_store: Option<Arc<dyn SessionStore>>,

    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,

    /// Bounded channel capacity between the client handle and the logic
    /// task, and between the logic task and the writer task.
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            protocol_version: ProtocolVersion::V5,
            clean_start: true,
            keep_alive: KeepAlive::default(),
            will: None,
            username: None,
            password: None,
            receive_maximum: 65_535,
            topic_alias_maximum: 0,
            max_packet_size: None,
            max_topic_length: 65_535,
            max_incoming_packet: 268_435_455,
            inbound_receive_max_policy: InboundPolicy::default(),
            session_expiry_interval: SessionExpiry::default(),
            authenticator: None,
            session_store: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            outbound_queue_capacity: 1000,
            inbound_queue_capacity: 1000,
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn receive_maximum(mut self, max: u16) -> Self {
        self.receive_maximum = max.max(1);
        self
    }

    pub fn topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = max;
        self
    }

    pub fn max_packet_size(mut self, max: u32) -> Self {
        self.max_packet_size = Some(max);
        self
    }

    pub fn session_expiry_interval(mut self, expiry: SessionExpiry) -> Self {
        self.session_expiry_interval = expiry;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Self {
        self
    }
}

/// A snapshot of capabilities the server advertised in CONNACK, used to
/// validate outgoing operations before they ever reach the codec.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilities {
    pub session_present: bool,
    pub maximum_qos: Option<u8>,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub subscription_identifier_available: bool,
    pub shared_subscription_available: bool,
    pub receive_maximum: u16,
    pub topic_alias_maximum: u16,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
}

impl ServerCapabilities {
    pub fn v3_default() -> Self {
        Self {
            receive_maximum: u16::MAX,
            retain_available: true,
            wildcard_subscription_available: true,
            ..Self::default()
        }
    }
}
