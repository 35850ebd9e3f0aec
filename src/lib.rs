//! A client-side MQTT protocol engine speaking both MQTT 3.1.1 and MQTT
//! 5.0 over one unified API.
//!
//! This crate implements the protocol engine only: packet framing,
//! session bookkeeping, flow control, and connection lifecycle. It is
//! deliberately silent on transport establishment (TCP/TLS/WebSocket
//! dialing) and on broker-side concerns — see [`transport::Dialer`] for
//! the boundary.
#![allow(dead_code)]

pub mod callbacks;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod flow;
pub mod session;
pub mod store;
pub mod token;
pub mod transport;
pub mod types;

pub use client::MqttClient;
pub use config::ClientConfig;
pub use error::MqttError;
pub use types::{ProtocolVersion, QoS, ReasonCode};
