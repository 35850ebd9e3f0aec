//! Connection lifecycle against a fake broker peer (spec.md section 8,
//! scenarios 5, 7, and 8): a v3 handshake carries no property block, a
//! silent peer trips the keepalive timeout, and a server-assigned
//! client identifier sticks across a reconnect.

mod common;

use std::time::Duration;

use mqtt_engine::callbacks::Authenticator;
use mqtt_engine::codec::connect::ConnAck;
use mqtt_engine::codec::control::Auth;
use mqtt_engine::codec::property::Properties;
use mqtt_engine::codec::Packet;
use mqtt_engine::config::{KeepAlive, ReconnectPolicy};
use mqtt_engine::{ClientConfig, MqttClient, MqttError, ProtocolVersion, ReasonCode};

use async_trait::async_trait;
use std::sync::Arc;

use common::{capturing_observer, peer_read, QueuedDialer};

/// A scripted challenge/response authenticator: echoes the server's
/// challenge bytes back reversed, so the fake peer can assert on a
/// deterministic response without any real crypto involved.
struct ReversingAuthenticator;

#[async_trait]
impl Authenticator for ReversingAuthenticator {
    fn method(&self) -> &str {
        "TEST-REVERSE"
    }

    async fn initial_data(&self) -> Result<Vec<u8>, MqttError> {
        Ok(b"hello".to_vec())
    }

    async fn challenge(&self, server_data: &[u8]) -> Result<Vec<u8>, MqttError> {
        Ok(server_data.iter().rev().copied().collect())
    }
}

#[tokio::test]
async fn v3_handshake_carries_no_property_block() {
    let dialer = QueuedDialer::new();
    let mut peer = dialer.queue_connection().await;

    let config = ClientConfig::new("v3-client").protocol_version(ProtocolVersion::V4);

    let broker = tokio::spawn(async move {
        match peer_read(&mut peer, ProtocolVersion::V4).await {
            Packet::Connect(connect) => {
                assert_eq!(connect.protocol_version, ProtocolVersion::V4);
                assert_eq!(connect.properties, Properties::default(), "v3 CONNECT must not carry v5 properties");
            }
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }
        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        common::peer_write(&mut peer, &Packet::ConnAck(connack), ProtocolVersion::V4).await;
        peer
    });

    let client = MqttClient::connect("tcp://broker.example:1883", config, dialer)
        .await
        .expect("v3 handshake should succeed against the fake peer");

    broker.await.expect("broker task panicked");
    client.disconnect().await.expect("graceful disconnect");
}

#[tokio::test]
async fn silence_past_one_and_a_half_keep_alive_intervals_trips_the_timeout() {
    let dialer = QueuedDialer::new();
    let mut peer = dialer.queue_connection().await;
    let (observer, mut lost_rx) = capturing_observer();

    let config = ClientConfig::new("keepalive-client")
        .protocol_version(ProtocolVersion::V5)
        .keep_alive(KeepAlive::Seconds(1));

    tokio::spawn(async move {
        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Connect(_) => {}
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }
        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        common::peer_write(&mut peer, &Packet::ConnAck(connack), ProtocolVersion::V5).await;
        // Then fall silent forever: the client never hears from this
        // peer again, which is the condition under test.
        std::future::pending::<()>().await;
    });

    let client = MqttClient::connect_with("tcp://broker.example:1883", config, dialer, None, observer)
        .await
        .expect("handshake should succeed");

    // The peer never sends PINGRESP or anything else; the client should
    // give up on the connection once it has been quiet for longer than
    // 1.5x the negotiated keep-alive.
    let lost = tokio::time::timeout(Duration::from_secs(5), lost_rx.recv())
        .await
        .expect("keepalive timeout should have fired within 5s")
        .expect("observer channel closed unexpectedly");

    assert!(
        matches!(&lost, MqttError::Disconnect(err) if err.reason == ReasonCode::KeepAliveTimeout),
        "expected a KeepAliveTimeout disconnect, got {lost:?}"
    );

    client.shutdown();
}

#[tokio::test]
async fn enhanced_auth_handshake_then_client_initiated_reauth() {
    let dialer = QueuedDialer::new();
    let mut peer = dialer.queue_connection().await;

    let config = ClientConfig::new("auth-client")
        .protocol_version(ProtocolVersion::V5)
        .authenticator(Arc::new(ReversingAuthenticator));

    let broker = tokio::spawn(async move {
        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Connect(connect) => {
                assert_eq!(connect.properties.authentication_method.as_deref(), Some("TEST-REVERSE"));
                assert_eq!(connect.properties.authentication_data.as_deref(), Some(&b"hello"[..]));
            }
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }

        let challenge = Auth {
            reason_code: ReasonCode::ContinueAuthentication,
            properties: Properties {
                authentication_method: Some("TEST-REVERSE".to_string()),
                authentication_data: Some(b"abc".to_vec()),
                ..Properties::default()
            },
        };
        common::peer_write(&mut peer, &Packet::Auth(challenge), ProtocolVersion::V5).await;

        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Auth(reply) => {
                assert_eq!(reply.reason_code, ReasonCode::ContinueAuthentication);
                assert_eq!(reply.properties.authentication_data.as_deref(), Some(&b"cba"[..]));
            }
            other => panic!("expected AUTH continue, got {}", other.type_name()),
        }

        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        common::peer_write(&mut peer, &Packet::ConnAck(connack), ProtocolVersion::V5).await;

        // Steady state: the client now initiates re-authentication.
        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Auth(reauth) => {
                assert_eq!(reauth.reason_code, ReasonCode::ReAuthenticate);
                assert_eq!(reauth.properties.authentication_method.as_deref(), Some("TEST-REVERSE"));
            }
            other => panic!("expected AUTH reauthenticate, got {}", other.type_name()),
        }
        let done = Auth {
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        common::peer_write(&mut peer, &Packet::Auth(done), ProtocolVersion::V5).await;

        peer
    });

    let client = MqttClient::connect("tcp://broker.example:1883", config, dialer)
        .await
        .expect("enhanced-auth handshake should succeed");

    client.reauthenticate().await.expect("reauthenticate should send successfully");

    broker.await.expect("broker task panicked");
    client.shutdown();
}

#[tokio::test]
async fn assigned_client_identifier_sticks_across_a_reconnect() {
    let dialer = QueuedDialer::new();
    let mut first_peer = dialer.queue_connection().await;
    let mut second_peer = dialer.queue_connection().await;

    let config = ClientConfig::new("requested-id")
        .protocol_version(ProtocolVersion::V5)
        .reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            multiplier: 1.0,
        });

    let first_broker = tokio::spawn(async move {
        match peer_read(&mut first_peer, ProtocolVersion::V5).await {
            Packet::Connect(connect) => assert_eq!(connect.client_id, "requested-id"),
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }
        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties {
                assigned_client_identifier: Some("srv-42".to_string()),
                ..Properties::default()
            },
        };
        common::peer_write(&mut first_peer, &Packet::ConnAck(connack), ProtocolVersion::V5).await;
        // Drop the transport without a graceful DISCONNECT, forcing the
        // reconnect loop to take over.
        drop(first_peer);
    });

    let second_broker = tokio::spawn(async move {
        match peer_read(&mut second_peer, ProtocolVersion::V5).await {
            Packet::Connect(connect) => assert_eq!(
                connect.client_id, "srv-42",
                "reconnect must adopt the server-assigned client id, not the originally configured one"
            ),
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }
        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        common::peer_write(&mut second_peer, &Packet::ConnAck(connack), ProtocolVersion::V5).await;
        second_peer
    });

    let client = MqttClient::connect("tcp://broker.example:1883", config, dialer)
        .await
        .expect("first handshake should succeed");

    first_broker.await.expect("first broker task panicked");
    second_broker.await.expect("second broker task panicked");

    client.shutdown();
}
