//! Flow control and topic-alias lifecycle against a fake broker peer
//! (spec.md section 8, scenarios 3 and 6): the outbound receive-maximum
//! window queues a publish rather than blocking the caller, and a topic
//! alias is established once and then referenced bare.

mod common;

use std::time::Duration;

use mqtt_engine::codec::ack::Ack;
use mqtt_engine::codec::connect::ConnAck;
use mqtt_engine::codec::property::Properties;
use mqtt_engine::codec::Packet;
use mqtt_engine::delivery::PublishRequest;
use mqtt_engine::{ClientConfig, MqttClient, ProtocolVersion, QoS, ReasonCode};

use common::{peer_read, peer_write, QueuedDialer};

#[tokio::test]
async fn outbound_receive_maximum_queues_beyond_the_window() {
    let dialer = QueuedDialer::new();
    let mut peer = dialer.queue_connection().await;

    let config = ClientConfig::new("recv-max-client").protocol_version(ProtocolVersion::V5);

    let broker = tokio::spawn(async move {
        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Connect(_) => {}
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }
        // Grant exactly one slot of outbound receive-maximum.
        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties { receive_maximum: Some(1), ..Properties::default() },
        };
        peer_write(&mut peer, &Packet::ConnAck(connack), ProtocolVersion::V5).await;

        let first_id = match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "a/1");
                p.packet_id.unwrap()
            }
            other => panic!("expected first PUBLISH, got {}", other.type_name()),
        };

        // The second publish must not arrive yet: the window is full
        // until the first is acknowledged.
        let second_or_timeout = tokio::time::timeout(Duration::from_millis(200), common::peer_read(&mut peer, ProtocolVersion::V5));
        assert!(second_or_timeout.await.is_err(), "second publish should be queued, not sent yet");

        let puback = Ack { packet_id: first_id, reason_code: ReasonCode::Success, properties: Properties::default() };
        peer_write(&mut peer, &Packet::PubAck(puback), ProtocolVersion::V5).await;

        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Publish(p) => assert_eq!(p.topic, "a/2"),
            other => panic!("expected second PUBLISH after the window freed up, got {}", other.type_name()),
        }

        peer
    });

    let client = MqttClient::connect("tcp://broker.example:1883", config, dialer)
        .await
        .expect("handshake should succeed");

    let first = client
        .publish(PublishRequest { topic: "a/1".into(), payload: b"x".to_vec(), qos: QoS::AtLeastOnce, ..Default::default() })
        .await
        .unwrap();
    let second = client
        .publish(PublishRequest { topic: "a/2".into(), payload: b"y".to_vec(), qos: QoS::AtLeastOnce, ..Default::default() })
        .await
        .unwrap();

    broker.await.expect("broker task panicked");
    first.wait_timeout(Duration::from_secs(2)).await.unwrap();
    second.wait_timeout(Duration::from_secs(2)).await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn topic_alias_is_established_once_then_sent_bare() {
    let dialer = QueuedDialer::new();
    let mut peer = dialer.queue_connection().await;

    let config = ClientConfig::new("alias-client").protocol_version(ProtocolVersion::V5);

    let broker = tokio::spawn(async move {
        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Connect(_) => {}
            other => panic!("expected CONNECT, got {}", other.type_name()),
        }
        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties: Properties { topic_alias_maximum: Some(10), ..Properties::default() },
        };
        peer_write(&mut peer, &Packet::ConnAck(connack), ProtocolVersion::V5).await;

        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "metrics/cpu");
                assert_eq!(p.properties.topic_alias, Some(1));
            }
            other => panic!("expected first PUBLISH with topic and alias, got {}", other.type_name()),
        }
        match peer_read(&mut peer, ProtocolVersion::V5).await {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "", "second publish should reference the alias bare");
                assert_eq!(p.properties.topic_alias, Some(1));
            }
            other => panic!("expected second PUBLISH with bare alias, got {}", other.type_name()),
        }
        peer
    });

    let client = MqttClient::connect("tcp://broker.example:1883", config, dialer)
        .await
        .expect("handshake should succeed");

    client
        .publish(PublishRequest {
            topic: "metrics/cpu".into(),
            payload: b"1".to_vec(),
            qos: QoS::AtMostOnce,
            use_topic_alias: true,
            ..Default::default()
        })
        .await
        .unwrap();
    client
        .publish(PublishRequest {
            topic: "metrics/cpu".into(),
            payload: b"2".to_vec(),
            qos: QoS::AtMostOnce,
            use_topic_alias: true,
            ..Default::default()
        })
        .await
        .unwrap();

    broker.await.expect("broker task panicked");
    client.disconnect().await.unwrap();
}
