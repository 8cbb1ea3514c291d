//! End-to-end broker tests over real TCP sockets
//!
//! Each test starts a broker on its own port and drives it with raw MQTT
//! clients built on the crate codec, so the wire behavior is what gets
//! asserted.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use nanomq::auth::StaticAuth;
use nanomq::broker::{Broker, BrokerConfig};
use nanomq::codec::{Decoder, Encoder};
use nanomq::config::ListenerUrl;
use nanomq::protocol::{
    ConnAck, Connect, Disconnect, Packet, Properties, ProtocolVersion, Publish, QoS, ReasonCode,
    SubAck, Subscribe, SubscribeFilter, Unsubscribe, Will,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(18830);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        tcp: ListenerUrl::parse(&format!("broker+tcp://127.0.0.1:{}", port)).unwrap(),
        qos_duration: Duration::from_secs(2),
        ..BrokerConfig::default()
    }
}

async fn start_broker(config: BrokerConfig) -> Arc<Broker> {
    let broker = Arc::new(Broker::new(config));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker
}

struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl TestClient {
    async fn open(port: u16, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to broker");
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(version);
        Self {
            stream,
            encoder: Encoder::new(version),
            decoder,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("encode");
        self.stream.write_all(&buf).await.expect("write");
    }

    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf).expect("decode") {
                self.read_buf.advance(consumed);
                return Some(packet);
            }
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            match timeout(remaining, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    async fn connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn connect(&mut self, client_id: &str, clean_start: bool) -> ConnAck {
        self.connect_with(Connect {
            protocol_version: ProtocolVersion::V311,
            client_id: client_id.to_string(),
            clean_start,
            ..Default::default()
        })
        .await
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                qos,
            }],
            properties: Properties::default(),
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(1);
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
            properties: Properties::default(),
        }))
        .await;

        if qos == QoS::AtLeastOnce {
            match self.recv().await {
                Some(Packet::PubAck(_)) => {}
                other => panic!("expected PUBACK, got {:?}", other),
            }
        }
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect(Disconnect::default())).await;
        let _ = self.stream.shutdown().await;
    }
}

// ============================================================================
// Connection basics
// ============================================================================

#[tokio::test]
async fn connect_and_ping() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client.connect("basic", true).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
    assert!(!ack.session_present);

    client.send(&Packet::PingReq).await;
    assert!(matches!(client.recv().await, Some(Packet::PingResp)));
}

#[tokio::test]
async fn empty_client_id_requires_clean_start() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client.connect("", false).await;
    assert_eq!(ack.reason_code, ReasonCode::ClientIdNotValid);

    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client.connect("", true).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
}

#[tokio::test]
async fn v5_assigns_generated_client_id() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut client = TestClient::open(port, ProtocolVersion::V5).await;
    let ack = client
        .connect_with(Connect {
            protocol_version: ProtocolVersion::V5,
            client_id: String::new(),
            clean_start: true,
            ..Default::default()
        })
        .await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
    let assigned = ack.properties.assigned_client_identifier.expect("assigned id");
    assert!(assigned.starts_with("nanomq-"));
}

#[tokio::test]
async fn rejects_bad_credentials() {
    let port = next_port();
    let config = test_config(port);
    let auth = Arc::new(StaticAuth::new(
        false,
        [("admin".to_string(), "public".to_string())],
    ));
    let broker = Arc::new(Broker::with_authenticator(config, auth));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client
        .connect_with(Connect {
            client_id: "intruder".to_string(),
            username: Some("admin".to_string()),
            password: Some(Bytes::from("wrong")),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.reason_code, ReasonCode::BadUserNameOrPassword);

    // anonymous is refused outright
    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client.connect("anon", true).await;
    assert_eq!(ack.reason_code, ReasonCode::NotAuthorized);

    // the right password gets in
    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client
        .connect_with(Connect {
            client_id: "admin-client".to_string(),
            username: Some("admin".to_string()),
            password: Some(Bytes::from("public")),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn wildcard_fanout_qos0() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("sub-a", true).await;
    let ack = subscriber.subscribe(1, "sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(ack.reason_codes, vec![ReasonCode::GrantedQoS1]);

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("pub-b", true).await;
    publisher
        .publish("sensors/room1/temp", b"23", QoS::AtMostOnce, false)
        .await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "sensors/room1/temp");
    assert_eq!(publish.payload, Bytes::from("23"));
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(!publish.retain);
}

#[tokio::test]
async fn delivered_qos_is_min_of_publish_and_subscription() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("min-sub", true).await;
    subscriber.subscribe(1, "updates", QoS::AtMostOnce).await;

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("min-pub", true).await;
    publisher.publish("updates", b"x", QoS::AtLeastOnce, false).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.packet_id.is_none());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("unsub", true).await;
    subscriber.subscribe(1, "news", QoS::AtMostOnce).await;

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["news".to_string()],
            properties: Properties::default(),
        }))
        .await;
    assert!(matches!(subscriber.recv().await, Some(Packet::UnsubAck(_))));

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("unsub-pub", true).await;
    publisher.publish("news", b"gone", QoS::AtMostOnce, false).await;

    assert!(subscriber.recv_within(Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn reserved_topics_invisible_to_root_wildcard() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("hash-sub", true).await;
    subscriber.subscribe(1, "#", QoS::AtMostOnce).await;

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("sys-pub", true).await;
    publisher.publish("$SYS/foo", b"hidden", QoS::AtMostOnce, false).await;

    assert!(subscriber.recv_within(Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn connect_events_appear_on_reserved_topic() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut monitor = TestClient::open(port, ProtocolVersion::V311).await;
    monitor.connect("monitor", true).await;
    monitor
        .subscribe(1, "$SYS/brokers/connected", QoS::AtMostOnce)
        .await;

    let mut device = TestClient::open(port, ProtocolVersion::V311).await;
    device.connect("device-42", false).await;

    let publish = monitor.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "$SYS/brokers/connected");
    let event: serde_json::Value = serde_json::from_slice(&publish.payload).unwrap();
    assert_eq!(event["client_id"], "device-42");
    assert_eq!(event["clean_start"], false);
}

// ============================================================================
// Retained messages
// ============================================================================

#[tokio::test]
async fn retain_then_late_subscribe() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("ret-pub", true).await;
    publisher
        .publish("status/device7", b"online", QoS::AtLeastOnce, true)
        .await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("ret-sub", true).await;
    subscriber.subscribe(1, "status/#", QoS::ExactlyOnce).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "status/device7");
    assert_eq!(publish.payload, Bytes::from("online"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.retain);

    // exactly once: no second copy
    assert!(subscriber.recv_within(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn retain_tombstone_clears_the_store() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("tomb-pub", true).await;
    publisher
        .publish("status/device7", b"online", QoS::AtLeastOnce, true)
        .await;
    // empty retained payload removes the entry
    publisher
        .publish("status/device7", b"", QoS::AtMostOnce, true)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("tomb-sub", true).await;
    subscriber.subscribe(1, "status/#", QoS::AtMostOnce).await;

    assert!(subscriber.recv_within(Duration::from_millis(500)).await.is_none());
}

// ============================================================================
// Will messages
// ============================================================================

#[tokio::test]
async fn will_fires_on_abnormal_disconnect() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut watcher = TestClient::open(port, ProtocolVersion::V311).await;
    watcher.connect("watcher", true).await;
    watcher.subscribe(1, "goodbye", QoS::AtLeastOnce).await;

    let mut doomed = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = doomed
        .connect_with(Connect {
            client_id: "doomed".to_string(),
            will: Some(Will {
                topic: "goodbye".to_string(),
                payload: Bytes::from("bye"),
                qos: QoS::AtLeastOnce,
                retain: false,
                properties: Properties::default(),
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.reason_code, ReasonCode::Success);

    // sever the connection without a DISCONNECT packet
    drop(doomed);

    let publish = watcher.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "goodbye");
    assert_eq!(publish.payload, Bytes::from("bye"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn will_suppressed_on_clean_disconnect() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut watcher = TestClient::open(port, ProtocolVersion::V311).await;
    watcher.connect("quiet-watcher", true).await;
    watcher.subscribe(1, "goodbye/quiet", QoS::AtLeastOnce).await;

    let mut polite = TestClient::open(port, ProtocolVersion::V311).await;
    polite
        .connect_with(Connect {
            client_id: "polite".to_string(),
            will: Some(Will {
                topic: "goodbye/quiet".to_string(),
                payload: Bytes::from("bye"),
                qos: QoS::AtLeastOnce,
                retain: false,
                properties: Properties::default(),
            }),
            ..Default::default()
        })
        .await;
    polite.disconnect().await;

    assert!(watcher.recv_within(Duration::from_millis(500)).await.is_none());
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn persistent_session_resumes_and_replays() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    // x1 subscribes with clean_start=false, then leaves cleanly
    let mut x1 = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = x1.connect("x1", false).await;
    assert!(!ack.session_present);
    x1.subscribe(1, "alerts/#", QoS::AtLeastOnce).await;
    x1.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // published while x1 is away
    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("alert-pub", true).await;
    publisher.publish("alerts/fire", b"P", QoS::AtLeastOnce, false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // resume without re-subscribing
    let mut x1 = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = x1.connect("x1", false).await;
    assert!(ack.session_present);

    let publish = x1.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "alerts/fire");
    assert_eq!(publish.payload, Bytes::from("P"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.packet_id.is_some());
}

#[tokio::test]
async fn clean_start_discards_cached_subscriptions() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut x2 = TestClient::open(port, ProtocolVersion::V311).await;
    x2.connect("x2", false).await;
    x2.subscribe(1, "alerts/#", QoS::AtLeastOnce).await;
    x2.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // reconnect clean: the session and its filters are gone
    let mut x2 = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = x2.connect("x2", true).await;
    assert!(!ack.session_present);

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("x2-pub", true).await;
    publisher.publish("alerts/fire", b"P", QoS::AtLeastOnce, false).await;

    assert!(x2.recv_within(Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn duplicate_client_id_evicts_older_pipe() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut first = TestClient::open(port, ProtocolVersion::V311).await;
    first.connect("twin", true).await;

    let mut second = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = second.connect("twin", true).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);

    // the older pipe is closed by the broker
    assert!(first.recv_within(Duration::from_secs(2)).await.is_none());

    // the newer pipe still works
    second.send(&Packet::PingReq).await;
    assert!(matches!(second.recv().await, Some(Packet::PingResp)));
}

// ============================================================================
// QoS handshakes
// ============================================================================

#[tokio::test]
async fn qos2_routes_only_after_pubrel() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("q2-sub", true).await;
    subscriber.subscribe(1, "exact", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("q2-pub", true).await;

    publisher
        .send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "exact".into(),
            packet_id: Some(7),
            payload: Bytes::from("once"),
            properties: Properties::default(),
        }))
        .await;

    match publisher.recv().await {
        Some(Packet::PubRec(rec)) => assert_eq!(rec.packet_id, 7),
        other => panic!("expected PUBREC, got {:?}", other),
    }

    // nothing routed until PUBREL completes the inbound handshake
    assert!(subscriber.recv_within(Duration::from_millis(300)).await.is_none());

    publisher
        .send(&Packet::PubRel(nanomq::protocol::PubRel::new(7)))
        .await;
    match publisher.recv().await {
        Some(Packet::PubComp(comp)) => assert_eq!(comp.packet_id, 7),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("once"));
    assert_eq!(publish.qos, QoS::ExactlyOnce);

    // complete the outbound handshake as the subscriber
    let packet_id = publish.packet_id.expect("qos2 packet id");
    subscriber
        .send(&Packet::PubRec(nanomq::protocol::PubRec::new(packet_id)))
        .await;
    match subscriber.recv().await {
        Some(Packet::PubRel(rel)) => assert_eq!(rel.packet_id, packet_id),
        other => panic!("expected PUBREL, got {:?}", other),
    }
    subscriber
        .send(&Packet::PubComp(nanomq::protocol::PubComp::new(packet_id)))
        .await;
}

#[tokio::test]
async fn unacked_qos1_is_retransmitted_with_dup() {
    let port = next_port();
    let mut config = test_config(port);
    config.qos_duration = Duration::from_secs(1);
    let _broker = start_broker(config).await;

    let mut subscriber = TestClient::open(port, ProtocolVersion::V311).await;
    subscriber.connect("retry-sub", true).await;
    subscriber.subscribe(1, "retry", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::open(port, ProtocolVersion::V311).await;
    publisher.connect("retry-pub", true).await;
    publisher.publish("retry", b"again", QoS::AtLeastOnce, false).await;

    let first = subscriber.expect_publish().await;
    assert!(!first.dup);
    let packet_id = first.packet_id.expect("packet id");

    // withhold the PUBACK; the qos timer must re-send with DUP
    let second = match subscriber.recv_within(Duration::from_secs(4)).await {
        Some(Packet::Publish(p)) => p,
        other => panic!("expected retransmitted PUBLISH, got {:?}", other),
    };
    assert!(second.dup);
    assert_eq!(second.packet_id, Some(packet_id));

    subscriber
        .send(&Packet::PubAck(nanomq::protocol::PubAck::new(packet_id)))
        .await;
}

// ============================================================================
// Keepalive
// ============================================================================

#[tokio::test]
async fn idle_connection_is_dropped_after_keepalive_window() {
    let port = next_port();
    let _broker = start_broker(test_config(port)).await;

    let mut client = TestClient::open(port, ProtocolVersion::V311).await;
    let ack = client
        .connect_with(Connect {
            client_id: "sleepy".to_string(),
            keep_alive: 1,
            ..Default::default()
        })
        .await;
    assert_eq!(ack.reason_code, ReasonCode::Success);

    // no traffic: the broker must close within ~1.5x the keepalive
    let start = std::time::Instant::now();
    assert!(client.recv_within(Duration::from_secs(5)).await.is_none());
    assert!(start.elapsed() >= Duration::from_millis(1200));
}
