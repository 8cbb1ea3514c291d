//! Bridge tests: two real brokers, one bridging into the other
//!
//! The edge broker forwards selected local topics upstream and injects
//! upstream traffic from its configured subscriptions as local publishes.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use nanomq::broker::{Broker, BrokerConfig};
use nanomq::codec::{Decoder, Encoder};
use nanomq::config::{BridgeSettings, ListenerUrl};
use nanomq::protocol::{
    ConnAck, Connect, Packet, Properties, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    SubscribeFilter,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19830);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn config(port: u16) -> BrokerConfig {
    BrokerConfig {
        tcp: ListenerUrl::parse(&format!("broker+tcp://127.0.0.1:{}", port)).unwrap(),
        ..BrokerConfig::default()
    }
}

async fn start_broker(port: u16) -> Arc<Broker> {
    let broker = Arc::new(Broker::new(config(port)));
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
    async fn connect(port: u16, client_id: &str) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(ProtocolVersion::V311);
        let mut client = Self {
            stream,
            encoder: Encoder::new(ProtocolVersion::V311),
            decoder,
            read_buf: BytesMut::with_capacity(4096),
        };

        client
            .send(&Packet::Connect(Box::new(Connect {
                client_id: client_id.to_string(),
                ..Default::default()
            })))
            .await;
        match client.recv().await {
            Some(Packet::ConnAck(ConnAck { .. })) => client,
            other => panic!("expected CONNACK, got {:?}", other),
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

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id: 1,
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

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(1);
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
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
}

fn bridge_settings(upstream_port: u16) -> BridgeSettings {
    BridgeSettings::parse(&format!(
        "bridge.address=127.0.0.1:{}\n\
         bridge.proto_ver=4\n\
         bridge.clientid=edge-bridge\n\
         bridge.clean_start=true\n\
         bridge.keepalive=30\n\
         bridge.parallel=4\n\
         bridge.forwards=sensors/#\n\
         bridge.subscription.1.topic=cmd/#\n\
         bridge.subscription.1.qos=1\n",
        upstream_port
    ))
    .unwrap()
}

#[tokio::test]
async fn forwards_matching_local_traffic_upstream() {
    let upstream_port = next_port();
    let edge_port = next_port();
    let _upstream = start_broker(upstream_port).await;
    let edge = start_broker(edge_port).await;

    let bridge = edge.attach_bridge(bridge_settings(upstream_port));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bridge.is_connected());

    let mut upstream_sub = TestClient::connect(upstream_port, "up-sub").await;
    upstream_sub.subscribe("sensors/#", QoS::AtLeastOnce).await;

    let mut edge_pub = TestClient::connect(edge_port, "edge-pub").await;
    edge_pub.publish("sensors/room1/temp", b"23", QoS::AtLeastOnce).await;

    let publish = upstream_sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "sensors/room1/temp");
    assert_eq!(publish.payload, Bytes::from("23"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn ignores_local_traffic_outside_forward_filters() {
    let upstream_port = next_port();
    let edge_port = next_port();
    let _upstream = start_broker(upstream_port).await;
    let edge = start_broker(edge_port).await;

    let bridge = edge.attach_bridge(bridge_settings(upstream_port));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bridge.is_connected());

    let mut upstream_sub = TestClient::connect(upstream_port, "up-sub2").await;
    upstream_sub.subscribe("#", QoS::AtMostOnce).await;

    let mut edge_pub = TestClient::connect(edge_port, "edge-pub2").await;
    edge_pub.publish("private/topic", b"stays", QoS::AtMostOnce).await;

    assert!(upstream_sub.recv_within(Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn injects_upstream_subscription_traffic_locally() {
    let upstream_port = next_port();
    let edge_port = next_port();
    let _upstream = start_broker(upstream_port).await;
    let edge = start_broker(edge_port).await;

    let bridge = edge.attach_bridge(bridge_settings(upstream_port));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bridge.is_connected());

    let mut edge_sub = TestClient::connect(edge_port, "edge-sub").await;
    edge_sub.subscribe("cmd/#", QoS::AtLeastOnce).await;

    let mut upstream_pub = TestClient::connect(upstream_port, "up-pub").await;
    upstream_pub.publish("cmd/reboot", b"now", QoS::AtLeastOnce).await;

    let publish = edge_sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "cmd/reboot");
    assert_eq!(publish.payload, Bytes::from("now"));
}
