//! Bridge client
//!
//! Maintains one upstream MQTT connection driven by its own task and fed
//! through a bounded command channel (`bridge.parallel` outstanding
//! operations). Reconnects with doubling backoff; keepalive is a periodic
//! PINGREQ. Redelivery of unacknowledged upstream traffic is out of scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::Router;
use crate::codec::{Decoder, Encoder};
use crate::config::BridgeSettings;
use crate::protocol::{
    Connect, Disconnect, Packet, Properties, PubAck, Publish, QoS, ReasonCode, Subscribe,
    SubscribeFilter,
};
use crate::topic::topic_matches_filter;

use super::BridgeError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

enum Command {
    Forward(Publish),
}

pub struct BridgeClient {
    settings: BridgeSettings,
    command_tx: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
}

impl BridgeClient {
    /// Start the bridge task and return the handle the router feeds
    pub fn spawn(
        settings: BridgeSettings,
        router: Arc<Router>,
        shutdown: broadcast::Receiver<()>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(settings.parallel.max(1));
        let connected = Arc::new(AtomicBool::new(false));

        let client = Arc::new(Self {
            settings: settings.clone(),
            command_tx,
            connected: connected.clone(),
        });

        tokio::spawn(connection_loop(settings, router, command_rx, shutdown, connected));

        client
    }

    /// Does any forward filter match this topic?
    pub fn should_forward(&self, topic: &str) -> bool {
        self.settings
            .forwards
            .iter()
            .any(|filter| topic_matches_filter(topic, filter))
    }

    /// Duplicate a locally routed publish upstream; payload, qos and
    /// retain are preserved. A full command queue drops the copy.
    pub fn forward(&self, publish: &Publish) {
        let copy = Publish {
            dup: false,
            qos: publish.qos,
            retain: publish.retain,
            topic: publish.topic.clone(),
            packet_id: None,
            payload: publish.payload.clone(),
            properties: publish.properties.clone(),
        };
        if self.command_tx.try_send(Command::Forward(copy)).is_err() {
            debug!("bridge queue full, dropping forward for {}", publish.topic);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn connection_loop(
    settings: BridgeSettings,
    router: Arc<Router>,
    mut command_rx: mpsc::Receiver<Command>,
    mut shutdown: broadcast::Receiver<()>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        debug!("bridge: connecting to {}", settings.address);

        // connect_and_run watches the shutdown channel itself
        let result =
            connect_and_run(&settings, &router, &mut command_rx, &mut shutdown, &connected).await;
        connected.store(false, Ordering::Relaxed);

        match result {
            Ok(()) => {
                info!("bridge: disconnected cleanly");
                return;
            }
            Err(e) => {
                error!("bridge: connection failed: {}", e);
                debug!("bridge: reconnecting in {:?}", backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.recv() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn connect_and_run(
    settings: &BridgeSettings,
    router: &Arc<Router>,
    command_rx: &mut mpsc::Receiver<Command>,
    shutdown: &mut broadcast::Receiver<()>,
    connected: &AtomicBool,
) -> Result<(), BridgeError> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&settings.address))
        .await
        .map_err(|_| BridgeError::Timeout)??;

    let encoder = Encoder::new(settings.proto_ver);
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(settings.proto_ver);

    let mut write_buf = BytesMut::with_capacity(4096);
    let mut read_buf = BytesMut::with_capacity(4096);

    let connect = Packet::Connect(Box::new(Connect {
        protocol_version: settings.proto_ver,
        client_id: settings.clientid.clone(),
        clean_start: settings.clean_start,
        keep_alive: settings.keepalive,
        username: settings.username.clone(),
        password: settings.password.as_ref().map(|p| Bytes::from(p.clone())),
        will: None,
        properties: Properties::default(),
    }));
    encoder.encode(&connect, &mut write_buf)?;
    stream.write_all(&write_buf).await?;

    // CONNACK must arrive within the connect deadline
    let connack = timeout(CONNECT_TIMEOUT, async {
        loop {
            if let Some((packet, consumed)) = decoder.decode(&read_buf)? {
                read_buf.advance(consumed);
                return Ok::<Packet, BridgeError>(packet);
            }
            let n = stream.read_buf(&mut read_buf).await?;
            if n == 0 {
                return Err(BridgeError::Protocol("connection closed before CONNACK"));
            }
        }
    })
    .await
    .map_err(|_| BridgeError::Timeout)??;

    match connack {
        Packet::ConnAck(ack) if ack.reason_code == ReasonCode::Success => {
            info!(
                "bridge: connected to {} (session_present: {})",
                settings.address, ack.session_present
            );
        }
        Packet::ConnAck(ack) => return Err(BridgeError::Rejected(ack.reason_code)),
        _ => return Err(BridgeError::Protocol("expected CONNACK")),
    }
    connected.store(true, Ordering::Relaxed);

    // Ingress subscriptions placed once per (re)connect
    let mut next_packet_id: u16 = 1;
    if !settings.subscriptions.is_empty() {
        let filters = settings
            .subscriptions
            .iter()
            .map(|s| SubscribeFilter {
                filter: s.topic.clone(),
                qos: s.qos,
            })
            .collect();
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: next_packet_id,
            filters,
            properties: Properties::default(),
        });
        next_packet_id = next_packet_id.wrapping_add(1).max(1);

        write_buf.clear();
        encoder.encode(&subscribe, &mut write_buf)?;
        stream.write_all(&write_buf).await?;
        debug!(
            "bridge: subscribed to {} upstream filters",
            settings.subscriptions.len()
        );
    }

    let keepalive = Duration::from_secs(settings.keepalive.max(1) as u64);
    let mut keepalive_ticker = tokio::time::interval(keepalive);
    keepalive_ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                let disconnect = Packet::Disconnect(Disconnect::default());
                write_buf.clear();
                if encoder.encode(&disconnect, &mut write_buf).is_ok() {
                    let _ = stream.write_all(&write_buf).await;
                }
                return Ok(());
            }

            command = command_rx.recv() => {
                match command {
                    Some(Command::Forward(mut publish)) => {
                        if publish.qos != QoS::AtMostOnce {
                            publish.packet_id = Some(next_packet_id);
                            next_packet_id = next_packet_id.wrapping_add(1).max(1);
                        }
                        write_buf.clear();
                        encoder.encode(&Packet::Publish(publish), &mut write_buf)?;
                        stream.write_all(&write_buf).await?;
                    }
                    // the broker went away; treat as clean shutdown
                    None => return Ok(()),
                }
            }

            result = stream.read_buf(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(BridgeError::Protocol("upstream closed the connection"));
                }
                while let Some((packet, consumed)) = decoder.decode(&read_buf)? {
                    read_buf.advance(consumed);
                    match packet {
                        Packet::Publish(publish) => {
                            debug!("bridge: injecting upstream publish on {}", publish.topic);
                            // acknowledge qos1 upstream before injecting
                            if publish.qos == QoS::AtLeastOnce {
                                if let Some(packet_id) = publish.packet_id {
                                    write_buf.clear();
                                    encoder.encode(&Packet::PubAck(PubAck::new(packet_id)), &mut write_buf)?;
                                    stream.write_all(&write_buf).await?;
                                }
                            }
                            let mut local = publish;
                            local.packet_id = None;
                            local.dup = false;
                            router.publish_from_bridge(&local);
                        }
                        Packet::PingResp | Packet::SubAck(_) | Packet::PubAck(_) => {}
                        Packet::Disconnect(disconnect) => {
                            warn!("bridge: upstream DISCONNECT ({})", disconnect.reason_code);
                            return Err(BridgeError::Protocol("upstream disconnected"));
                        }
                        other => {
                            debug!("bridge: ignoring upstream packet type {}", other.packet_type());
                        }
                    }
                }
            }

            _ = keepalive_ticker.tick() => {
                write_buf.clear();
                encoder.encode(&Packet::PingReq, &mut write_buf)?;
                stream.write_all(&write_buf).await?;
            }
        }
    }
}
