//! Per-connection protocol driver
//!
//! Each accepted socket runs one of these as a tokio task: read the
//! CONNECT, then loop over socket input, the outbound queue, the keepalive
//! deadline and the qos retry tick. Every transition that touches the
//! socket is a suspension point; the runtime resumes the task on whichever
//! worker is free. Inbound packets are processed in wire order, outbound
//! fan-out in queue order.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    DecodeError, Disconnect, Packet, Properties, ProtocolError, ProtocolVersion, Publish, QoS,
    ReasonCode,
};
use crate::session::{ConnParam, InflightMessage, Qos2Phase, Session};

use super::{PipeId, Shared};

/// Deadline for the CONNECT packet after the socket opens
const CONNECT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Protocol(ProtocolError),
    /// Keepalive expired (1.5x the advertised interval)
    KeepAlive,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "io error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
            ConnectionError::KeepAlive => write!(f, "keepalive expired"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Why a connected pipe stopped
enum CloseReason {
    /// Client sent DISCONNECT; will is discarded
    CleanDisconnect,
    /// v5 DISCONNECT with reason 0x04; will is still published
    DisconnectWithWill,
    /// Evicted because the same client id connected again
    TakenOver,
    ServerShutdown,
}

/// State established by a successful CONNECT
pub(crate) struct Active {
    pub client_id: Arc<str>,
    pub cparam: Arc<ConnParam>,
    pub session: Arc<RwLock<Session>>,
}

pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) pipe: PipeId,
    pub(crate) shared: Arc<Shared>,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Option<mpsc::Receiver<Packet>>,
    pub(crate) active: Option<Active>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, pipe: PipeId, shared: Arc<Shared>) -> Self {
        // The outbound channel is the per-pipe queue bounded by msq_len.
        let (outbound_tx, outbound_rx) = mpsc::channel(shared.msq_len.max(1));
        let decoder = Decoder::new().with_property_limit(shared.property_size);

        Self {
            stream,
            pipe,
            shared,
            decoder,
            encoder: Encoder::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            active: None,
        }
    }

    /// Drive the connection to completion, including teardown
    pub(crate) async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let connected = tokio::select! {
            result = timeout(CONNECT_DEADLINE, self.read_connect()) => match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!("pipe {}: connect failed: {}", self.pipe, e);
                    false
                }
                Err(_) => {
                    debug!("pipe {}: no CONNECT within deadline", self.pipe);
                    false
                }
            },
            _ = shutdown.recv() => false,
        };

        if !connected {
            // CONNECT may have failed after registration; clean up quietly
            self.teardown(false);
            return;
        }

        let outcome = self.run_connected(&mut shutdown).await;
        let publish_will = match &outcome {
            Ok(CloseReason::CleanDisconnect) | Ok(CloseReason::ServerShutdown) => false,
            Ok(CloseReason::DisconnectWithWill) | Ok(CloseReason::TakenOver) => true,
            // io error, malformed frame or keepalive expiry: abnormal
            Err(_) => true,
        };

        if let Err(e) = &outcome {
            debug!("pipe {}: closed abnormally: {}", self.pipe, e);
        }

        self.teardown(publish_will);
        let _ = self.stream.shutdown().await;
    }

    async fn run_connected(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<CloseReason, ConnectionError> {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return Err(ProtocolError::ProtocolViolation("connection reused").into());
        };

        let keep_alive = self
            .active
            .as_ref()
            .map(|a| a.cparam.keep_alive)
            .unwrap_or(0);
        // The server closes idle pipes after 1.5x the advertised keepalive
        let idle_window = if keep_alive > 0 {
            Some(Duration::from_millis(keep_alive as u64 * 1500))
        } else {
            None
        };
        let far_future = || Instant::now() + Duration::from_secs(86_400 * 365);
        let mut idle_deadline = idle_window.map(|w| Instant::now() + w).unwrap_or_else(far_future);

        let mut retry_ticker = tokio::time::interval(self.shared.qos_duration);
        retry_ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    self.send_server_disconnect(ReasonCode::ServerShuttingDown).await;
                    return Ok(CloseReason::ServerShutdown);
                }

                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            // peer vanished without DISCONNECT
                            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                        }
                        Ok(_) => {
                            loop {
                                let decoded = match self.decoder.decode(&self.read_buf) {
                                    Ok(d) => d,
                                    Err(e) => {
                                        self.send_server_disconnect(ReasonCode::MalformedPacket).await;
                                        return Err(e.into());
                                    }
                                };
                                let Some((packet, consumed)) = decoded else { break };
                                self.read_buf.advance(consumed);

                                if let Some(w) = idle_window {
                                    idle_deadline = Instant::now() + w;
                                }

                                match self.handle_packet(packet).await {
                                    Ok(None) => {}
                                    Ok(Some(reason)) => return Ok(reason),
                                    Err(e) => {
                                        if let ConnectionError::Protocol(_) = e {
                                            self.send_server_disconnect(ReasonCode::ProtocolError).await;
                                        }
                                        return Err(e);
                                    }
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                packet = outbound_rx.recv() => {
                    match packet {
                        Some(packet) => {
                            if let Some(reason) = self.send_outbound(packet).await? {
                                return Ok(reason);
                            }
                        }
                        // the handle was dropped during takeover teardown
                        None => return Ok(CloseReason::TakenOver),
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    debug!("pipe {}: keepalive expired", self.pipe);
                    self.send_server_disconnect(ReasonCode::KeepAliveTimeout).await;
                    return Err(ConnectionError::KeepAlive);
                }

                _ = retry_ticker.tick() => {
                    self.retry_unacked().await?;
                }
            }
        }
    }

    /// Dispatch one inbound packet by command type
    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<CloseReason>, ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into())
            }
            Packet::Publish(publish) => self.handle_publish(publish).await.map(|_| None),
            Packet::PubAck(ack) => self.handle_puback(ack).map(|_| None),
            Packet::PubRec(rec) => self.handle_pubrec(rec).await.map(|_| None),
            Packet::PubRel(rel) => self.handle_pubrel(rel).await.map(|_| None),
            Packet::PubComp(comp) => self.handle_pubcomp(comp).map(|_| None),
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await.map(|_| None),
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe).await.map(|_| None)
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?;
                Ok(None)
            }
            Packet::Disconnect(disconnect) => {
                debug!(
                    "pipe {}: DISCONNECT ({})",
                    self.pipe, disconnect.reason_code
                );
                if disconnect.reason_code == ReasonCode::DisconnectWithWill {
                    Ok(Some(CloseReason::DisconnectWithWill))
                } else {
                    Ok(Some(CloseReason::CleanDisconnect))
                }
            }
            other => {
                warn!(
                    "pipe {}: unexpected packet type {} from client",
                    self.pipe,
                    other.packet_type()
                );
                Ok(None)
            }
        }
    }

    /// Drain one packet from the outbound queue onto the socket
    async fn send_outbound(&mut self, packet: Packet) -> Result<Option<CloseReason>, ConnectionError> {
        match packet {
            Packet::Publish(publish) => {
                self.write_publish(publish).await?;
                Ok(None)
            }
            Packet::Disconnect(disconnect) => {
                // server-initiated: takeover eviction or shutdown
                let reason = disconnect.reason_code;
                if self.encoder_version() == ProtocolVersion::V5 {
                    let _ = self.write_packet(&Packet::Disconnect(disconnect)).await;
                }
                if reason == ReasonCode::SessionTakenOver {
                    Ok(Some(CloseReason::TakenOver))
                } else {
                    Ok(Some(CloseReason::ServerShutdown))
                }
            }
            other => {
                self.write_packet(&other).await?;
                Ok(None)
            }
        }
    }

    /// Write an outbound PUBLISH, stamping a packet id and recording the
    /// in-flight entry for qos > 0.
    pub(crate) async fn write_publish(&mut self, mut publish: Publish) -> Result<(), ConnectionError> {
        if publish.qos != QoS::AtMostOnce {
            let Some(active) = self.active.as_ref() else {
                return Err(ProtocolError::ProtocolViolation("publish before CONNECT").into());
            };
            let mut session = active.session.write();
            let packet_id = session.next_packet_id();
            publish.packet_id = Some(packet_id);
            session.inflight_out.insert(
                packet_id,
                InflightMessage {
                    publish: publish.clone(),
                    phase: if publish.qos == QoS::ExactlyOnce {
                        Some(Qos2Phase::AwaitingPubRec)
                    } else {
                        None
                    },
                    sent_at: std::time::Instant::now(),
                    retries: 0,
                },
            );
        }

        self.write_packet(&Packet::Publish(publish)).await
    }

    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(ProtocolError::from)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    fn encoder_version(&self) -> ProtocolVersion {
        self.decoder.protocol_version().unwrap_or(ProtocolVersion::V311)
    }

    /// Best-effort v5 DISCONNECT with a reason code; v3.1.1 closes silently
    async fn send_server_disconnect(&mut self, reason_code: ReasonCode) {
        if self.encoder_version() == ProtocolVersion::V5 {
            let disconnect = Packet::Disconnect(Disconnect {
                reason_code,
                properties: Properties::default(),
            });
            let _ = self.write_packet(&disconnect).await;
            let _ = self.stream.flush().await;
        }
    }
}
