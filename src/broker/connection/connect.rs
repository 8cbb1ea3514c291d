//! CONNECT handling: authentication, session activation, takeover
//! eviction, CONNACK, the connect notification, and resumed delivery.

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Active, Connection, ConnectionError};
use crate::broker::notify::connect_notification;
use crate::protocol::{
    ConnAck, Connect, Disconnect, Packet, Properties, ProtocolError, ProtocolVersion, Publish,
    QoS, ReasonCode,
};
use crate::session::{ConnParam, Qos2Phase, EXPIRY_NEVER};
use crate::topic::Subscription;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read packets until the CONNECT arrives, then activate the session
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => Err(ProtocolError::ProtocolViolation(
                            "first packet must be CONNECT",
                        )
                        .into()),
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    // v5 clients get a reason before the close
                    if self.decoder.protocol_version() == Some(ProtocolVersion::V5) {
                        self.encoder.set_protocol_version(ProtocolVersion::V5);
                        let connack = ConnAck {
                            session_present: false,
                            reason_code: ReasonCode::MalformedPacket,
                            properties: Properties::default(),
                        };
                        let _ = self.write_packet(&Packet::ConnAck(connack)).await;
                        let _ = self.stream.flush().await;
                    }
                    return Err(e.into());
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let protocol_version = connect.protocol_version;
        self.decoder.set_protocol_version(protocol_version);
        self.encoder.set_protocol_version(protocol_version);

        // A zero-byte client id is only allowed with clean-start
        if connect.client_id.is_empty() && !connect.clean_start {
            self.reject_connect(ReasonCode::ClientIdNotValid).await?;
            return Err(ProtocolError::ProtocolViolation(
                "empty client id without clean start",
            )
            .into());
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("nanomq-{:08x}", rand_id() as u32).into()
        } else {
            connect.client_id.as_str().into()
        };
        let generated_id = connect.client_id.is_empty();

        debug!("pipe {}: CONNECT client_id={}", self.pipe, client_id);

        if !self
            .shared
            .authenticator
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
        {
            debug!("pipe {}: authentication failed for {}", self.pipe, client_id);
            let reason = if connect.username.is_some() {
                ReasonCode::BadUserNameOrPassword
            } else {
                ReasonCode::NotAuthorized
            };
            self.reject_connect(reason).await?;
            return Err(ProtocolError::NotAuthorized.into());
        }

        let cparam = Arc::new(ConnParam {
            client_id: client_id.clone(),
            protocol_version,
            clean_start: connect.clean_start,
            keep_alive: connect.keep_alive,
            username: connect.username.clone(),
            will: connect.will.clone(),
        });

        // A client id reconnecting while an older pipe is live forcibly
        // evicts the old pipe before the new session activates.
        if let Some(old_pipe) = self
            .shared
            .client_pipes
            .insert(client_id.clone(), self.pipe)
        {
            if old_pipe != self.pipe {
                if let Some((_, old_handle)) = self.shared.connections.remove(&old_pipe) {
                    debug!(
                        "pipe {}: evicting pipe {} holding client id {}",
                        self.pipe, old_pipe, client_id
                    );
                    let _ = old_handle.try_send(Packet::Disconnect(Disconnect {
                        reason_code: ReasonCode::SessionTakenOver,
                        properties: Properties::default(),
                    }));
                }
            }
        }

        let session_expiry = match protocol_version {
            ProtocolVersion::V5 => connect
                .properties
                .session_expiry_interval
                .unwrap_or(if connect.clean_start { 0 } else { EXPIRY_NEVER }),
            ProtocolVersion::V311 => {
                if connect.clean_start {
                    0
                } else {
                    EXPIRY_NEVER
                }
            }
        };

        // Clean start discards any cached session, including its detached
        // entries in the topic index.
        if connect.clean_start {
            if let Some(old_session) = self.shared.sessions.get(&client_id) {
                let filters: Vec<String> =
                    old_session.read().subscriptions.keys().cloned().collect();
                for filter in filters {
                    self.shared
                        .subscriptions
                        .unsubscribe_client(&filter, &client_id);
                }
                self.shared.sessions.remove(&client_id);
            }
        }

        let (session, resumed) = self.shared.sessions.activate(
            cparam.clone(),
            self.pipe,
            session_expiry,
            self.shared.msq_len,
        );

        // Register the outbound handle before anything can route to us
        let handle = Arc::new(crate::broker::ConnectionHandle {
            pipe: self.pipe,
            client_id: client_id.clone(),
            sender: self.outbound_tx.clone(),
        });
        self.shared.connections.insert(self.pipe, handle);

        self.active = Some(Active {
            client_id: client_id.clone(),
            cparam: cparam.clone(),
            session: session.clone(),
        });

        // Resumed sessions get their filters re-indexed under the new pipe
        if resumed {
            let filters: Vec<(String, QoS)> = {
                let s = session.read();
                s.subscriptions
                    .iter()
                    .map(|(f, q)| (f.clone(), *q))
                    .collect()
            };
            for (filter, qos) in filters {
                self.shared.subscriptions.subscribe(
                    &filter,
                    Subscription {
                        pipe: Some(self.pipe),
                        client_id: client_id.clone(),
                        qos,
                    },
                );
                self.shared.pipes.insert(self.pipe, &filter);
            }
        }

        let mut connack = ConnAck {
            session_present: resumed,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        if protocol_version == ProtocolVersion::V5 {
            connack.properties.retain_available = Some(1);
            connack.properties.wildcard_subscription_available = Some(1);
            connack.properties.subscription_identifier_available = Some(0);
            connack.properties.shared_subscription_available = Some(0);
            if generated_id {
                connack.properties.assigned_client_identifier = Some(client_id.to_string());
            }
        }
        self.write_packet(&Packet::ConnAck(connack)).await?;

        // Broker-internal connect event on the reserved topic
        self.shared.router.publish(&connect_notification(&cparam));

        if resumed {
            self.deliver_resumed(&session).await?;
        }

        Ok(())
    }

    /// Pending and unacknowledged messages owed to a resumed session
    async fn deliver_resumed(
        &mut self,
        session: &Arc<parking_lot::RwLock<crate::session::Session>>,
    ) -> Result<(), ConnectionError> {
        let pending = session.write().drain_pending();
        for publish in pending {
            self.write_publish(publish).await?;
        }

        // Unacknowledged qos>0 is re-sent with the original ids, DUP set
        let inflight: Vec<(u16, Publish, Option<Qos2Phase>)> = {
            let mut s = session.write();
            let now = std::time::Instant::now();
            s.inflight_out
                .iter_mut()
                .map(|(id, inflight)| {
                    inflight.sent_at = now;
                    inflight.retries += 1;
                    (*id, inflight.publish.clone(), inflight.phase)
                })
                .collect()
        };
        for (packet_id, mut publish, phase) in inflight {
            match phase {
                None | Some(Qos2Phase::AwaitingPubRec) => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    self.write_packet(&Packet::Publish(publish)).await?;
                }
                Some(Qos2Phase::AwaitingPubComp) => {
                    let pubrel = crate::protocol::PubRel::new(packet_id);
                    self.write_packet(&Packet::PubRel(pubrel)).await?;
                }
            }
        }

        Ok(())
    }

    async fn reject_connect(&mut self, reason_code: ReasonCode) -> Result<(), ConnectionError> {
        let connack = ConnAck {
            session_present: false,
            reason_code,
            properties: Properties::default(),
        };
        self.write_packet(&Packet::ConnAck(connack)).await?;
        let _ = self.stream.flush().await;
        Ok(())
    }
}

/// Random id for clients that connect with an empty client id
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}
