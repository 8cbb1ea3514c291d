//! Inbound PUBLISH handling
//!
//! qos 0 routes immediately, qos 1 is acknowledged then routed, qos 2 is
//! parked until PUBREL completes the inbound handshake. Routing (retained
//! store, fan-out, bridge forwarding) is the router's job.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{trace, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        let Some(active) = self.active.as_ref() else {
            return Err(ProtocolError::ProtocolViolation("PUBLISH before CONNECT").into());
        };

        // The decoder already rejects wildcards; length and emptiness are
        // validated here so a hostile peer cannot skip the check.
        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!(
                "pipe {}: invalid publish topic from {}: {}",
                self.pipe, active.client_id, e
            );
            return Err(ProtocolError::ProtocolViolation("invalid topic name").into());
        }

        trace!(
            "pipe {}: PUBLISH {} qos {:?} retain {}",
            self.pipe,
            publish.topic,
            publish.qos,
            publish.retain
        );

        match publish.qos {
            QoS::AtMostOnce => {
                self.shared.router.publish(&publish);
            }
            QoS::AtLeastOnce => {
                // packet id presence is guaranteed by the decoder
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::ProtocolViolation("qos1 without packet id"))?;
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id))).await?;
                self.shared.router.publish(&publish);
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::ProtocolViolation("qos2 without packet id"))?;

                // Park until PUBREL; a re-sent PUBLISH with the same id
                // replaces the parked copy instead of double-routing.
                {
                    let session = self.active.as_ref().map(|a| a.session.clone());
                    if let Some(session) = session {
                        session.write().inflight_in.insert(packet_id, publish);
                    }
                }
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id))).await?;
            }
        }

        Ok(())
    }
}
