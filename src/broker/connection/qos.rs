//! QoS acknowledgement bookkeeping
//!
//! Outbound: PUBACK and PUBCOMP release the in-flight entry, PUBREC flips
//! the qos2 phase and answers PUBREL. Inbound: PUBREL completes the qos2
//! handshake and only then routes the parked PUBLISH. The qos timer
//! re-sends whatever has waited longer than `qos_duration`.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, ProtocolError};
use crate::session::Qos2Phase;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn handle_puback(&mut self, puback: PubAck) -> Result<(), ConnectionError> {
        if let Some(active) = self.active.as_ref() {
            active.session.write().inflight_out.remove(&puback.packet_id);
        }
        Ok(())
    }

    pub(crate) async fn handle_pubrec(&mut self, pubrec: PubRec) -> Result<(), ConnectionError> {
        if let Some(active) = self.active.as_ref() {
            let mut session = active.session.write();
            if let Some(inflight) = session.inflight_out.get_mut(&pubrec.packet_id) {
                inflight.phase = Some(Qos2Phase::AwaitingPubComp);
            }
        }
        self.write_packet(&Packet::PubRel(PubRel::new(pubrec.packet_id))).await
    }

    pub(crate) async fn handle_pubrel(&mut self, pubrel: PubRel) -> Result<(), ConnectionError> {
        let Some(active) = self.active.as_ref() else {
            return Err(ProtocolError::ProtocolViolation("PUBREL before CONNECT").into());
        };

        let parked = active.session.write().inflight_in.remove(&pubrel.packet_id);

        self.write_packet(&Packet::PubComp(PubComp::new(pubrel.packet_id))).await?;

        // The inbound qos2 PUBLISH counts as delivered only now
        if let Some(publish) = parked {
            self.shared.router.publish(&publish);
        }

        Ok(())
    }

    pub(crate) fn handle_pubcomp(&mut self, pubcomp: PubComp) -> Result<(), ConnectionError> {
        if let Some(active) = self.active.as_ref() {
            active.session.write().inflight_out.remove(&pubcomp.packet_id);
        }
        Ok(())
    }

    /// Re-send unacknowledged qos>0 traffic older than one qos interval
    pub(crate) async fn retry_unacked(&mut self) -> Result<(), ConnectionError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        let interval = self.shared.qos_duration;
        let now = std::time::Instant::now();

        let due: Vec<(u16, crate::protocol::Publish, Option<Qos2Phase>)> = {
            let mut session = active.session.write();
            session
                .inflight_out
                .iter_mut()
                .filter(|(_, inflight)| now.duration_since(inflight.sent_at) >= interval)
                .map(|(id, inflight)| {
                    inflight.sent_at = now;
                    inflight.retries += 1;
                    (*id, inflight.publish.clone(), inflight.phase)
                })
                .collect()
        };

        for (packet_id, mut publish, phase) in due {
            match phase {
                None | Some(Qos2Phase::AwaitingPubRec) => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    trace!("pipe {}: re-sending PUBLISH id {}", self.pipe, packet_id);
                    self.write_packet(&Packet::Publish(publish)).await?;
                }
                Some(Qos2Phase::AwaitingPubComp) => {
                    trace!("pipe {}: re-sending PUBREL id {}", self.pipe, packet_id);
                    self.write_packet(&Packet::PubRel(PubRel::new(packet_id))).await?;
                }
            }
        }

        Ok(())
    }
}
