//! SUBSCRIBE and UNSUBSCRIBE handling
//!
//! SUBSCRIBE mutates the topic index, the pipe index and the session, then
//! answers with one reason byte per filter in request order; matching
//! retained messages are delivered right after the SUBACK. UNSUBSCRIBE
//! reverses all three.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, Properties, ProtocolError, ProtocolVersion, Publish, QoS, ReasonCode, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::{validate_topic_filter, Subscription};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let Some(active) = self.active.as_ref() else {
            return Err(ProtocolError::ProtocolViolation("SUBSCRIBE before CONNECT").into());
        };
        let client_id = active.client_id.clone();
        let session = active.session.clone();

        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted: Vec<(String, QoS)> = Vec::with_capacity(subscribe.filters.len());

        for sub in &subscribe.filters {
            if let Err(e) = validate_topic_filter(&sub.filter) {
                debug!(
                    "pipe {}: rejecting filter {:?} from {}: {}",
                    self.pipe, sub.filter, client_id, e
                );
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }

            self.shared.subscriptions.subscribe(
                &sub.filter,
                Subscription {
                    pipe: Some(self.pipe),
                    client_id: client_id.clone(),
                    qos: sub.qos,
                },
            );
            self.shared.pipes.insert(self.pipe, &sub.filter);
            session.write().add_subscription(sub.filter.clone(), sub.qos);

            reason_codes.push(match sub.qos {
                QoS::AtMostOnce => ReasonCode::Success,
                QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
            });
            granted.push((sub.filter.clone(), sub.qos));

            debug!(
                "pipe {}: SUBSCRIBE {} {:?} qos {:?}",
                self.pipe, client_id, sub.filter, sub.qos
            );
        }

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        self.write_packet(&Packet::SubAck(suback)).await?;

        // Retained messages matching each accepted filter, delivered after
        // the SUBACK and before anything this pipe routes later.
        for (filter, granted_qos) in granted {
            for retained in self.shared.retained.matches(&filter) {
                let publish = Publish {
                    dup: false,
                    qos: retained.qos.min(granted_qos),
                    retain: true,
                    topic: retained.topic.clone(),
                    packet_id: None,
                    payload: retained.payload.clone(),
                    properties: retained.properties.clone(),
                };
                self.write_publish(publish).await?;
            }
        }

        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let Some(active) = self.active.as_ref() else {
            return Err(ProtocolError::ProtocolViolation("UNSUBSCRIBE before CONNECT").into());
        };
        let client_id = active.client_id.clone();
        let session = active.session.clone();
        let v5 = self.decoder.protocol_version() == Some(ProtocolVersion::V5);

        let mut reason_codes = Vec::new();
        for filter in &unsubscribe.filters {
            let removed = self.shared.subscriptions.unsubscribe(filter, self.pipe).is_some();
            self.shared.pipes.remove(self.pipe, filter);
            session.write().remove_subscription(filter);

            if v5 {
                reason_codes.push(if removed {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                });
            }

            debug!(
                "pipe {}: UNSUBSCRIBE {} {:?} (removed: {})",
                self.pipe, client_id, filter, removed
            );
        }

        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        self.write_packet(&Packet::UnsubAck(unsuback)).await?;

        Ok(())
    }
}
