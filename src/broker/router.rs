//! Message routing
//!
//! The shared fan-out path used by client publishes, will messages, the
//! connect notification and bridge ingress. A publish builds an ordered
//! delivery list from the subscription index and drains it onto the
//! per-pipe outbound queues; the queues preserve the list order per pipe.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::bridge::BridgeClient;
use crate::protocol::{Packet, Publish, QoS};
use crate::session::SessionStore;
use crate::topic::{RetainStore, RetainedMessage, SubscriptionStore};

use super::{ConnectionHandle, PipeId};

/// One entry of the delivery list built for a single publish
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    /// None targets a detached (offline persistent) subscriber
    pub pipe: Option<PipeId>,
    pub client_id: Arc<str>,
    /// min(publish qos, granted qos)
    pub qos: QoS,
}

pub struct Router {
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<RetainStore>,
    sessions: Arc<SessionStore>,
    connections: Arc<DashMap<PipeId, Arc<ConnectionHandle>>>,
    bridge: RwLock<Option<Arc<BridgeClient>>>,
}

impl Router {
    pub(crate) fn new(
        subscriptions: Arc<SubscriptionStore>,
        retained: Arc<RetainStore>,
        sessions: Arc<SessionStore>,
        connections: Arc<DashMap<PipeId, Arc<ConnectionHandle>>>,
    ) -> Self {
        Self {
            subscriptions,
            retained,
            sessions,
            connections,
            bridge: RwLock::new(None),
        }
    }

    pub(crate) fn set_bridge(&self, bridge: Arc<BridgeClient>) {
        *self.bridge.write() = Some(bridge);
    }

    /// Full local publish path: retained store, local fan-out, bridge
    /// forwarding. Used for client publishes and will messages.
    pub fn publish(&self, publish: &Publish) {
        if publish.retain {
            self.apply_retain(publish);
        }
        self.route(publish);
        self.forward_to_bridge(publish);
    }

    /// Publish path for messages arriving from the upstream bridge,
    /// injected as if published locally but never forwarded back.
    pub fn publish_from_bridge(&self, publish: &Publish) {
        if publish.retain {
            self.apply_retain(publish);
        }
        self.route(publish);
    }

    /// Update the retained store; an empty payload is a tombstone
    pub fn apply_retain(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.retained.remove(&publish.topic);
            trace!("retained tombstone on {}", publish.topic);
        } else {
            self.retained.insert(
                &publish.topic,
                RetainedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    properties: publish.properties.clone(),
                    timestamp: Instant::now(),
                },
            );
        }
    }

    /// Build the delivery list and drain it in order
    pub fn route(&self, publish: &Publish) {
        let matches = self.subscriptions.matches(&publish.topic);
        if matches.is_empty() {
            return;
        }

        let targets: SmallVec<[DeliveryTarget; 16]> = matches
            .into_iter()
            .map(|sub| DeliveryTarget {
                pipe: sub.pipe,
                client_id: sub.client_id,
                qos: publish.qos.min(sub.qos),
            })
            .collect();

        for target in targets {
            // Live fan-out clears retain; retained delivery happens on the
            // subscribe path with the flag set.
            let outgoing = Publish {
                dup: false,
                qos: target.qos,
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
                properties: publish.properties.clone(),
            };

            let handle = target.pipe.and_then(|pipe| self.connections.get(&pipe));
            match handle {
                Some(handle) => match handle.try_send(Packet::Publish(outgoing)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(packet)) => {
                        // Queue full: qos 0 drops silently, qos>0 defers to
                        // the session when one survives disconnects.
                        if target.qos == QoS::AtMostOnce {
                            debug!("pipe {:?} queue full, dropping qos0 publish", target.pipe);
                        } else if let Packet::Publish(p) = packet {
                            self.queue_to_session(&target.client_id, p);
                        }
                    }
                    Err(TrySendError::Closed(packet)) => {
                        if target.qos != QoS::AtMostOnce {
                            if let Packet::Publish(p) = packet {
                                self.queue_to_session(&target.client_id, p);
                            }
                        }
                    }
                },
                None => {
                    // Detached subscriber (or a pipe mid-teardown); only
                    // qos>0 is worth caching for redelivery.
                    if target.qos != QoS::AtMostOnce {
                        self.queue_to_session(&target.client_id, outgoing);
                    }
                }
            }
        }
    }

    fn queue_to_session(&self, client_id: &str, publish: Publish) {
        let Some(session) = self.sessions.get(client_id) else {
            debug!("no session for {}, dropping qos>0 publish", client_id);
            return;
        };
        let mut s = session.write();
        // a session that dies with its pipe is not worth queueing into
        if s.session_expiry == 0 {
            debug!("ephemeral session for {}, dropping qos>0 publish", client_id);
            return;
        }
        if s.queue_pending(publish) {
            debug!("session queue full for {}, dropped oldest", client_id);
        }
    }

    fn forward_to_bridge(&self, publish: &Publish) {
        let guard = self.bridge.read();
        if let Some(ref bridge) = *guard {
            if bridge.should_forward(&publish.topic) {
                bridge.forward(publish);
            }
        }
    }
}
