//! Broker-internal connect notification
//!
//! On a successful CONNECT the broker publishes a JSON payload on a
//! reserved topic so monitoring subscribers observe connect events.

use bytes::Bytes;
use serde::Serialize;

use crate::protocol::{Properties, Publish, QoS};
use crate::session::ConnParam;

/// Reserved topic carrying connect events
pub const CONNECT_NOTIFY_TOPIC: &str = "$SYS/brokers/connected";

#[derive(Serialize)]
struct ConnectEvent<'a> {
    client_id: &'a str,
    username: Option<&'a str>,
    proto_ver: u8,
    clean_start: bool,
    keepalive: u16,
}

/// Build the synthetic PUBLISH announcing a new connection
pub fn connect_notification(cparam: &ConnParam) -> Publish {
    let event = ConnectEvent {
        client_id: &cparam.client_id,
        username: cparam.username.as_deref(),
        proto_ver: cparam.protocol_version as u8,
        clean_start: cparam.clean_start,
        keepalive: cparam.keep_alive,
    };
    // serializing a struct of plain fields cannot fail
    let payload = serde_json::to_vec(&event).unwrap_or_default();

    Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: CONNECT_NOTIFY_TOPIC.into(),
        packet_id: None,
        payload: Bytes::from(payload),
        properties: Properties::default(),
    }
}
