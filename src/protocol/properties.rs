//! MQTT v5.0 property block
//!
//! Covers the subset of properties the broker speaks. User properties are
//! accepted anywhere but their accumulated size is capped by the configured
//! `property_size`; properties tied to unsupported features (topic aliases,
//! subscription identifiers, enhanced auth) are rejected as malformed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_variable_int, write_binary, write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

/// Collected v5.0 properties; empty on the v3.1.1 path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

fn take_u8(buf: &[u8], pos: &mut usize, end: usize) -> Result<u8, DecodeError> {
    if *pos >= end {
        return Err(DecodeError::InsufficientData);
    }
    let v = buf[*pos];
    *pos += 1;
    Ok(v)
}

fn take_u16(buf: &[u8], pos: &mut usize, end: usize) -> Result<u16, DecodeError> {
    if *pos + 2 > end {
        return Err(DecodeError::InsufficientData);
    }
    let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn take_u32(buf: &[u8], pos: &mut usize, end: usize) -> Result<u32, DecodeError> {
    if *pos + 4 > end {
        return Err(DecodeError::InsufficientData);
    }
    let v = u32::from_be_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
    *pos += 4;
    Ok(v)
}

fn set_once<T>(slot: &mut Option<T>, value: T, prop: u8) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(prop));
    }
    *slot = Some(value);
    Ok(())
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// Encoded size of the property block, excluding its length prefix
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;
        if self.payload_format_indicator.is_some() {
            size += 2;
        }
        if self.message_expiry_interval.is_some() {
            size += 5;
        }
        if let Some(ref s) = self.content_type {
            size += 1 + 2 + s.len();
        }
        if let Some(ref s) = self.response_topic {
            size += 1 + 2 + s.len();
        }
        if let Some(ref d) = self.correlation_data {
            size += 1 + 2 + d.len();
        }
        if self.session_expiry_interval.is_some() {
            size += 5;
        }
        if let Some(ref s) = self.assigned_client_identifier {
            size += 1 + 2 + s.len();
        }
        if self.server_keep_alive.is_some() {
            size += 3;
        }
        if self.request_problem_information.is_some() {
            size += 2;
        }
        if self.will_delay_interval.is_some() {
            size += 5;
        }
        if self.request_response_information.is_some() {
            size += 2;
        }
        if let Some(ref s) = self.reason_string {
            size += 1 + 2 + s.len();
        }
        if self.receive_maximum.is_some() {
            size += 3;
        }
        if self.topic_alias_maximum.is_some() {
            size += 3;
        }
        if self.maximum_qos.is_some() {
            size += 2;
        }
        if self.retain_available.is_some() {
            size += 2;
        }
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }
        if self.maximum_packet_size.is_some() {
            size += 5;
        }
        if self.wildcard_subscription_available.is_some() {
            size += 2;
        }
        if self.subscription_identifier_available.is_some() {
            size += 2;
        }
        if self.shared_subscription_available.is_some() {
            size += 2;
        }
        size
    }

    /// Decode a property block. `property_limit` caps the accumulated
    /// byte size of user properties (key + value bytes).
    pub fn decode(buf: &[u8], property_limit: usize) -> Result<(Self, usize), DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::InsufficientData);
        }

        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::new();
        let mut pos = len_bytes;
        let mut user_prop_bytes = 0usize;

        while pos < end {
            let prop = buf[pos];
            pos += 1;

            match prop {
                id::PAYLOAD_FORMAT_INDICATOR => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.payload_format_indicator, v, prop)?;
                }
                id::MESSAGE_EXPIRY_INTERVAL => {
                    let v = take_u32(buf, &mut pos, end)?;
                    set_once(&mut props.message_expiry_interval, v, prop)?;
                }
                id::CONTENT_TYPE => {
                    let (s, len) = read_string(&buf[pos..])?;
                    pos += len;
                    set_once(&mut props.content_type, s.to_string(), prop)?;
                }
                id::RESPONSE_TOPIC => {
                    let (s, len) = read_string(&buf[pos..])?;
                    pos += len;
                    set_once(&mut props.response_topic, s.to_string(), prop)?;
                }
                id::CORRELATION_DATA => {
                    let (data, len) = read_binary(&buf[pos..])?;
                    pos += len;
                    set_once(&mut props.correlation_data, Bytes::copy_from_slice(data), prop)?;
                }
                id::SESSION_EXPIRY_INTERVAL => {
                    let v = take_u32(buf, &mut pos, end)?;
                    set_once(&mut props.session_expiry_interval, v, prop)?;
                }
                id::ASSIGNED_CLIENT_IDENTIFIER => {
                    let (s, len) = read_string(&buf[pos..])?;
                    pos += len;
                    set_once(&mut props.assigned_client_identifier, s.to_string(), prop)?;
                }
                id::SERVER_KEEP_ALIVE => {
                    let v = take_u16(buf, &mut pos, end)?;
                    set_once(&mut props.server_keep_alive, v, prop)?;
                }
                id::REQUEST_PROBLEM_INFORMATION => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.request_problem_information, v, prop)?;
                }
                id::WILL_DELAY_INTERVAL => {
                    let v = take_u32(buf, &mut pos, end)?;
                    set_once(&mut props.will_delay_interval, v, prop)?;
                }
                id::REQUEST_RESPONSE_INFORMATION => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.request_response_information, v, prop)?;
                }
                id::REASON_STRING => {
                    let (s, len) = read_string(&buf[pos..])?;
                    pos += len;
                    set_once(&mut props.reason_string, s.to_string(), prop)?;
                }
                id::RECEIVE_MAXIMUM => {
                    let v = take_u16(buf, &mut pos, end)?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                    }
                    set_once(&mut props.receive_maximum, v, prop)?;
                }
                id::TOPIC_ALIAS_MAXIMUM => {
                    let v = take_u16(buf, &mut pos, end)?;
                    set_once(&mut props.topic_alias_maximum, v, prop)?;
                }
                id::MAXIMUM_QOS => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.maximum_qos, v, prop)?;
                }
                id::RETAIN_AVAILABLE => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.retain_available, v, prop)?;
                }
                id::USER_PROPERTY => {
                    let (key, key_len) = read_string(&buf[pos..])?;
                    pos += key_len;
                    let (val, val_len) = read_string(&buf[pos..])?;
                    pos += val_len;
                    user_prop_bytes += key.len() + val.len();
                    if user_prop_bytes > property_limit {
                        return Err(DecodeError::PropertyLimitExceeded);
                    }
                    props.user_properties.push((key.to_string(), val.to_string()));
                }
                id::MAXIMUM_PACKET_SIZE => {
                    let v = take_u32(buf, &mut pos, end)?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "maximum packet size cannot be 0",
                        ));
                    }
                    set_once(&mut props.maximum_packet_size, v, prop)?;
                }
                id::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.wildcard_subscription_available, v, prop)?;
                }
                id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.subscription_identifier_available, v, prop)?;
                }
                id::SHARED_SUBSCRIPTION_AVAILABLE => {
                    let v = take_u8(buf, &mut pos, end)?;
                    set_once(&mut props.shared_subscription_available, v, prop)?;
                }
                // Features this broker does not offer; a client sending them
                // is violating the capabilities advertised in CONNACK.
                id::TOPIC_ALIAS => {
                    return Err(DecodeError::MalformedPacket("topic aliases not supported"));
                }
                id::SUBSCRIPTION_IDENTIFIER => {
                    return Err(DecodeError::MalformedPacket(
                        "subscription identifiers not supported",
                    ));
                }
                id::AUTHENTICATION_METHOD | id::AUTHENTICATION_DATA => {
                    return Err(DecodeError::MalformedPacket(
                        "extended authentication not supported",
                    ));
                }
                other => return Err(DecodeError::InvalidPropertyId(other)),
            }
        }

        Ok((props, end))
    }

    /// Encode the property block, including its length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(id::PAYLOAD_FORMAT_INDICATOR);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(id::MESSAGE_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(id::CONTENT_TYPE);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(id::RESPONSE_TOPIC);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(id::CORRELATION_DATA);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(id::SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(id::ASSIGNED_CLIENT_IDENTIFIER);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(id::SERVER_KEEP_ALIVE);
            buf.put_u16(v);
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(id::REQUEST_PROBLEM_INFORMATION);
            buf.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            buf.put_u8(id::WILL_DELAY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            buf.put_u8(id::REQUEST_RESPONSE_INFORMATION);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(id::REASON_STRING);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(id::RECEIVE_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(id::TOPIC_ALIAS_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(id::MAXIMUM_QOS);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(id::RETAIN_AVAILABLE);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(id::USER_PROPERTY);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(id::MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            buf.put_u8(id::WILDCARD_SUBSCRIPTION_AVAILABLE);
            buf.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            buf.put_u8(id::SUBSCRIPTION_IDENTIFIER_AVAILABLE);
            buf.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            buf.put_u8(id::SHARED_SUBSCRIPTION_AVAILABLE);
            buf.put_u8(v);
        }

        Ok(())
    }
}
