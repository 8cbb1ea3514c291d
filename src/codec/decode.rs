//! MQTT packet decoder
//!
//! Decodes the fixed header, then dispatches by packet type into the typed
//! packet records. Incomplete input yields `Ok(None)` so the caller can
//! keep the bytes buffered and retry once more arrive.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, SubscribeFilter,
    UnsubAck, Unsubscribe, Will,
};

const DEFAULT_PROPERTY_LIMIT: usize = 64;

pub struct Decoder {
    max_packet_size: usize,
    /// Cap on accumulated user-property bytes per packet
    property_limit: usize,
    /// Locked in by the CONNECT packet
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            property_limit: DEFAULT_PROPERTY_LIMIT,
            protocol_version: None,
        }
    }

    pub fn with_property_limit(mut self, limit: usize) -> Self {
        self.property_limit = limit;
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    fn decode_properties(&self, buf: &[u8], pos: &mut usize) -> Result<Properties, DecodeError> {
        if self.is_v5() {
            let (props, len) = Properties::decode(&buf[*pos..], self.property_limit)?;
            *pos += len;
            Ok(props)
        } else {
            Ok(Properties::default())
        }
    }

    /// Decode one packet; returns (packet, total bytes consumed)
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let packet_type = buf[0] >> 4;
        let flags = buf[0] & 0x0F;

        let (remaining, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total = 1 + len_bytes + remaining as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total];

        let packet = match packet_type {
            1 => self.decode_connect(body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => Packet::PubAck(self.decode_ack(flags, 0x00, body)?.into_puback()),
            5 => Packet::PubRec(self.decode_ack(flags, 0x00, body)?.into_pubrec()),
            6 => Packet::PubRel(self.decode_ack(flags, 0x02, body)?.into_pubrel()),
            7 => Packet::PubComp(self.decode_ack(flags, 0x00, body)?.into_pubcomp()),
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            10 => self.decode_unsubscribe(flags, body)?,
            11 => self.decode_unsuback(flags, body)?,
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingReq
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, body)?,
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, total)))
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, len) = read_string(&body[pos..])?;
        pos += len;
        if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let level = body[pos];
        pos += 1;
        let protocol_version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.protocol_version = Some(protocol_version);

        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let connect_flags = body[pos];
        pos += 1;

        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // Password without username is illegal in v3.1.1
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }
        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        if pos + 2 > body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let keep_alive = u16::from_be_bytes([body[pos], body[pos + 1]]);
        pos += 2;

        let properties = self.decode_properties(body, &mut pos)?;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let will = if will_flag {
            let will_properties = self.decode_properties(body, &mut pos)?;
            let (will_topic, len) = read_string(&body[pos..])?;
            pos += len;
            let (will_payload, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Will {
                topic: will_topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&body[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _) = read_binary(&body[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        if (body[0] & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let session_present = (body[0] & 0x01) != 0;

        let (reason_code, properties) = if self.is_v5() || self.protocol_version.is_none() {
            let reason = ReasonCode::from_u8(body[1]).ok_or(DecodeError::InvalidReasonCode(body[1]))?;
            let props = if body.len() > 2 {
                Properties::decode(&body[2..], self.property_limit)?.0
            } else {
                Properties::default()
            };
            (reason, props)
        } else {
            (ReasonCode::from_v3_connack_code(body[1]), Properties::default())
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for qos 0"));
        }

        let mut pos = 0;
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;

        if topic.is_empty() {
            return Err(DecodeError::MalformedPacket("topic name cannot be empty"));
        }
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            if pos + 2 > body.len() {
                return Err(DecodeError::InsufficientData);
            }
            let id = u16::from_be_bytes([body[pos], body[pos + 1]]);
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let properties = self.decode_properties(body, &mut pos)?;
        let payload = Bytes::copy_from_slice(&body[pos..]);

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload,
            properties,
        }))
    }

    /// Shared body decoding for the four publish acknowledgements
    fn decode_ack(&self, flags: u8, expected_flags: u8, body: &[u8]) -> Result<Ack, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([body[0], body[1]]);

        let (reason_code, properties) = if self.is_v5() && body.len() > 2 {
            let reason = ReasonCode::from_u8(body[2]).ok_or(DecodeError::InvalidReasonCode(body[2]))?;
            let props = if body.len() > 3 {
                Properties::decode(&body[3..], self.property_limit)?.0
            } else {
                Properties::default()
            };
            (reason, props)
        } else {
            (ReasonCode::Success, Properties::default())
        };

        Ok(Ack {
            packet_id,
            reason_code,
            properties,
        })
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        let mut pos = 2;

        let properties = self.decode_properties(body, &mut pos)?;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            if pos >= body.len() {
                return Err(DecodeError::InsufficientData);
            }
            let options = body[pos];
            pos += 1;

            // Upper bits are v5 subscription options this broker does not
            // grant; reserved bits must be zero in both versions.
            if (options & 0xC0) != 0 {
                return Err(DecodeError::InvalidFlags);
            }
            let qos = QoS::from_u8(options & 0x03).ok_or(DecodeError::InvalidQoS(options & 0x03))?;

            filters.push(SubscribeFilter {
                filter: filter.to_string(),
                qos,
            });
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must carry at least one filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 3 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        let mut pos = 2;
        let properties = self.decode_properties(body, &mut pos)?;

        let mut reason_codes = Vec::new();
        while pos < body.len() {
            let code = body[pos];
            pos += 1;
            let reason = if self.is_v5() {
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
            } else {
                match code {
                    0x00 => ReasonCode::Success,
                    0x01 => ReasonCode::GrantedQoS1,
                    0x02 => ReasonCode::GrantedQoS2,
                    0x80 => ReasonCode::UnspecifiedError,
                    other => return Err(DecodeError::InvalidReasonCode(other)),
                }
            };
            reason_codes.push(reason);
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        let mut pos = 2;

        let properties = self.decode_properties(body, &mut pos)?;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must carry at least one filter",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([body[0], body[1]]);

        let (properties, reason_codes) = if self.is_v5() {
            let mut pos = 2;
            let props = self.decode_properties(body, &mut pos)?;
            let mut codes = Vec::new();
            while pos < body.len() {
                let code =
                    ReasonCode::from_u8(body[pos]).ok_or(DecodeError::InvalidReasonCode(body[pos]))?;
                codes.push(code);
                pos += 1;
            }
            (props, codes)
        } else {
            (Properties::default(), Vec::new())
        };

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if self.is_v5() {
            if body.is_empty() {
                return Ok(Packet::Disconnect(Disconnect::default()));
            }
            let reason_code =
                ReasonCode::from_u8(body[0]).ok_or(DecodeError::InvalidReasonCode(body[0]))?;
            let properties = if body.len() > 1 {
                Properties::decode(&body[1..], self.property_limit)?.0
            } else {
                Properties::default()
            };
            Ok(Packet::Disconnect(Disconnect {
                reason_code,
                properties,
            }))
        } else {
            if !body.is_empty() {
                return Err(DecodeError::MalformedPacket("v3.1.1 DISCONNECT has no body"));
            }
            Ok(Packet::Disconnect(Disconnect::default()))
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

struct Ack {
    packet_id: u16,
    reason_code: ReasonCode,
    properties: Properties,
}

impl Ack {
    fn into_puback(self) -> PubAck {
        PubAck {
            packet_id: self.packet_id,
            reason_code: self.reason_code,
            properties: self.properties,
        }
    }

    fn into_pubrec(self) -> PubRec {
        PubRec {
            packet_id: self.packet_id,
            reason_code: self.reason_code,
            properties: self.properties,
        }
    }

    fn into_pubrel(self) -> PubRel {
        PubRel {
            packet_id: self.packet_id,
            reason_code: self.reason_code,
            properties: self.properties,
        }
    }

    fn into_pubcomp(self) -> PubComp {
        PubComp {
            packet_id: self.packet_id,
            reason_code: self.reason_code,
            properties: self.properties,
        }
    }
}
