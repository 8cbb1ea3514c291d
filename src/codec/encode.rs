//! MQTT packet encoder
//!
//! Produces byte buffers suitable for direct write. The remaining length is
//! computed up front so the fixed header is emitted in one pass.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, Publish, QoS, ReasonCode,
    SubAck, Subscribe, UnsubAck, Unsubscribe,
};

pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => {
                self.encode_ack(0x40, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::PubRec(p) => {
                self.encode_ack(0x50, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::PubRel(p) => {
                self.encode_ack(0x62, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::PubComp(p) => {
                self.encode_ack(0x70, p.packet_id, p.reason_code, &p.properties, buf)
            }
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_unsuback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
        }
    }

    fn props_block_len(&self, props: &crate::protocol::Properties) -> usize {
        let len = props.encoded_size();
        variable_int_len(len as u32) + len
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let v5 = packet.protocol_version == ProtocolVersion::V5;

        // protocol name + level + connect flags + keep alive
        let mut remaining = 6 + 1 + 1 + 2;
        if v5 {
            remaining += self.props_block_len(&packet.properties);
        }
        remaining += 2 + packet.client_id.len();
        if let Some(ref will) = packet.will {
            if v5 {
                remaining += self.props_block_len(&will.properties);
            }
            remaining += 2 + will.topic.len();
            remaining += 2 + will.payload.len();
        }
        if let Some(ref username) = packet.username {
            remaining += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining as u32)?;

        write_string(buf, "MQTT")?;
        buf.put_u8(packet.protocol_version as u8);

        let mut flags: u8 = 0;
        if packet.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);

        buf.put_u16(packet.keep_alive);

        if v5 {
            packet.properties.encode(buf)?;
        }

        write_string(buf, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            if v5 {
                will.properties.encode(buf)?;
            }
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2;
        if self.is_v5() {
            remaining += self.props_block_len(&packet.properties);
        }

        buf.put_u8(0x20);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });

        if self.is_v5() {
            buf.put_u8(packet.reason_code as u8);
            packet.properties.encode(buf)?;
        } else {
            buf.put_u8(packet.reason_code.to_v3_connack_code());
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining += 2;
        }
        if self.is_v5() {
            remaining += self.props_block_len(&packet.properties);
        }
        remaining += packet.payload.len();

        let mut first: u8 = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first |= 0x08;
        }
        if packet.retain {
            first |= 0x01;
        }
        buf.put_u8(first);
        write_variable_int(buf, remaining as u32)?;

        write_string(buf, &packet.topic)?;
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// Shared encoding for PUBACK/PUBREC/PUBREL/PUBCOMP. The v5 reason code
    /// and properties are omitted when they carry no information.
    fn encode_ack(
        &self,
        first_byte: u8,
        packet_id: u16,
        reason_code: ReasonCode,
        properties: &crate::protocol::Properties,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if self.is_v5() && (reason_code != ReasonCode::Success || !properties.is_empty()) {
            let props_len = properties.encoded_size();
            let remaining = if props_len > 0 {
                2 + 1 + variable_int_len(props_len as u32) + props_len
            } else {
                2 + 1
            };
            buf.put_u8(first_byte);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u16(packet_id);
            buf.put_u8(reason_code as u8);
            if props_len > 0 {
                properties.encode(buf)?;
            }
        } else {
            buf.put_u8(first_byte);
            buf.put_u8(0x02);
            buf.put_u16(packet_id);
        }
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2;
        if self.is_v5() {
            remaining += self.props_block_len(&packet.properties);
        }
        for sub in &packet.filters {
            remaining += 2 + sub.filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for sub in &packet.filters {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining = 2 + packet.reason_codes.len();
        if self.is_v5() {
            remaining += self.props_block_len(&packet.properties);
        }

        buf.put_u8(0x90);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for code in &packet.reason_codes {
            if self.is_v5() {
                buf.put_u8(*code as u8);
            } else {
                let v3_code = match code {
                    ReasonCode::Success => 0x00,
                    ReasonCode::GrantedQoS1 => 0x01,
                    ReasonCode::GrantedQoS2 => 0x02,
                    _ => 0x80,
                };
                buf.put_u8(v3_code);
            }
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut remaining = 2;
        if self.is_v5() {
            remaining += self.props_block_len(&packet.properties);
        }
        for filter in &packet.filters {
            remaining += 2 + filter.len();
        }

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(buf)?;
        }
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }

    fn encode_unsuback(&self, packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_v5() {
            let remaining =
                2 + self.props_block_len(&packet.properties) + packet.reason_codes.len();
            buf.put_u8(0xB0);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u16(packet.packet_id);
            packet.properties.encode(buf)?;
            for code in &packet.reason_codes {
                buf.put_u8(*code as u8);
            }
        } else {
            // v3.1.1 UNSUBACK is the packet id alone
            buf.put_u8(0xB0);
            buf.put_u8(0x02);
            buf.put_u16(packet.packet_id);
        }

        Ok(())
    }

    fn encode_disconnect(&self, packet: &Disconnect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_v5() && (packet.reason_code != ReasonCode::Success || !packet.properties.is_empty())
        {
            let props_len = packet.properties.encoded_size();
            let remaining = if props_len > 0 {
                1 + variable_int_len(props_len as u32) + props_len
            } else {
                1
            };
            buf.put_u8(0xE0);
            write_variable_int(buf, remaining as u32)?;
            buf.put_u8(packet.reason_code as u8);
            if props_len > 0 {
                packet.properties.encode(buf)?;
            }
        } else {
            buf.put_u8(0xE0);
            buf.put_u8(0x00);
        }

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
