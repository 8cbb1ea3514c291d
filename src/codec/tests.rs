//! Codec tests: wire exactness for the fixed header, malformed-frame
//! rejection, and fuzz-style no-panic properties.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, Properties, ProtocolVersion, Publish, QoS, ReasonCode,
    SubAck, Subscribe, SubscribeFilter, Will,
};

fn encode(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let encoder = Encoder::new(version);
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode(buf: &[u8], version: Option<ProtocolVersion>) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    if let Some(v) = version {
        decoder.set_protocol_version(v);
    }
    match decoder.decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

#[test]
fn connect_v311_with_will_roundtrip() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "edge-gw-7".to_string(),
        clean_start: false,
        keep_alive: 120,
        username: Some("gateway".to_string()),
        password: Some(Bytes::from("secret")),
        will: Some(Will {
            topic: "devices/edge-gw-7/offline".to_string(),
            payload: Bytes::from("gone"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: Properties::default(),
        }),
        properties: Properties::default(),
    }));

    let encoded = encode(&packet, ProtocolVersion::V311);
    assert_eq!(packet, decode(&encoded, None).unwrap());
}

#[test]
fn connect_v5_session_expiry_roundtrip() {
    let mut props = Properties::default();
    props.session_expiry_interval = Some(900);
    props.receive_maximum = Some(32);

    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "v5-client".to_string(),
        clean_start: false,
        keep_alive: 30,
        username: None,
        password: None,
        will: None,
        properties: props,
    }));

    let encoded = encode(&packet, ProtocolVersion::V5);
    assert_eq!(packet, decode(&encoded, None).unwrap());
}

#[test]
fn publish_fixed_header_is_bit_exact() {
    let packet = Packet::Publish(Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "a/b".into(),
        packet_id: Some(7),
        payload: Bytes::from("x"),
        properties: Properties::default(),
    });
    let encoded = encode(&packet, ProtocolVersion::V311);

    // type 3, DUP=1, qos=1, retain=1 -> 0011 1011
    assert_eq!(encoded[0], 0x3B);
    // topic(2+3) + packet id(2) + payload(1)
    assert_eq!(encoded[1], 8);
    assert_eq!(&encoded[2..4], &[0x00, 0x03]);
}

#[test]
fn pingreq_pingresp_are_two_bytes() {
    assert_eq!(&encode(&Packet::PingReq, ProtocolVersion::V311)[..], &[0xC0, 0x00]);
    assert_eq!(&encode(&Packet::PingResp, ProtocolVersion::V311)[..], &[0xD0, 0x00]);
}

#[test]
fn connack_v311_uses_return_codes() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: true,
        reason_code: ReasonCode::ClientIdNotValid,
        properties: Properties::default(),
    });
    let encoded = encode(&packet, ProtocolVersion::V311);
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x01, 0x02]);
}

#[test]
fn suback_roundtrip_both_versions() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 11,
        reason_codes: vec![ReasonCode::GrantedQoS1, ReasonCode::UnspecifiedError],
        properties: Properties::default(),
    });

    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        let encoded = encode(&packet, version);
        assert_eq!(packet, decode(&encoded, Some(version)).unwrap());
    }
}

#[test]
fn partial_frame_waits_for_more_data() {
    let packet = Packet::Publish(Publish {
        topic: "sensors/room1/temp".into(),
        payload: Bytes::from("23"),
        ..Default::default()
    });
    let encoded = encode(&packet, ProtocolVersion::V311);

    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    for cut in 0..encoded.len() {
        assert!(decoder.decode(&encoded[..cut]).unwrap().is_none());
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn publish_with_wildcard_topic_is_rejected() {
    // Hand-build: PUBLISH qos0, topic "a/+"
    let frame = [0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+'];
    assert!(matches!(
        decode(&frame, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_qos0_with_dup_is_rejected() {
    let frame = [0x38, 0x04, 0x00, 0x01, b'a', b'x'];
    assert!(matches!(
        decode(&frame, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn subscribe_without_filters_is_rejected() {
    // SUBSCRIBE with packet id only
    let frame = [0x82, 0x02, 0x00, 0x01];
    assert!(matches!(
        decode(&frame, Some(ProtocolVersion::V311)),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn subscribe_wrong_flags_rejected() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![SubscribeFilter {
            filter: "a".to_string(),
            qos: QoS::AtMostOnce,
        }],
        properties: Properties::default(),
    });
    let mut encoded = encode(&packet, ProtocolVersion::V311);
    encoded[0] = 0x80; // flags must be 0010
    assert_eq!(
        decode(&encoded, Some(ProtocolVersion::V311)),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn oversized_remaining_length_rejected() {
    let frame = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    let mut decoder = Decoder::new();
    assert!(decoder.decode(&frame).is_err());
}

mod props {
    use super::*;
    use crate::codec::{read_string, read_variable_int, write_string, write_variable_int};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn variable_int_roundtrip(value in 0u32..268_435_455u32) {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            prop_assert_eq!(value, decoded);
            prop_assert_eq!(written, consumed);
        }

        #[test]
        fn string_roundtrip(s in "[a-zA-Z0-9_/-]{0,80}") {
            let mut buf = BytesMut::new();
            write_string(&mut buf, &s).unwrap();
            let (decoded, consumed) = read_string(&buf).unwrap();
            prop_assert_eq!(&s, decoded);
            prop_assert_eq!(consumed, 2 + s.len());
        }

        // Arbitrary input must never panic the decoder.
        #[test]
        fn random_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..400)) {
            let mut decoder = Decoder::new();
            let _ = decoder.decode(&data);
        }

        // A corrupted valid frame must error or decode, never panic.
        #[test]
        fn corrupted_publish_never_panics(
            payload in prop::collection::vec(any::<u8>(), 0..64),
            pos in 0usize..80,
            byte in any::<u8>(),
        ) {
            let packet = Packet::Publish(Publish {
                topic: "t/corrupt".into(),
                payload: Bytes::from(payload),
                ..Default::default()
            });
            let mut encoded = encode(&packet, ProtocolVersion::V311);
            if pos < encoded.len() {
                encoded[pos] = byte;
            }
            let mut decoder = Decoder::new();
            decoder.set_protocol_version(ProtocolVersion::V311);
            let _ = decoder.decode(&encoded);
        }
    }
}
