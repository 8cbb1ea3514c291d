//! Protocol error types

use std::fmt;

/// Errors raised while decoding a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data buffered yet
    InsufficientData,
    InvalidPacketType(u8),
    /// Remaining-length varint ran past 4 bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved fixed-header flag bits set for this packet type
    InvalidFlags,
    InvalidPropertyId(u8),
    DuplicateProperty(u8),
    InvalidReasonCode(u8),
    /// Accumulated user-property bytes exceed the configured limit
    PropertyLimitExceeded,
    PacketTooLarge,
    MalformedPacket(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid qos value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property: {}", id),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {}", r),
            Self::PropertyLimitExceeded => write!(f, "user properties exceed configured limit"),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while encoding a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PacketTooLarge,
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that terminate a pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    ProtocolViolation(&'static str),
    NotAuthorized,
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
