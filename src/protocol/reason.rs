//! MQTT v5.0 reason codes with the v3.1.1 CONNACK return-code mapping

use std::fmt;

/// MQTT v5.0 reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReasonCode {
    /// Success / normal disconnection / granted qos 0
    #[default]
    Success = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    /// Disconnect, but still publish the will message
    DisconnectWithWill = 0x04,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdNotValid = 0x85,
    BadUserNameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    ServerShuttingDown = 0x8B,
    KeepAliveTimeout = 0x8D,
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    PacketIdInUse = 0x91,
    PacketIdNotFound = 0x92,
    PacketTooLarge = 0x95,
    QuotaExceeded = 0x97,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    SharedSubsNotSupported = 0x9E,
    SubIdNotSupported = 0xA1,
    WildcardSubsNotSupported = 0xA2,
}

impl ReasonCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x04 => Some(ReasonCode::DisconnectWithWill),
            0x10 => Some(ReasonCode::NoMatchingSubscribers),
            0x11 => Some(ReasonCode::NoSubscriptionExisted),
            0x80 => Some(ReasonCode::UnspecifiedError),
            0x81 => Some(ReasonCode::MalformedPacket),
            0x82 => Some(ReasonCode::ProtocolError),
            0x83 => Some(ReasonCode::ImplementationError),
            0x84 => Some(ReasonCode::UnsupportedProtocolVersion),
            0x85 => Some(ReasonCode::ClientIdNotValid),
            0x86 => Some(ReasonCode::BadUserNameOrPassword),
            0x87 => Some(ReasonCode::NotAuthorized),
            0x88 => Some(ReasonCode::ServerUnavailable),
            0x89 => Some(ReasonCode::ServerBusy),
            0x8B => Some(ReasonCode::ServerShuttingDown),
            0x8D => Some(ReasonCode::KeepAliveTimeout),
            0x8E => Some(ReasonCode::SessionTakenOver),
            0x8F => Some(ReasonCode::TopicFilterInvalid),
            0x90 => Some(ReasonCode::TopicNameInvalid),
            0x91 => Some(ReasonCode::PacketIdInUse),
            0x92 => Some(ReasonCode::PacketIdNotFound),
            0x95 => Some(ReasonCode::PacketTooLarge),
            0x97 => Some(ReasonCode::QuotaExceeded),
            0x99 => Some(ReasonCode::PayloadFormatInvalid),
            0x9A => Some(ReasonCode::RetainNotSupported),
            0x9B => Some(ReasonCode::QoSNotSupported),
            0x9E => Some(ReasonCode::SharedSubsNotSupported),
            0xA1 => Some(ReasonCode::SubIdNotSupported),
            0xA2 => Some(ReasonCode::WildcardSubsNotSupported),
            _ => None,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    /// Map to the v3.1.1 CONNACK return code
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::UnsupportedProtocolVersion => 0x01,
            ReasonCode::ClientIdNotValid => 0x02,
            ReasonCode::ServerUnavailable => 0x03,
            ReasonCode::BadUserNameOrPassword => 0x04,
            _ => 0x05,
        }
    }

    /// Reconstruct from a v3.1.1 CONNACK return code
    pub fn from_v3_connack_code(code: u8) -> Self {
        match code {
            0x00 => ReasonCode::Success,
            0x01 => ReasonCode::UnsupportedProtocolVersion,
            0x02 => ReasonCode::ClientIdNotValid,
            0x03 => ReasonCode::ServerUnavailable,
            0x04 => ReasonCode::BadUserNameOrPassword,
            0x05 => ReasonCode::NotAuthorized,
            _ => ReasonCode::UnspecifiedError,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, *self as u8)
    }
}
