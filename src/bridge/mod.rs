//! Outbound bridge
//!
//! A second MQTT client hosted in-process: local traffic matching the
//! configured forward filters is duplicated upstream, and upstream traffic
//! on the configured subscriptions is injected into the local publish path.

mod client;

pub use client::BridgeClient;

use std::fmt;

use crate::protocol::{DecodeError, EncodeError, ReasonCode};

#[derive(Debug)]
pub enum BridgeError {
    Io(std::io::Error),
    /// Upstream did not answer within the connect deadline
    Timeout,
    /// Upstream CONNACK refused the connection
    Rejected(ReasonCode),
    Decode(DecodeError),
    Encode(EncodeError),
    Protocol(&'static str),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Io(e) => write!(f, "io error: {}", e),
            BridgeError::Timeout => write!(f, "upstream timeout"),
            BridgeError::Rejected(code) => write!(f, "upstream refused connection: {}", code),
            BridgeError::Decode(e) => write!(f, "decode error: {}", e),
            BridgeError::Encode(e) => write!(f, "encode error: {}", e),
            BridgeError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e)
    }
}

impl From<DecodeError> for BridgeError {
    fn from(e: DecodeError) -> Self {
        BridgeError::Decode(e)
    }
}

impl From<EncodeError> for BridgeError {
    fn from(e: EncodeError) -> Self {
        BridgeError::Encode(e)
    }
}
