//! NanoMQ - lightweight MQTT v3.1.1/v5.0 broker for edge and IoT deployments
//!
//! The crate is organized around a message-routing core: a per-connection
//! protocol state machine, a wildcard-aware topic index, a session store
//! keyed by client identifier, a retained-message store, and an optional
//! outbound bridge that republishes selected local topics upstream.

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use auth::{Authenticator, StaticAuth};
pub use bridge::BridgeClient;
pub use broker::{Broker, BrokerConfig};
pub use config::{BridgeSettings, ConfigError, ListenerUrl, Settings};
pub use protocol::{ProtocolVersion, QoS};
