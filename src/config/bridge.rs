//! Bridge configuration
//!
//! Loaded from its own `key=value` file. Forward filters select local
//! traffic to duplicate upstream; numbered `bridge.subscription.<n>.*`
//! entries select upstream traffic to inject locally.

use std::collections::BTreeMap;
use std::path::Path;

use crate::protocol::{ProtocolVersion, QoS};

use super::{parse_bool, parse_kv_lines, parse_num, ConfigError};

/// One upstream subscription the bridge places after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSubscription {
    pub topic: String,
    pub qos: QoS,
}

/// Outbound bridge settings
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Upstream address, `host:port` (a `scheme://` prefix is tolerated)
    pub address: String,
    pub proto_ver: ProtocolVersion,
    pub clientid: String,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: u16,
    /// Local topic filters whose traffic is duplicated upstream
    pub forwards: Vec<String>,
    pub subscriptions: Vec<BridgeSubscription>,
    /// Outstanding bridge operations (bounds the command queue)
    pub parallel: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            proto_ver: ProtocolVersion::V311,
            clientid: "nanomq-bridge".to_string(),
            clean_start: true,
            username: None,
            password: None,
            keepalive: 60,
            forwards: Vec::new(),
            subscriptions: Vec::new(),
            parallel: 2,
        }
    }
}

impl BridgeSettings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut settings = BridgeSettings::default();
        let mut numbered: BTreeMap<u32, (Option<String>, Option<QoS>)> = BTreeMap::new();

        for item in parse_kv_lines(content) {
            let (_, key, value) = item?;
            match key {
                "bridge.address" => {
                    // tolerate a scheme prefix on the upstream address
                    settings.address = match value.split_once("://") {
                        Some((_, rest)) => rest.to_string(),
                        None => value.to_string(),
                    };
                }
                "bridge.proto_ver" => {
                    let ver: u8 = parse_num(key, value)?;
                    settings.proto_ver =
                        ProtocolVersion::from_u8(ver).ok_or(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })?;
                }
                "bridge.clientid" => settings.clientid = value.to_string(),
                "bridge.clean_start" => settings.clean_start = parse_bool(key, value)?,
                "bridge.username" => settings.username = Some(value.to_string()),
                "bridge.password" => settings.password = Some(value.to_string()),
                "bridge.keepalive" => settings.keepalive = parse_num(key, value)?,
                "bridge.parallel" => settings.parallel = parse_num(key, value)?,
                "bridge.forwards" => {
                    settings.forwards = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                _ => {
                    if let Some(rest) = key.strip_prefix("bridge.subscription.") {
                        if let Some((index, field)) = rest.split_once('.') {
                            let index: u32 = parse_num(key, index)?;
                            let entry = numbered.entry(index).or_default();
                            match field {
                                "topic" => entry.0 = Some(value.to_string()),
                                "qos" => {
                                    let qos: u8 = parse_num(key, value)?;
                                    entry.1 =
                                        Some(QoS::from_u8(qos).ok_or(ConfigError::InvalidValue {
                                            key: key.to_string(),
                                            value: value.to_string(),
                                        })?);
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }

        for (index, (topic, qos)) in numbered {
            match topic {
                Some(topic) => settings.subscriptions.push(BridgeSubscription {
                    topic,
                    qos: qos.unwrap_or(QoS::AtMostOnce),
                }),
                None => {
                    return Err(ConfigError::Validation(format!(
                        "bridge.subscription.{}: topic is required",
                        index
                    )))
                }
            }
        }

        if settings.address.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.address is required".to_string(),
            ));
        }
        if settings.parallel == 0 {
            return Err(ConfigError::Validation(
                "bridge.parallel must be non-zero".to_string(),
            ));
        }

        Ok(settings)
    }
}
