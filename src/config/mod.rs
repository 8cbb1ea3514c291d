//! Configuration
//!
//! Flat `key=value` configuration files (`#` starts a comment line), with
//! environment-variable overrides and CLI flags layered on top. Precedence:
//! CLI flags > environment > config files > built-in defaults.

mod bridge;

pub use bridge::{BridgeSettings, BridgeSubscription};

use std::fmt;
use std::path::Path;

/// Configuration error; any of these refuses startup
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// Line without a `key=value` shape
    Syntax { line: usize },
    InvalidValue { key: String, value: String },
    InvalidUrl(String),
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Syntax { line } => write!(f, "syntax error at line {}", line),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {}: {:?}", key, value)
            }
            ConfigError::InvalidUrl(url) => write!(f, "invalid listener url: {:?}", url),
            ConfigError::Validation(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

pub(crate) fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Iterate `key=value` pairs of a config file body, skipping comments
pub(crate) fn parse_kv_lines(
    content: &str,
) -> impl Iterator<Item = Result<(usize, &str, &str), ConfigError>> {
    content.lines().enumerate().filter_map(|(i, raw)| {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.split_once('=') {
            Some((key, value)) => Some(Ok((i + 1, key.trim(), value.trim()))),
            None => Some(Err(ConfigError::Syntax { line: i + 1 })),
        }
    })
}

/// Transport selected by a listener URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// A parsed listener URL.
///
/// `broker+tcp://host:port` is plaintext MQTT, `nmq+ws://host:port/path`
/// MQTT-over-WebSocket. The TLS spellings (`broker+tls+tcp`, `nmq+wss`)
/// are accepted and behave identically above the transport, which is
/// assumed to hand this layer plaintext frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerUrl {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ListenerUrl {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let err = || ConfigError::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(err)?;
        let kind = match scheme {
            "broker+tcp" | "broker+tls+tcp" => TransportKind::Tcp,
            "nmq+ws" | "nmq+wss" => TransportKind::WebSocket,
            _ => return Err(err()),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (host, port) = authority.rsplit_once(':').ok_or_else(err)?;
        if host.is_empty() {
            return Err(err());
        }
        let port: u16 = port.parse().map_err(|_| err())?;

        Ok(Self {
            kind,
            host: host.to_string(),
            port,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        })
    }

    /// The `host:port` string handed to the socket bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// WebSocket listener settings
#[derive(Debug, Clone)]
pub struct WebsocketSettings {
    pub enable: bool,
    pub url: String,
}

impl Default for WebsocketSettings {
    fn default() -> Self {
        Self {
            enable: false,
            url: "nmq+ws://0.0.0.0:8083/mqtt".to_string(),
        }
    }
}

/// HTTP admin endpoint settings. Parsed and validated here; the endpoint
/// itself is an external collaborator.
#[derive(Debug, Clone)]
pub struct HttpServerSettings {
    pub enable: bool,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self {
            enable: false,
            port: 8081,
            username: None,
            password: None,
        }
    }
}

/// Broker settings assembled from defaults, files, environment and CLI
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub daemon: bool,
    /// Worker threads for the task pool; 0 = derive from the machine
    pub num_taskq_thread: u16,
    /// Upper bound on worker threads; 0 = no cap
    pub max_taskq_thread: u16,
    /// Maximum outstanding work items (concurrent connections served)
    pub parallel: usize,
    /// Cap on accumulated MQTT user-property bytes per packet
    pub property_size: usize,
    /// Bound on per-pipe outbound queues and cached-session queues
    pub msq_len: usize,
    /// Interval of the qos retransmit/expiry timer, in seconds
    pub qos_duration: u64,
    pub allow_anonymous: bool,
    pub websocket: WebsocketSettings,
    pub http_server: HttpServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: "broker+tcp://0.0.0.0:1883".to_string(),
            daemon: false,
            num_taskq_thread: 0,
            max_taskq_thread: 0,
            parallel: 32,
            property_size: 64,
            msq_len: 64,
            qos_duration: 10,
            allow_anonymous: true,
            websocket: WebsocketSettings::default(),
            http_server: HttpServerSettings::default(),
        }
    }
}

impl Settings {
    /// Apply one `key=value` pair. Unknown keys are ignored so config
    /// files can carry keys for the out-of-scope collaborators.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "url" => self.url = value.to_string(),
            "daemon" => self.daemon = parse_bool(key, value)?,
            "num_taskq_thread" => self.num_taskq_thread = parse_num(key, value)?,
            "max_taskq_thread" => self.max_taskq_thread = parse_num(key, value)?,
            "parallel" => self.parallel = parse_num(key, value)?,
            "property_size" => self.property_size = parse_num(key, value)?,
            "msq_len" => self.msq_len = parse_num(key, value)?,
            "qos_duration" => self.qos_duration = parse_num(key, value)?,
            "allow_anonymous" => self.allow_anonymous = parse_bool(key, value)?,
            "websocket.enable" => self.websocket.enable = parse_bool(key, value)?,
            "websocket.url" => self.websocket.url = value.to_string(),
            "http_server.enable" => self.http_server.enable = parse_bool(key, value)?,
            "http_server.port" => self.http_server.port = parse_num(key, value)?,
            "http_server.username" => self.http_server.username = Some(value.to_string()),
            "http_server.password" => self.http_server.password = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    /// Parse a config file body on top of the current values
    pub fn apply_str(&mut self, content: &str) -> Result<(), ConfigError> {
        for entry in parse_kv_lines(content) {
            let (_, key, value) = entry?;
            self.apply(key, value)?;
        }
        Ok(())
    }

    /// Load a config file on top of the current values
    pub fn apply_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.apply_str(&content)
    }

    /// Apply `NANOMQ_*` environment-variable overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        const VARS: &[(&str, &str)] = &[
            ("NANOMQ_BROKER_URL", "url"),
            ("NANOMQ_DAEMON", "daemon"),
            ("NANOMQ_NUM_TASKQ_THREAD", "num_taskq_thread"),
            ("NANOMQ_MAX_TASKQ_THREAD", "max_taskq_thread"),
            ("NANOMQ_PARALLEL", "parallel"),
            ("NANOMQ_PROPERTY_SIZE", "property_size"),
            ("NANOMQ_MSQ_LEN", "msq_len"),
            ("NANOMQ_QOS_DURATION", "qos_duration"),
            ("NANOMQ_ALLOW_ANONYMOUS", "allow_anonymous"),
            ("NANOMQ_WEBSOCKET_ENABLE", "websocket.enable"),
            ("NANOMQ_WEBSOCKET_URL", "websocket.url"),
            ("NANOMQ_HTTP_SERVER_ENABLE", "http_server.enable"),
            ("NANOMQ_HTTP_SERVER_PORT", "http_server.port"),
            ("NANOMQ_HTTP_SERVER_USERNAME", "http_server.username"),
            ("NANOMQ_HTTP_SERVER_PASSWORD", "http_server.password"),
        ];
        for (var, key) in VARS {
            if let Ok(value) = std::env::var(var) {
                self.apply(key, &value)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ListenerUrl::parse(&self.url)?;
        if self.websocket.enable {
            let ws = ListenerUrl::parse(&self.websocket.url)?;
            if ws.kind != TransportKind::WebSocket {
                return Err(ConfigError::Validation(
                    "websocket.url must use an nmq+ws scheme".to_string(),
                ));
            }
        }
        if self.num_taskq_thread > 255 {
            return Err(ConfigError::Validation(
                "num_taskq_thread must be in 1..255".to_string(),
            ));
        }
        if self.max_taskq_thread > 255 {
            return Err(ConfigError::Validation(
                "max_taskq_thread must be in 1..255".to_string(),
            ));
        }
        if self.parallel == 0 {
            return Err(ConfigError::Validation("parallel must be non-zero".to_string()));
        }
        if self.qos_duration == 0 {
            return Err(ConfigError::Validation("qos_duration must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Worker-thread count for the task pool
    pub fn taskq_threads(&self) -> usize {
        let auto = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let threads = if self.num_taskq_thread == 0 {
            auto
        } else {
            self.num_taskq_thread as usize
        };
        if self.max_taskq_thread == 0 {
            threads
        } else {
            threads.min(self.max_taskq_thread as usize)
        }
    }
}

/// Parse an auth config file (`auth.<n>.login` / `auth.<n>.password`)
/// into (login, password) pairs ordered by `<n>`.
pub fn parse_auth_file<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String)>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_auth_str(&content)
}

pub fn parse_auth_str(content: &str) -> Result<Vec<(String, String)>, ConfigError> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Entry {
        login: Option<String>,
        password: Option<String>,
    }

    let mut entries: BTreeMap<u32, Entry> = BTreeMap::new();
    for item in parse_kv_lines(content) {
        let (_, key, value) = item?;
        let Some(rest) = key.strip_prefix("auth.") else {
            continue;
        };
        let Some((index, field)) = rest.split_once('.') else {
            continue;
        };
        let index: u32 = parse_num(key, index)?;
        let entry = entries.entry(index).or_default();
        match field {
            "login" => entry.login = Some(value.to_string()),
            "password" => entry.password = Some(value.to_string()),
            _ => {}
        }
    }

    let mut users = Vec::with_capacity(entries.len());
    for (index, entry) in entries {
        match (entry.login, entry.password) {
            (Some(login), Some(password)) => users.push((login, password)),
            _ => {
                return Err(ConfigError::Validation(format!(
                    "auth.{}: login and password must both be present",
                    index
                )))
            }
        }
    }
    Ok(users)
}
