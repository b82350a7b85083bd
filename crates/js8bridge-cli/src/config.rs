//! Bridge settings – reads/writes `~/.js8bridge/config.toml`.

use js8bridge_core::BridgeConfig;
use js8bridge_middleware::MqttConfig;
use js8bridge_types::BridgeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "JS8BRIDGE_CONFIG";

/// Which bus the bridge publishes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusTransport {
    /// External MQTT broker.
    #[default]
    Mqtt,
    /// In-process bus exposed through the WebSocket gateway.
    Websocket,
}

impl std::str::FromStr for BusTransport {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(BusTransport::Mqtt),
            "websocket" | "ws" => Ok(BusTransport::Websocket),
            other => Err(BridgeError::Config(format!("unknown bus transport '{other}'"))),
        }
    }
}

/// Persisted bridge configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host running JS8Call's TCP API.
    #[serde(default = "default_js8call_host")]
    pub js8call_host: String,

    #[serde(default = "default_js8call_port")]
    pub js8call_port: u16,

    #[serde(default)]
    pub bus_transport: BusTransport,

    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// Broker login; anonymous when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub broker_username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub broker_password: String,

    /// Address the bus WebSocket gateway listens on.
    #[serde(default = "default_bus_host")]
    pub bus_host: String,

    #[serde(default = "default_bus_port")]
    pub bus_port: u16,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,

    /// Minimum gap between two commands sent to JS8Call.
    #[serde(default = "default_tx_delay_secs")]
    pub tx_delay_secs: u64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_queue_capacity: Option<usize>,

    #[serde(default)]
    pub publish_full_event: bool,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("js8call_host", &self.js8call_host)
            .field("js8call_port", &self.js8call_port)
            .field("bus_transport", &self.bus_transport)
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("broker_username", &self.broker_username)
            .field(
                "broker_password",
                if self.broker_password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("bus_host", &self.bus_host)
            .field("bus_port", &self.bus_port)
            .field("topic_prefix", &self.topic_prefix)
            .field("reassembly_timeout_secs", &self.reassembly_timeout_secs)
            .field("tx_delay_secs", &self.tx_delay_secs)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .field("command_queue_capacity", &self.command_queue_capacity)
            .field("publish_full_event", &self.publish_full_event)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .finish()
    }
}

fn default_js8call_host() -> String {
    "127.0.0.1".to_string()
}
fn default_js8call_port() -> u16 {
    2442
}
fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_bus_host() -> String {
    "0.0.0.0".to_string()
}
fn default_bus_port() -> u16 {
    9001
}
fn default_topic_prefix() -> String {
    "js8".to_string()
}
fn default_reassembly_timeout_secs() -> u64 {
    120
}
fn default_tx_delay_secs() -> u64 {
    15
}
fn default_tick_interval_ms() -> u64 {
    250
}
fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            js8call_host: default_js8call_host(),
            js8call_port: default_js8call_port(),
            bus_transport: BusTransport::default(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            broker_username: String::new(),
            broker_password: String::new(),
            bus_host: default_bus_host(),
            bus_port: default_bus_port(),
            topic_prefix: default_topic_prefix(),
            reassembly_timeout_secs: default_reassembly_timeout_secs(),
            tx_delay_secs: default_tx_delay_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            command_queue_capacity: None,
            publish_full_event: false,
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl Config {
    /// `host:port` of the JS8Call TCP API.
    pub fn js8call_addr(&self) -> String {
        format!("{}:{}", self.js8call_host, self.js8call_port)
    }

    /// `host:port` of the MQTT broker.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }

    /// `host:port` the bus gateway binds to.
    pub fn bus_addr(&self) -> String {
        format!("{}:{}", self.bus_host, self.bus_port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.tx_delay_secs == 0 {
            return Err(BridgeError::Config("tx_delay_secs must be positive".to_string()));
        }
        if self.reassembly_timeout_secs == 0 {
            return Err(BridgeError::Config(
                "reassembly_timeout_secs must be positive".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(BridgeError::Config("tick_interval_ms must be positive".to_string()));
        }
        if self.command_queue_capacity == Some(0) {
            return Err(BridgeError::Config(
                "command_queue_capacity must be at least 1 when set".to_string(),
            ));
        }
        if self.bus_transport == BusTransport::Mqtt && self.broker_host.trim().is_empty() {
            return Err(BridgeError::Config("broker_host must be set for the mqtt transport".to_string()));
        }
        if !self.broker_password.is_empty() && self.broker_username.is_empty() {
            return Err(BridgeError::Config("broker_password requires broker_username".to_string()));
        }
        let prefix = self.topic_prefix.trim_end_matches('/');
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return Err(BridgeError::Config(format!(
                "topic_prefix '{}' must be non-empty and free of '+' and '#'",
                self.topic_prefix
            )));
        }
        Ok(())
    }

    /// Broker session settings for the mqtt transport.
    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig::new(self.broker_host.clone(), self.broker_port)
            .with_credentials(self.broker_username.clone(), self.broker_password.clone())
            .with_reconnect_delay(self.reconnect_delay())
    }

    /// Plain values for the core bridge.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            topic_prefix: self.topic_prefix.clone(),
            reassembly_timeout: Duration::from_secs(self.reassembly_timeout_secs),
            tx_delay: Duration::from_secs(self.tx_delay_secs),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            command_queue_capacity: self.command_queue_capacity,
            publish_full_event: self.publish_full_event,
        }
    }
}

/// Resolve the config file location: explicit argument, then
/// `JS8BRIDGE_CONFIG`, then `~/.js8bridge/config.toml`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    if let Some(path) = arg {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".js8bridge").join("config.toml")
}

/// Load the config from `path`. Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Load `path`, writing the defaults there first when it is missing, then
/// apply environment overrides and validate.
pub fn load_or_init(path: &Path) -> Result<(Config, bool), BridgeError> {
    let (mut cfg, created) = match load_from(path)? {
        Some(cfg) => (cfg, false),
        None => {
            let cfg = Config::default();
            save_to(&cfg, path)?;
            (cfg, true)
        }
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok((cfg, created))
}

/// Apply `JS8BRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `JS8BRIDGE_JS8CALL_HOST` | `js8call_host` |
/// | `JS8BRIDGE_JS8CALL_PORT` | `js8call_port` |
/// | `JS8BRIDGE_BUS_TRANSPORT` | `bus_transport` (`mqtt` or `websocket`) |
/// | `JS8BRIDGE_BROKER_HOST` | `broker_host` |
/// | `JS8BRIDGE_BROKER_PORT` | `broker_port` |
/// | `JS8BRIDGE_BROKER_USERNAME` | `broker_username` |
/// | `JS8BRIDGE_BROKER_PASSWORD` | `broker_password` |
/// | `JS8BRIDGE_BUS_HOST` | `bus_host` |
/// | `JS8BRIDGE_BUS_PORT` | `bus_port` |
/// | `JS8BRIDGE_TOPIC_PREFIX` | `topic_prefix` |
/// | `JS8BRIDGE_TX_DELAY_SECS` | `tx_delay_secs` |
/// | `JS8BRIDGE_REASSEMBLY_TIMEOUT_SECS` | `reassembly_timeout_secs` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("JS8BRIDGE_JS8CALL_HOST") {
        cfg.js8call_host = v;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_JS8CALL_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.js8call_port = port;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BUS_TRANSPORT")
        && let Ok(transport) = v.parse::<BusTransport>()
    {
        cfg.bus_transport = transport;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BROKER_HOST") {
        cfg.broker_host = v;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker_port = port;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BROKER_USERNAME") {
        cfg.broker_username = v;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BROKER_PASSWORD") {
        cfg.broker_password = v;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BUS_HOST") {
        cfg.bus_host = v;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_BUS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bus_port = port;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_TOPIC_PREFIX") {
        cfg.topic_prefix = v;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_TX_DELAY_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.tx_delay_secs = secs;
    }
    if let Ok(v) = std::env::var("JS8BRIDGE_REASSEMBLY_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.reassembly_timeout_secs = secs;
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| BridgeError::Config(format!("failed to create config directory: {e}")))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                BridgeError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Serialization(format!("failed to serialize config: {e}")))?;
    // Owner read/write only (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| {
                BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
            })?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| {
        BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}
