//! Client configuration
//!
//! A [`ClientConfig`] carries everything needed to dial one broker. It is
//! assembled either through `ClientBuilder` setters or loaded from a TOML
//! file, validated once, and then owned immutably by the client it built.

use crate::client::state::ReconnectConfig;
use crate::error::{EngineError, EngineResult};
use crate::routing::topic::validate_topic_name;
use crate::transport::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub const DEFAULT_KEEPALIVE_SECS: u16 = 120;
pub const DEFAULT_KEEPALIVE_FACTOR: f64 = 1.5;
pub const DEFAULT_DIAL_TIMEOUT_SECS: u16 = 20;
pub const DEFAULT_BUFFER_SIZE: usize = 128;
pub const MAX_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u16 = 5;

/// Connection parameters for one client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Broker address: `host`, `host:port`, `mqtt://host:port` or `mqtts://host:port`
    pub server: String,
    /// Empty means a client id is generated per dial
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Multiplier applied between reconnect attempts
    #[serde(default = "default_keepalive_factor")]
    pub keepalive_factor: f64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_buffer_size")]
    pub send_buf: usize,
    #[serde(default = "default_buffer_size")]
    pub recv_buf: usize,
    #[serde(default)]
    pub will: Option<LastWill>,
    /// Verbosity for the process-wide subscriber installed by whoever owns
    /// logging (the `mqtt-engine` binary reads it); clients do not filter on it
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u16,
}

fn default_clean_session() -> bool {
    true
}

fn default_keepalive() -> u16 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_keepalive_factor() -> f64 {
    DEFAULT_KEEPALIVE_FACTOR
}

fn default_dial_timeout() -> u16 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_drain_timeout() -> u16 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

/// User name and password sent in CONNECT
///
/// In a config file the values may instead be read from environment
/// variables named by `username_env` / `password_env`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
            username_env: None,
            password_env: None,
        }
    }
}

/// TLS material; presence of this section enables TLS
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    /// PEM client certificate chain
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// PEM bundle of trusted roots
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Name to verify the server certificate against instead of the host
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub skip_verify: bool,
}

/// Message the broker publishes when this client disappears
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWill {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Engine log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Verbose => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Silent => LevelFilter::OFF,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "verbose" | "trace" => Some(LogLevel::Verbose),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "silent" | "off" => Some(LogLevel::Silent),
            _ => None,
        }
    }
}

/// Limits applied to stored, unacknowledged publishes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistStrategy {
    /// Zero means unbounded
    #[serde(default)]
    pub max_count: u32,
    /// Refuse new packets once `max_count` is reached
    #[serde(default)]
    pub drop_on_exceed: bool,
    /// Overwrite an existing entry stored under the same key
    #[serde(default = "default_duplicate_replace")]
    pub duplicate_replace: bool,
}

fn default_duplicate_replace() -> bool {
    true
}

impl Default for PersistStrategy {
    fn default() -> Self {
        Self {
            max_count: 0,
            drop_on_exceed: false,
            duplicate_replace: true,
        }
    }
}

/// Where unacknowledged QoS 1/2 publishes are kept
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PersistConfig {
    #[default]
    None,
    Memory {
        #[serde(default)]
        strategy: PersistStrategy,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        strategy: PersistStrategy,
    },
}

/// Broker host, port and whether the scheme asks for TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServerAddress {
    /// Parse `host`, `host:port` or a `mqtt`/`mqtts`/`tcp`/`ssl`/`tls` URL
    pub fn parse(server: &str) -> Result<Self, String> {
        let server = server.trim();
        if server.is_empty() {
            return Err("server address is empty".to_string());
        }

        let with_scheme = if server.contains("://") {
            server.to_string()
        } else {
            format!("mqtt://{server}")
        };

        let url = Url::parse(&with_scheme).map_err(|e| format!("invalid server '{server}': {e}"))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            other => return Err(format!("unsupported scheme '{other}'")),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| format!("server '{server}' has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            client_id: String::new(),
            clean_session: true,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            keepalive_factor: DEFAULT_KEEPALIVE_FACTOR,
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            credentials: None,
            tls: None,
            send_buf: DEFAULT_BUFFER_SIZE,
            recv_buf: DEFAULT_BUFFER_SIZE,
            will: None,
            log_level: LogLevel::default(),
            persist: PersistConfig::default(),
            reconnect: ReconnectConfig::default(),
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Load configuration from TOML file with environment variable resolution
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(content)?;
        config.resolve_env_vars()?;
        config
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(credentials) = self.credentials.as_mut() {
            if let Some(name) = credentials.username_env.as_deref() {
                credentials.username = get_env_var_required(name)?;
            }
            if let Some(name) = credentials.password_env.as_deref() {
                credentials.password = Some(get_env_var_required(name)?);
            }
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_secs))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.dial_timeout_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.drain_timeout_secs))
    }

    pub fn server_address(&self) -> EngineResult<ServerAddress> {
        ServerAddress::parse(&self.server).map_err(|reason| EngineError::configuration("server", reason))
    }

    /// Whether the session should be wrapped in TLS
    pub fn uses_tls(&self) -> bool {
        self.tls.is_some() || self.server_address().map(|a| a.tls).unwrap_or(false)
    }

    /// Check every field, reporting the first one that is invalid
    pub fn validate(&self) -> EngineResult<()> {
        self.server_address()?;

        if self.client_id.trim() != self.client_id {
            return Err(EngineError::configuration(
                "client_id",
                "must not start or end with whitespace",
            ));
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(EngineError::configuration(
                "client_id",
                "an empty client id requires clean_session = true",
            ));
        }

        if self.keepalive_secs == 0 {
            return Err(EngineError::configuration(
                "keepalive",
                "must be greater than 0",
            ));
        }
        if !self.keepalive_factor.is_finite() || self.keepalive_factor < 1.0 {
            return Err(EngineError::configuration(
                "keepalive_factor",
                format!("must be at least 1.0, got {}", self.keepalive_factor),
            ));
        }
        if self.dial_timeout_secs == 0 {
            return Err(EngineError::configuration(
                "dial_timeout",
                "must be greater than 0",
            ));
        }
        for (field, size) in [("send_buf", self.send_buf), ("recv_buf", self.recv_buf)] {
            if size == 0 || size > MAX_BUFFER_SIZE {
                return Err(EngineError::configuration(
                    field,
                    format!("must be between 1 and {MAX_BUFFER_SIZE}, got {size}"),
                ));
            }
        }

        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(EngineError::configuration(
                    "credentials",
                    "user name must not be empty",
                ));
            }
        }

        if let Some(tls) = &self.tls {
            validate_tls(tls)?;
        }

        if let Some(will) = &self.will {
            validate_topic_name(&will.topic)
                .map_err(|e| EngineError::configuration("will", e.to_string()))?;
        }

        if let PersistConfig::File { path, .. } = &self.persist {
            if path.as_os_str().is_empty() {
                return Err(EngineError::configuration(
                    "persist",
                    "file store path must not be empty",
                ));
            }
        }

        self.reconnect
            .validate()
            .map_err(|reason| EngineError::configuration("reconnect", reason))?;

        Ok(())
    }
}

fn validate_tls(tls: &TlsConfig) -> EngineResult<()> {
    match (&tls.cert_file, &tls.key_file) {
        (Some(_), None) => {
            return Err(EngineError::configuration(
                "tls",
                "client certificate given without a private key",
            ))
        }
        (None, Some(_)) => {
            return Err(EngineError::configuration(
                "tls",
                "private key given without a client certificate",
            ))
        }
        _ => {}
    }
    if tls.ca_file.is_none() && !tls.skip_verify {
        return Err(EngineError::configuration(
            "tls",
            "a CA file is required unless skip_verify is set",
        ));
    }
    if tls.server_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(EngineError::configuration(
            "tls",
            "server name must not be empty",
        ));
    }
    Ok(())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        ClientConfig::new("mqtt://localhost:1883")
    }

    #[test]
    fn test_defaults() {
        let config = valid_config();
        assert_eq!(config.keepalive(), Duration::from_secs(120));
        assert_eq!(config.dial_timeout(), Duration::from_secs(20));
        assert_eq!(config.send_buf, 128);
        assert_eq!(config.recv_buf, 128);
        assert!(config.clean_session);
        assert_eq!(config.persist, PersistConfig::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_address_forms() {
        let plain = ServerAddress::parse("broker.local").unwrap();
        assert_eq!((plain.host.as_str(), plain.port, plain.tls), ("broker.local", 1883, false));

        let with_port = ServerAddress::parse("10.0.0.1:1884").unwrap();
        assert_eq!((with_port.host.as_str(), with_port.port), ("10.0.0.1", 1884));

        let secure = ServerAddress::parse("mqtts://broker.local").unwrap();
        assert_eq!(secure.port, 8883);
        assert!(secure.tls);

        let v6 = ServerAddress::parse("[::1]:1885").unwrap();
        assert_eq!((v6.host.as_str(), v6.port), ("::1", 1885));

        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("http://broker").is_err());
    }

    #[test]
    fn test_validate_reports_first_invalid_field() {
        let mut config = valid_config();
        config.keepalive_secs = 0;
        config.send_buf = 0;
        assert_eq!(config.validate().unwrap_err().field(), Some("keepalive"));

        config.keepalive_secs = 10;
        assert_eq!(config.validate().unwrap_err().field(), Some("send_buf"));
    }

    #[test]
    fn test_validate_empty_server() {
        let config = ClientConfig::default();
        assert_eq!(config.validate().unwrap_err().field(), Some("server"));
    }

    #[test]
    fn test_validate_persistent_session_needs_client_id() {
        let mut config = valid_config();
        config.clean_session = false;
        assert_eq!(config.validate().unwrap_err().field(), Some("client_id"));

        config.client_id = "sensor-1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_tls_pairs() {
        let mut config = valid_config();
        config.tls = Some(TlsConfig {
            cert_file: Some(PathBuf::from("client.pem")),
            ca_file: Some(PathBuf::from("ca.pem")),
            ..Default::default()
        });
        assert_eq!(config.validate().unwrap_err().field(), Some("tls"));

        config.tls = Some(TlsConfig {
            skip_verify: true,
            ..Default::default()
        });
        assert!(config.validate().is_ok());
        assert!(config.uses_tls());
    }

    #[test]
    fn test_validate_will_topic() {
        let mut config = valid_config();
        config.will = Some(LastWill {
            topic: "status/+".to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: b"offline".to_vec(),
        });
        assert_eq!(config.validate().unwrap_err().field(), Some("will"));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::Verbose.to_level_filter(), LevelFilter::TRACE);
        assert_eq!(LogLevel::Silent.to_level_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_from_toml_with_sections() {
        let config = ClientConfig::from_toml_str(
            r#"
server = "mqtt://localhost:1883"
client_id = "engine-test"
clean_session = false
log_level = "debug"

[will]
topic = "clients/engine-test/status"
qos = 1
retain = true

[persist]
mode = "memory"

[persist.strategy]
max_count = 10
drop_on_exceed = true

[reconnect]
first_delay_ms = 50
max_attempts = 3
"#,
        )
        .unwrap();

        assert_eq!(config.client_id, "engine-test");
        assert!(!config.clean_session);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.will.as_ref().map(|w| w.qos), Some(QoS::AtLeastOnce));
        assert_eq!(
            config.persist,
            PersistConfig::Memory {
                strategy: PersistStrategy {
                    max_count: 10,
                    drop_on_exceed: true,
                    duplicate_replace: true,
                }
            }
        );
        assert_eq!(config.reconnect.first_delay_ms, 50);
        assert_eq!(config.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn test_from_toml_rejects_invalid_qos() {
        let result = ClientConfig::from_toml_str(
            r#"
server = "localhost"
[will]
topic = "status"
qos = 3
"#,
        );
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_credentials_from_missing_env_var() {
        let result = ClientConfig::from_toml_str(
            r#"
server = "localhost"
[credentials]
username_env = "MQTT_ENGINE_TEST_SURELY_UNSET_USER"
"#,
        );
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
    }
}
