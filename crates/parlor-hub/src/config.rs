//! Configuration loading and typed config structures for the Parlor hub.
//!
//! The configuration lives in `parlor-config.yaml`. Every field has a
//! default, so an empty or missing file yields a working development
//! setup: in-memory store, local payment gateway, no NATS.

use std::path::Path;
use std::time::Duration;

use parlor_ledger::RevenueSplit;
use parlor_types::{Role, UserId};
use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration. Mirrors `parlor-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ParlorConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection handling.
    #[serde(default)]
    pub hub: HubConfig,

    /// Signaling delivery rules.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Settlement parameters.
    #[serde(default)]
    pub settlement: SettlementConfig,

    /// External payment gateway.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Database and message bus.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Users inserted into the store at startup.
    #[serde(default)]
    pub seed_users: Vec<SeedUser>,
}

impl ParlorConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// Environment variables override YAML values:
    /// - `DATABASE_URL` overrides `infrastructure.database_url`
    /// - `NATS_URL` overrides `infrastructure.nats_url`
    /// - `PARLOR_PORT` overrides `server.port`
    /// - `PAYMENT_GATEWAY_URL` overrides `gateway.url`
    /// - `PAYMENT_GATEWAY_API_KEY` overrides `gateway.api_key`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Like [`from_file`](Self::from_file), but a missing file yields the
    /// defaults (with environment overrides applied).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_only(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse without consulting the environment.
    fn parse_only(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Override deployment settings with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.infrastructure.database_url = Some(val);
        }
        if let Ok(val) = std::env::var("NATS_URL") {
            self.infrastructure.nats_url = Some(val);
        }
        if let Ok(val) = std::env::var("PARLOR_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(e) => tracing::warn!(value = %val, error = %e, "ignoring invalid PARLOR_PORT"),
            }
        }
        if let Ok(val) = std::env::var("PAYMENT_GATEWAY_URL") {
            self.gateway.url = Some(val);
        }
        if let Ok(val) = std::env::var("PAYMENT_GATEWAY_API_KEY") {
            self.gateway.api_key = Some(val);
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Connection handling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HubConfig {
    /// Frames buffered per connection before new ones are dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Seconds between server-initiated keep-alive pings.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Seconds of silence after which a connection is reaped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl HubConfig {
    /// Keep-alive interval as a [`Duration`], at least one second.
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(at_least_one(self.keepalive_interval_secs))
    }

    /// Idle timeout as a [`Duration`].
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a [`Duration`], at least one second.
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(at_least_one(self.reap_interval_secs))
    }
}

/// Timer intervals must be non-zero.
const fn at_least_one(secs: u64) -> u64 {
    if secs == 0 { 1 } else { secs }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Signaling delivery configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoutingConfig {
    /// Deliver `chat_message` and unrecognized frames to every connection
    /// instead of the session channel only.
    #[serde(default)]
    pub legacy_broadcast: bool,
}

/// Settlement configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SettlementConfig {
    /// Fraction of every settlement credited to the provider (`0.80`).
    #[serde(default)]
    pub provider_share: RevenueSplit,

    /// Deadline for the settlement store transaction, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Cancel the session when the client cannot pay instead of leaving it
    /// `in_progress` for a top-up.
    #[serde(default)]
    pub cancel_on_insufficient_funds: bool,
}

impl SettlementConfig {
    /// Store deadline as a [`Duration`].
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            provider_share: RevenueSplit::default(),
            store_timeout_ms: default_store_timeout_ms(),
            cancel_on_insufficient_funds: false,
        }
    }
}

/// External payment gateway configuration. Without a URL the in-process
/// gateway is used.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway API.
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-call deadline, in milliseconds.
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

impl GatewayConfig {
    /// Call deadline as a [`Duration`].
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

/// Database and message bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfrastructureConfig {
    /// `PostgreSQL` connection string. Unset means the in-memory store.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// NATS URL for presence fan-out. Unset disables it.
    #[serde(default)]
    pub nats_url: Option<String>,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
            nats_url: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// A user record inserted at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedUser {
    /// Fixed id, so clients can be configured against it.
    pub id: UserId,
    /// Display name.
    pub display_name: String,
    /// Role.
    pub role: Role,
    /// Opening balance in minor units.
    #[serde(default)]
    pub balance: i64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    8080
}

const fn default_outbound_queue() -> usize {
    256
}

const fn default_keepalive_interval_secs() -> u64 {
    30
}

const fn default_idle_timeout_secs() -> u64 {
    120
}

const fn default_reap_interval_secs() -> u64 {
    15
}

const fn default_store_timeout_ms() -> u64 {
    5_000
}

const fn default_gateway_timeout_ms() -> u64 {
    10_000
}

const fn default_max_connections() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ParlorConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.hub.idle_timeout_secs, 120);
        assert_eq!(
            config.settlement.provider_share.provider_share(),
            Decimal::new(80, 2)
        );
        assert!(!config.routing.legacy_broadcast);
        assert!(!config.settlement.cancel_on_insufficient_funds);
        assert!(config.infrastructure.database_url.is_none());
        assert!(config.seed_users.is_empty());
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9000
hub:
  outbound_queue: 64
  keepalive_interval_secs: 10
  idle_timeout_secs: 45
routing:
  legacy_broadcast: true
settlement:
  provider_share: "0.75"
  store_timeout_ms: 2000
  cancel_on_insufficient_funds: true
gateway:
  url: "https://payments.internal"
  timeout_ms: 3000
logging:
  level: "debug"
  json: true
seed_users:
  - id: "01890a5d-ac96-774b-bcce-b302099a8057"
    display_name: "Madame Vey"
    role: provider
  - id: "01890a5d-ac96-774b-bcce-b302099a8058"
    display_name: "Sam"
    role: client
    balance: 500
"#;
        let config = ParlorConfig::parse_only(yaml).ok();
        let config = config.unwrap_or_default();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.hub.outbound_queue, 64);
        assert_eq!(config.hub.reap_interval_secs, 15);
        assert!(config.routing.legacy_broadcast);
        assert_eq!(
            config.settlement.provider_share.provider_share(),
            Decimal::new(75, 2)
        );
        assert_eq!(config.settlement.store_timeout(), Duration::from_secs(2));
        assert_eq!(config.gateway.url.as_deref(), Some("https://payments.internal"));
        assert!(config.logging.json);
        assert_eq!(config.seed_users.len(), 2);
        assert_eq!(
            config.seed_users.iter().map(|u| u.balance).collect::<Vec<_>>(),
            vec![0, 500]
        );
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(ParlorConfig::parse_only("").ok(), Some(ParlorConfig::default()));
    }

    #[test]
    fn share_above_one_is_rejected() {
        let yaml = "settlement:\n  provider_share: \"1.2\"\n";
        assert!(ParlorConfig::parse_only(yaml).is_err());
    }
}
