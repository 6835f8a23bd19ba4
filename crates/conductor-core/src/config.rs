use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment prefix for configuration overrides (`CONDUCTOR__ENGINE__...`).
pub const ENV_PREFIX: &str = "CONDUCTOR";

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub templates: TemplateSettings,
    #[serde(default)]
    pub clients: ClientSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env(ENV_PREFIX)
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("engine.default_step_timeout_secs", 300)?
            .set_default("engine.approval_expiry_secs", 86_400)?
            .set_default("engine.sweep_interval_secs", 30)?
            .set_default("engine.event_buffer", 1024)?
            .set_default("locks.poll_interval_ms", 1000)?
            .set_default("locks.default_ttl_secs", 300)?
            .set_default("store.backend", "memory")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)
    }
}

/// Workflow engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    #[serde(default = "default_approval_expiry_secs")]
    pub approval_expiry_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            approval_expiry_secs: default_approval_expiry_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineSettings {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn approval_expiry(&self) -> Duration {
        Duration::from_secs(self.approval_expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_approval_expiry_secs() -> u64 {
    86_400 // 24 hours
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    1024
}

/// Which lease backend to use
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    #[default]
    Memory,
    Redis,
}

/// Resource lock configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    #[serde(default)]
    pub backend: LockBackendKind,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            default_ttl_secs: default_lock_ttl_secs(),
            redis_url: None,
        }
    }
}

impl LockSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lock_ttl_secs() -> u64 {
    300
}

/// Which state store backend to use
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    File,
    Redis,
}

/// State store configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackendKind,
    /// Base directory for the file backend
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Where workflow templates are loaded from
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TemplateSettings {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Base URLs of the external collaborators
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClientSettings {
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub decision_url: Option<String>,
    #[serde(default)]
    pub approval_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Progress notification targets
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationSettings {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Event type patterns to forward (`run.*`, `*`). Empty forwards everything.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// HMAC-SHA256 key for the `X-Conductor-Signature` header
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_environment() {
        let config = AppConfig::load_from_env("CONDUCTOR_TEST_UNSET").unwrap();

        assert_eq!(config.engine.default_step_timeout_secs, 300);
        assert_eq!(config.engine.approval_expiry(), Duration::from_secs(86_400));
        assert_eq!(config.locks.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.store.backend, StoreBackendKind::Memory);
        assert_eq!(config.locks.backend, LockBackendKind::Memory);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_file("/nonexistent/conductor").unwrap();
        assert_eq!(config.engine.sweep_interval(), Duration::from_secs(30));
        assert!(config.templates.dir.is_none());
    }

    #[test]
    fn test_server_config_creation() {
        let config = ServerConfig::new()
            .with_host("127.0.0.1".to_string())
            .with_port(3000);

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_backend_kind_parsing() {
        let kind: StoreBackendKind = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(kind, StoreBackendKind::Redis);

        let kind: LockBackendKind = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(kind, LockBackendKind::Memory);
    }
}
