use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_providers_path")]
    pub providers_path: PathBuf,
    #[serde(default)]
    pub production: ProductionSettings,
    #[serde(default)]
    pub streaming: StreamingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers_path: default_providers_path(),
            production: ProductionSettings::default(),
            streaming: StreamingSettings::default(),
        }
    }
}

impl Config {
    /// Load the gateway config. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Self = serde_saphyr::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.production
            .rate_limit
            .validate()
            .map_err(|reason| ConfigError::Invalid(format!("production.rate_limit: {reason}")))
    }
}

fn default_providers_path() -> PathBuf {
    PathBuf::from("config/providers.yaml")
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bounds the time until a response starts (validation, pre-flight, upstream setup).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            keep_alive_interval_seconds: default_keep_alive_interval(),
            cors_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    60
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

// ============================================================================
// ProductionSettings
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProductionSettings {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_stream_queue_capacity")]
    pub stream_queue_capacity: usize,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_seconds: u64,
}

impl Default for ProductionSettings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            shutdown_grace_seconds: default_shutdown_grace(),
            stream_queue_capacity: default_stream_queue_capacity(),
            stream_idle_timeout_seconds: default_stream_idle_timeout(),
        }
    }
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_stream_queue_capacity() -> usize {
    64
}

fn default_stream_idle_timeout() -> u64 {
    120
}

/// Fixed-window admission budget. `requests_per_window: 0` disables the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// An enabled limit needs a window to count in.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.requests_per_window > 0 && self.window_seconds == 0 {
            return Err("window_seconds must be positive when requests_per_window is set");
        }
        Ok(())
    }
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30
}

// ============================================================================
// StreamingSettings
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSettings {
    /// Temperature used when the caller does not send one.
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            default_temperature: default_temperature(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("provider catalog not found: {}", .0.display())]
    MissingCatalog(PathBuf),

    #[error("duplicate provider '{0}' in catalog")]
    DuplicateProvider(String),

    #[error("invalid provider '{name}': {reason}")]
    InvalidProvider { name: String, reason: String },
}

// ============================================================================
// Tests
// ============================================================================
