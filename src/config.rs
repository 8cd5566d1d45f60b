//! Adapter configuration loaded from a TOML file.
//!
//! Every field has a default, so an empty file yields a runnable reverse-mode
//! relay listening on `127.0.0.1:8095`.

use std::{
    fs,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Upper bound on every `*_secs` setting.
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`AdapterConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is outside its accepted range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the relay reaches the chat gateway.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Listen for the gateway's inbound WebSocket connection.
    #[default]
    Reverse,
    /// Dial out to the gateway as a WebSocket client.
    Forward,
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    /// Platform identity stamped on backend envelopes.
    pub platform: String,
    pub gateway: GatewayConfig,
    pub backend: BackendConfig,
    pub chunking: ChunkingConfig,
    pub pipeline: PipelineConfig,
    pub shutdown: ShutdownConfig,
    pub correlation: CorrelationConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

/// Gateway connection settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    pub host: String,
    pub port: u16,
    /// Dial URL for forward mode; derived from `host`/`port` when empty.
    pub url: String,
    pub access_token: String,
    /// Expected heartbeat period; zero disables the watchdog.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_threshold: u32,
    pub reconnect_interval_secs: u64,
    pub response_timeout_secs: u64,
    pub outbound_capacity: usize,
    pub accept_backoff_initial_ms: u64,
    pub accept_backoff_max_ms: u64,
}

/// Backend link settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// WebSocket URL; derived from `host`/`port` when empty.
    pub url: String,
    pub host: String,
    pub port: u16,
    pub access_token: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// A session lasting at least this long resets the attempt counter.
    pub stable_period_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub response_timeout_secs: u64,
    pub outbound_capacity: usize,
}

/// Fragmentation and reassembly settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_fragment_size: usize,
    /// Largest payload a peer may stitch from fragments.
    pub max_message_size: usize,
    pub inter_fragment_delay_ms: u64,
    pub reassembly_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Dispatch queue settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub poll_timeout_ms: u64,
    pub yield_ms: u64,
}

/// Teardown settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for outstanding tasks.
    pub wait_secs: u64,
}

/// Response correlator settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorrelationConfig {
    pub sweep_interval_ms: u64,
}

/// Logging settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

/// Prometheus exporter settings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the exporter's HTTP listener; disabled when unset.
    pub listen: Option<SocketAddr>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Reverse,
            host: "127.0.0.1".into(),
            port: 8095,
            url: String::new(),
            access_token: String::new(),
            heartbeat_interval_secs: 30,
            heartbeat_miss_threshold: 3,
            reconnect_interval_secs: 5,
            response_timeout_secs: 30,
            outbound_capacity: 256,
            accept_backoff_initial_ms: 10,
            accept_backoff_max_ms: 1000,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            host: "127.0.0.1".into(),
            port: 8000,
            access_token: String::new(),
            max_reconnect_attempts: 10,
            reconnect_delay_secs: 5,
            stable_period_secs: 30,
            heartbeat_interval_secs: 1,
            response_timeout_secs: 30,
            outbound_capacity: 1024,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            inter_fragment_delay_ms: 10,
            reassembly_ttl_secs: 120,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            poll_timeout_ms: 1000,
            yield_ms: 50,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self { Self { wait_secs: 10 } }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl AdapterConfig {
    /// Read, parse, and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or fails
    /// [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it.
    ///
    /// An empty `platform` falls back to `qq`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        if config.platform.is_empty() {
            config.platform = "qq".into();
        }
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.chunking.max_fragment_size == 0 {
            return invalid("chunking.max_fragment_size must be non-zero");
        }
        if self.chunking.max_message_size == 0 {
            return invalid("chunking.max_message_size must be non-zero");
        }
        if self.pipeline.capacity == 0 {
            return invalid("pipeline.capacity must be non-zero");
        }
        if self.gateway.outbound_capacity == 0 || self.backend.outbound_capacity == 0 {
            return invalid("outbound_capacity must be non-zero");
        }
        if self.backend.max_reconnect_attempts == 0 {
            return invalid("backend.max_reconnect_attempts must be non-zero");
        }
        let durations = [
            ("gateway.heartbeat_interval_secs", self.gateway.heartbeat_interval_secs),
            ("gateway.reconnect_interval_secs", self.gateway.reconnect_interval_secs),
            ("gateway.response_timeout_secs", self.gateway.response_timeout_secs),
            ("backend.reconnect_delay_secs", self.backend.reconnect_delay_secs),
            ("backend.stable_period_secs", self.backend.stable_period_secs),
            ("backend.heartbeat_interval_secs", self.backend.heartbeat_interval_secs),
            ("backend.response_timeout_secs", self.backend.response_timeout_secs),
            ("chunking.reassembly_ttl_secs", self.chunking.reassembly_ttl_secs),
            ("chunking.sweep_interval_secs", self.chunking.sweep_interval_secs),
            ("shutdown.wait_secs", self.shutdown.wait_secs),
        ];
        if let Some((name, _)) = durations
            .iter()
            .find(|(_, secs)| *secs > MAX_DURATION_SECS)
        {
            return Err(ConfigError::Invalid(format!(
                "{name} must not exceed {MAX_DURATION_SECS} seconds"
            )));
        }
        if self.gateway.mode == GatewayMode::Forward
            && self.gateway.url.is_empty()
            && self.gateway.host.is_empty()
        {
            return invalid("forward mode requires gateway.url or gateway.host");
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// URL dialled in forward mode.
    #[must_use]
    pub fn dial_url(&self) -> String {
        if self.url.is_empty() {
            format!("ws://{}:{}", self.host, self.port)
        } else {
            self.url.clone()
        }
    }

    /// Address bound in reverse mode.
    #[must_use]
    pub fn listen_addr(&self) -> String { format!("{}:{}", self.host, self.port) }

    #[must_use]
    pub fn response_timeout(&self) -> Duration { Duration::from_secs(self.response_timeout_secs) }

    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Time without a heartbeat after which the socket is considered dead.
    ///
    /// `None` when heartbeat monitoring is disabled.
    #[must_use]
    pub fn heartbeat_deadline(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| {
            Duration::from_secs(self.heartbeat_interval_secs)
                .saturating_mul(self.heartbeat_miss_threshold.max(1))
        })
    }
}

impl BackendConfig {
    /// URL the WebSocket transport dials.
    #[must_use]
    pub fn ws_url(&self) -> String {
        if self.url.is_empty() {
            format!("ws://{}:{}/ws", self.host, self.port)
        } else {
            self.url.clone()
        }
    }
}

impl ChunkingConfig {
    /// Fragment size limit; validated configurations are never zero.
    #[must_use]
    pub fn max_fragment_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_fragment_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Reassembly size limit; validated configurations are never zero.
    #[must_use]
    pub fn max_message_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_message_size).unwrap_or(NonZeroUsize::MIN)
    }
}
