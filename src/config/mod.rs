//! Application configuration.
//!
//! Loaded from YAML files and `STACKIO__`-prefixed environment variables, and
//! turned into [`EngineOptions`] for constructing an engine.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::DEFAULT_ENDPOINT;
use crate::interfaces::transport::TransportKind;
use crate::transport::QueueConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "stackio.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STACKIO_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STACKIO";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STACKIO_LOG";

/// Default name of the push/pull channel carrying RPC replies.
pub const DEFAULT_REPLY_CHANNEL: &str = "rpc_response_channel";
/// Default idle time after which an unanswered call stops listening.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delivery semantic and broker endpoint.
    pub engine: EngineConfig,
    /// Push/pull queue limits.
    pub queue: QueueConfig,
    /// RPC reply handling.
    pub rpc: RpcConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base transport type (`pub/sub` or `push/pull`).
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// Broker endpoint (`scheme://[auth@]host:port`, or a bare scheme).
    pub transport: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::PubSub,
            transport: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// RPC configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Idle time after which a pending call stops listening for replies.
    #[serde(rename = "reply_timeout_secs", with = "duration_secs")]
    pub reply_timeout: Duration,
    /// Push/pull channel carrying replies.
    pub reply_channel: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            reply_channel: DEFAULT_REPLY_CHANNEL.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `stackio.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Engine construction options described by this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            kind: self.engine.kind,
            transport: self.engine.transport.clone(),
            queue: self.queue.clone(),
            rpc: self.rpc.clone(),
        }
    }
}

/// Options for constructing an [`Engine`](crate::rpc::Engine).
///
/// Defaults to pub/sub over the local Redis broker with the standard queue
/// limits and reply settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub kind: TransportKind,
    pub transport: String,
    pub queue: QueueConfig,
    pub rpc: RpcConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Config::default().engine_options()
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = transport.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.rpc.reply_timeout = timeout;
        self
    }

    pub fn with_reply_channel(mut self, channel: impl Into<String>) -> Self {
        self.rpc.reply_channel = channel.into();
        self
    }
}

/// Serde adapter for durations written as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
