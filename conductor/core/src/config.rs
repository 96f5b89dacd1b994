//! TOML Configuration File Support
//!
//! Centralized configuration for the conductor, loaded from
//! `~/.config/teehee/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon)
//! 2. Environment variables (`TEEHEE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [streaming]
//! checkpoint_every_tokens = 16
//! checkpoint_interval_ms = 500
//! stall_timeout_secs = 60
//! abort_grace_ms = 5000
//! subscriber_buffer = 256
//! registry_grace_secs = 30
//! max_retries = 2
//! retry_backoff_ms = 250
//! poll_max_events = 64
//!
//! [generation]
//! max_tokens = 4096
//! temperature = 0.7
//! request_timeout_secs = 300
//!
//! [providers]
//! openai_base_url = "https://api.openai.com/v1"
//! anthropic_base_url = "https://api.anthropic.com/v1"
//! mistral_base_url = "https://api.mistral.ai/v1"
//!
//! [server]
//! listen_addr = "127.0.0.1:8765"
//! max_connections = 100
//! connection_channel_capacity = 256
//! drain_grace_ms = 2000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderEndpoints;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Stream session, delivery, and registry tuning
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingConfig {
    /// Checkpoint after this many tokens
    pub checkpoint_every_tokens: u32,
    /// Checkpoint after this much time, whichever comes first
    pub checkpoint_interval: Duration,
    /// Fail a session that sees no provider event for this long
    pub stall_timeout: Duration,
    /// How long `abort` waits for the session to reach a terminal state
    pub abort_grace: Duration,
    /// Live events buffered per subscriber before it is marked lagged
    pub subscriber_buffer: usize,
    /// How long a terminal session waits for its subscribers to detach
    pub registry_grace: Duration,
    /// Reopen attempts for retryable provider errors
    pub max_retries: u32,
    /// Base delay between reopen attempts, doubled each time
    pub retry_backoff: Duration,
    /// Upper bound on events returned by one poll
    pub poll_max_events: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_tokens: 16,
            checkpoint_interval: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(60),
            abort_grace: Duration::from_secs(5),
            subscriber_buffer: 256,
            registry_grace: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            poll_max_events: 64,
        }
    }
}

/// Default generation parameters sent to providers
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    /// Maximum tokens per reply
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Daemon listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address the WebSocket listener binds to
    pub listen_addr: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Outbound messages buffered per connection
    pub connection_channel_capacity: usize,
    /// How long a closing connection may spend flushing its streams
    pub drain_grace: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            max_connections: 100,
            connection_channel_capacity: 256,
            drain_grace: Duration::from_secs(2),
        }
    }
}

/// Fully resolved conductor configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Streaming tuning
    pub streaming: StreamingConfig,
    /// Generation defaults
    pub generation: GenerationConfig,
    /// Provider endpoints
    pub providers: ProviderEndpoints,
    /// Daemon listener
    pub server: ServerSettings,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            generation: GenerationConfig::default(),
            providers: ProviderEndpoints::default(),
            server: ServerSettings::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl EngineConfig {
    /// Defaults with the given streaming tuning
    #[must_use]
    pub fn with_streaming(streaming: StreamingConfig) -> Self {
        Self {
            streaming,
            ..Self::default()
        }
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.streaming;
        if s.checkpoint_every_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "checkpoint_every_tokens must be at least 1".into(),
            ));
        }
        if s.checkpoint_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "checkpoint_interval_ms must be positive".into(),
            ));
        }
        if s.stall_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "stall_timeout_secs must be positive".into(),
            ));
        }
        if s.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "subscriber_buffer must be at least 1".into(),
            ));
        }
        if s.poll_max_events == 0 {
            return Err(ConfigError::ValidationError(
                "poll_max_events must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "temperature {} is outside 0.0..=2.0",
                self.generation.temperature
            )));
        }
        if self.generation.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "max_tokens must be at least 1".into(),
            ));
        }
        if self.server.connection_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "connection_channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Checkpoint after this many tokens
    pub checkpoint_every_tokens: Option<u32>,
    /// Checkpoint after this many milliseconds
    pub checkpoint_interval_ms: Option<u64>,
    /// Stall window in seconds
    pub stall_timeout_secs: Option<u64>,
    /// Abort grace period in milliseconds
    pub abort_grace_ms: Option<u64>,
    /// Per-subscriber live buffer
    pub subscriber_buffer: Option<usize>,
    /// Registry retention after termination, in seconds
    pub registry_grace_secs: Option<u64>,
    /// Reopen attempts for retryable provider errors
    pub max_retries: Option<u32>,
    /// Base retry delay in milliseconds
    pub retry_backoff_ms: Option<u64>,
    /// Upper bound on events per poll
    pub poll_max_events: Option<usize>,
}

/// Generation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Maximum tokens per reply
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on one provider request, in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Providers section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersToml {
    /// OpenAI API base URL
    pub openai_base_url: Option<String>,
    /// Anthropic API base URL
    pub anthropic_base_url: Option<String>,
    /// Mistral API base URL
    pub mistral_base_url: Option<String>,
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listener address
    pub listen_addr: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Outbound buffer per connection
    pub connection_channel_capacity: Option<usize>,
    /// Drain grace in milliseconds
    pub drain_grace_ms: Option<u64>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Streaming settings
    pub streaming: StreamingToml,
    /// Generation settings
    pub generation: GenerationToml,
    /// Provider settings
    pub providers: ProvidersToml,
    /// Server settings
    pub server: ServerToml,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/teehee/conductor.toml` or
/// `~/.config/teehee/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("teehee").join("conductor.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting configuration is invalid.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error; defaults and environment variables are
/// used instead.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the
/// resulting configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut EngineConfig, toml: &ConductorToml) {
    let s = &toml.streaming;
    if let Some(n) = s.checkpoint_every_tokens {
        config.streaming.checkpoint_every_tokens = n;
    }
    if let Some(ms) = s.checkpoint_interval_ms {
        config.streaming.checkpoint_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = s.stall_timeout_secs {
        config.streaming.stall_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = s.abort_grace_ms {
        config.streaming.abort_grace = Duration::from_millis(ms);
    }
    if let Some(n) = s.subscriber_buffer {
        config.streaming.subscriber_buffer = n;
    }
    if let Some(secs) = s.registry_grace_secs {
        config.streaming.registry_grace = Duration::from_secs(secs);
    }
    if let Some(n) = s.max_retries {
        config.streaming.max_retries = n;
    }
    if let Some(ms) = s.retry_backoff_ms {
        config.streaming.retry_backoff = Duration::from_millis(ms);
    }
    if let Some(n) = s.poll_max_events {
        config.streaming.poll_max_events = n;
    }

    let g = &toml.generation;
    if let Some(n) = g.max_tokens {
        config.generation.max_tokens = n;
    }
    if let Some(t) = g.temperature {
        config.generation.temperature = t;
    }
    if let Some(secs) = g.request_timeout_secs {
        config.providers.request_timeout = Duration::from_secs(secs);
    }

    let p = &toml.providers;
    if let Some(url) = &p.openai_base_url {
        config.providers.openai_base_url.clone_from(url);
    }
    if let Some(url) = &p.anthropic_base_url {
        config.providers.anthropic_base_url.clone_from(url);
    }
    if let Some(url) = &p.mistral_base_url {
        config.providers.mistral_base_url.clone_from(url);
    }

    let srv = &toml.server;
    if let Some(addr) = &srv.listen_addr {
        config.server.listen_addr.clone_from(addr);
    }
    if let Some(n) = srv.max_connections {
        config.server.max_connections = n;
    }
    if let Some(n) = srv.connection_channel_capacity {
        config.server.connection_channel_capacity = n;
    }
    if let Some(ms) = srv.drain_grace_ms {
        config.server.drain_grace = Duration::from_millis(ms);
    }
}

/// Parse an environment variable, ignoring unparseable values
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut EngineConfig) {
    let before = config.clone();

    if let Some(addr) = env_parse::<String>("TEEHEE_LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    if let Some(n) = env_parse("TEEHEE_MAX_CONNECTIONS") {
        config.server.max_connections = n;
    }
    if let Some(n) = env_parse("TEEHEE_CHECKPOINT_EVERY_TOKENS") {
        config.streaming.checkpoint_every_tokens = n;
    }
    if let Some(ms) = env_parse("TEEHEE_CHECKPOINT_INTERVAL_MS") {
        config.streaming.checkpoint_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = env_parse("TEEHEE_STALL_TIMEOUT_SECS") {
        config.streaming.stall_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = env_parse("TEEHEE_ABORT_GRACE_MS") {
        config.streaming.abort_grace = Duration::from_millis(ms);
    }
    if let Some(n) = env_parse("TEEHEE_SUBSCRIBER_BUFFER") {
        config.streaming.subscriber_buffer = n;
    }
    if let Some(n) = env_parse("TEEHEE_MAX_RETRIES") {
        config.streaming.max_retries = n;
    }
    if let Some(n) = env_parse("TEEHEE_MAX_TOKENS") {
        config.generation.max_tokens = n;
    }
    if let Some(t) = env_parse("TEEHEE_TEMPERATURE") {
        config.generation.temperature = t;
    }
    if let Some(url) = env_parse::<String>("TEEHEE_OPENAI_BASE_URL") {
        config.providers.openai_base_url = url;
    }
    if let Some(url) = env_parse::<String>("TEEHEE_ANTHROPIC_BASE_URL") {
        config.providers.anthropic_base_url = url;
    }
    if let Some(url) = env_parse::<String>("TEEHEE_MISTRAL_BASE_URL") {
        config.providers.mistral_base_url = url;
    }

    if config.streaming != before.streaming
        || config.generation != before.generation
        || config.providers != before.providers
        || config.server != before.server
    {
        config.source = ConfigSource::Env;
    }
}
