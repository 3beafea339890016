//! Configuration module for the VoxRelay gateway
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use voxrelay_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::realtime::openai::{DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_VOICE};
use crate::core::realtime::{
    OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, ToolDefinition, VadParams,
};

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Upstream realtime session settings
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Upstream WebSocket endpoint
    pub url: String,
    /// Path the client WebSocket is served on
    pub path: String,
    pub model: String,
    pub voice: String,
    pub temperature: f32,
    pub instructions: Option<String>,
    /// When false the upstream never answers on its own and the
    /// anticipatory fallback replies instead
    pub enabled: bool,
    pub vad: VadParams,
    pub transcription_model: String,
    pub input_audio_format: String,
    pub sample_rate: u32,
    pub idle_economy_enabled: bool,
    pub idle_economy_delay_ms: u64,
    pub barge_in_grace_ms: u64,
    pub keepalive_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: OPENAI_REALTIME_URL.to_string(),
            path: "/realtime".to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: DEFAULT_REALTIME_VOICE.to_string(),
            temperature: 0.8,
            instructions: None,
            enabled: true,
            vad: VadParams::default(),
            transcription_model: "whisper-1".to_string(),
            input_audio_format: "pcm16".to_string(),
            sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            idle_economy_enabled: false,
            idle_economy_delay_ms: 30_000,
            barge_in_grace_ms: 200,
            keepalive_interval_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Idle economy delay, or `None` when the feature is off.
    pub fn idle_economy(&self) -> Option<Duration> {
        self.idle_economy_enabled
            .then(|| Duration::from_millis(self.idle_economy_delay_ms))
    }
}

/// How fallback text replies are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    /// One-shot chat completion
    #[default]
    Chat,
    /// Message posted to the connection's thread, answered by a polled run
    Assistant,
}

impl std::str::FromStr for FallbackMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "assistant" => Ok(Self::Assistant),
            other => Err(ConfigError::InvalidValue {
                key: "FALLBACK_MODE".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// REST fallback collaborator settings
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    pub api_url: String,
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub stt_model: String,
    pub min_transcript_chars: usize,
    pub mode: FallbackMode,
    pub assistant_id: Option<String>,
    pub run_poll_interval_ms: u64,
    pub run_poll_max_attempts: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            stt_model: "whisper-1".to_string(),
            min_transcript_chars: 12,
            mode: FallbackMode::Chat,
            assistant_id: None,
            run_poll_interval_ms: 800,
            run_poll_max_attempts: 40,
        }
    }
}

/// Tool executor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ToolsConfig {
    /// HTTP endpoint receiving tool invocations; tools are disabled when unset
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    /// Schema advertised in the session handshake
    pub definitions: Vec<ToolDefinition>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
            definitions: Vec::new(),
        }
    }
}

/// Server configuration
///
/// Contains all configuration needed to run the gateway, including:
/// - Server settings (host, port, TLS)
/// - Upstream realtime session settings
/// - Fallback collaborator settings
/// - Tool executor settings
/// - Security settings (CORS, rate limiting, connection limits)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    /// Credential for the upstream session and the fallback REST calls
    pub openai_api_key: Option<String>,

    pub realtime: RealtimeConfig,
    pub fallback: FallbackConfig,
    pub tools: ToolsConfig,

    // Security settings
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (same-origin only)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,
    /// Maximum concurrent realtime connections
    /// Default: None (unlimited)
    pub max_realtime_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            openai_api_key: None,
            realtime: RealtimeConfig::default(),
            fallback: FallbackConfig::default(),
            tools: ToolsConfig::default(),
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_realtime_connections: None,
        }
    }
}

/// Zeroize the credential when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables and defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = env::from_env()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values (loaded in main)
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        let mut config = env::from_env()?;
        merge::apply_yaml(&mut config, yaml_config)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}
