use serde::Deserialize;
use std::path::PathBuf;

use super::ConfigError;
use crate::core::realtime::ToolDefinition;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     cert_path: "/etc/voxrelay/cert.pem"
///     key_path: "/etc/voxrelay/key.pem"
///
/// providers:
///   openai_api_key: "sk-..."
///
/// realtime:
///   model: "gpt-4o-realtime-preview"
///   voice: "alloy"
///   enabled: true
///   vad:
///     enabled: true
///     threshold: 0.5
///     prefix_padding_ms: 300
///     silence_duration_ms: 500
///   idle_economy:
///     enabled: false
///     delay_ms: 30000
///
/// fallback:
///   mode: "chat"
///   chat_model: "gpt-4o-mini"
///
/// tools:
///   endpoint: "http://localhost:8080/tools/execute"
///   definitions:
///     - name: "lookup_listing"
///       description: "Find a property listing"
///       parameters: { "type": "object" }
///
/// security:
///   cors_allowed_origins: "https://example.com"
///   max_connections: 1000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub providers: Option<ProvidersYaml>,
    pub realtime: Option<RealtimeYaml>,
    pub fallback: Option<FallbackYaml>,
    pub tools: Option<ToolsYaml>,
    pub security: Option<SecurityYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Provider credentials from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    /// Credential for the upstream realtime API and the fallback REST calls
    pub openai_api_key: Option<String>,
}

/// Upstream realtime settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub url: Option<String>,
    pub path: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub temperature: Option<f32>,
    pub instructions: Option<String>,
    pub enabled: Option<bool>,
    pub vad: Option<VadYaml>,
    pub transcription_model: Option<String>,
    pub input_audio_format: Option<String>,
    pub sample_rate: Option<u32>,
    pub idle_economy: Option<IdleEconomyYaml>,
    pub barge_in_grace_ms: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

/// Server VAD settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VadYaml {
    pub enabled: Option<bool>,
    /// Speech probability threshold (0.0 - 1.0)
    pub threshold: Option<f32>,
    pub prefix_padding_ms: Option<u32>,
    pub silence_duration_ms: Option<u32>,
    pub create_response: Option<bool>,
    pub interrupt_response: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IdleEconomyYaml {
    pub enabled: Option<bool>,
    pub delay_ms: Option<u64>,
}

/// Fallback collaborator settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FallbackYaml {
    pub api_url: Option<String>,
    pub chat_model: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub stt_model: Option<String>,
    pub min_transcript_chars: Option<usize>,
    /// "chat" or "assistant"
    pub mode: Option<String>,
    pub assistant_id: Option<String>,
    pub run_poll_interval_ms: Option<u64>,
    pub run_poll_max_attempts: Option<u32>,
}

/// Tool executor settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsYaml {
    pub endpoint: Option<String>,
    pub timeout_secs: Option<u64>,
    pub definitions: Option<Vec<ToolDefinition>>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP address
    pub rate_limit_requests_per_second: Option<u32>,
    /// Maximum burst size for rate limiting
    pub rate_limit_burst_size: Option<u32>,
    /// Maximum concurrent realtime connections
    pub max_connections: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Parse YAML content. An empty document is an empty configuration.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }
}
