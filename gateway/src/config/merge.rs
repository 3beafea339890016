//! Applying YAML overrides on top of the environment-derived configuration.

use std::path::PathBuf;

use super::yaml::{FallbackYaml, RealtimeYaml, SecurityYaml, ToolsYaml, YamlConfig};
use super::{ConfigError, FallbackConfig, RealtimeConfig, ServerConfig, TlsConfig, ToolsConfig};

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Overwrite every field the YAML document sets.
pub(super) fn apply_yaml(config: &mut ServerConfig, yaml: YamlConfig) -> Result<(), ConfigError> {
    if let Some(server) = yaml.server {
        set(&mut config.host, server.host);
        set(&mut config.port, server.port);

        if let Some(tls) = server.tls {
            if tls.enabled == Some(false) {
                config.tls = None;
            } else if let (Some(cert), Some(key)) = (tls.cert_path, tls.key_path) {
                config.tls = Some(TlsConfig {
                    cert_path: PathBuf::from(cert),
                    key_path: PathBuf::from(key),
                });
            } else if tls.enabled == Some(true) {
                return Err(ConfigError::Validation(
                    "TLS enabled but cert_path or key_path is missing".to_string(),
                ));
            }
        }
    }

    if let Some(key) = yaml.providers.and_then(|p| p.openai_api_key) {
        config.openai_api_key = Some(key);
    }
    if let Some(realtime) = yaml.realtime {
        apply_realtime(&mut config.realtime, realtime);
    }
    if let Some(fallback) = yaml.fallback {
        apply_fallback(&mut config.fallback, fallback)?;
    }
    if let Some(tools) = yaml.tools {
        apply_tools(&mut config.tools, tools);
    }
    if let Some(security) = yaml.security {
        apply_security(config, security);
    }
    Ok(())
}

fn apply_realtime(rt: &mut RealtimeConfig, yaml: RealtimeYaml) {
    set(&mut rt.url, yaml.url);
    set(&mut rt.path, yaml.path);
    set(&mut rt.model, yaml.model);
    set(&mut rt.voice, yaml.voice);
    set(&mut rt.temperature, yaml.temperature);
    if yaml.instructions.is_some() {
        rt.instructions = yaml.instructions;
    }
    set(&mut rt.enabled, yaml.enabled);

    if let Some(vad) = yaml.vad {
        set(&mut rt.vad.enabled, vad.enabled);
        set(&mut rt.vad.threshold, vad.threshold);
        set(&mut rt.vad.prefix_padding_ms, vad.prefix_padding_ms);
        set(&mut rt.vad.silence_duration_ms, vad.silence_duration_ms);
        set(&mut rt.vad.create_response, vad.create_response);
        set(&mut rt.vad.interrupt_response, vad.interrupt_response);
    }

    set(&mut rt.transcription_model, yaml.transcription_model);
    set(&mut rt.input_audio_format, yaml.input_audio_format);
    set(&mut rt.sample_rate, yaml.sample_rate);
    if let Some(idle) = yaml.idle_economy {
        set(&mut rt.idle_economy_enabled, idle.enabled);
        set(&mut rt.idle_economy_delay_ms, idle.delay_ms);
    }
    set(&mut rt.barge_in_grace_ms, yaml.barge_in_grace_ms);
    set(&mut rt.keepalive_interval_secs, yaml.keepalive_interval_secs);
    set(&mut rt.connect_timeout_secs, yaml.connect_timeout_secs);
}

fn apply_fallback(fb: &mut FallbackConfig, yaml: FallbackYaml) -> Result<(), ConfigError> {
    set(&mut fb.api_url, yaml.api_url);
    set(&mut fb.chat_model, yaml.chat_model);
    set(&mut fb.tts_model, yaml.tts_model);
    set(&mut fb.tts_voice, yaml.tts_voice);
    set(&mut fb.stt_model, yaml.stt_model);
    set(&mut fb.min_transcript_chars, yaml.min_transcript_chars);
    if let Some(mode) = yaml.mode {
        fb.mode = mode.parse()?;
    }
    if yaml.assistant_id.is_some() {
        fb.assistant_id = yaml.assistant_id;
    }
    set(&mut fb.run_poll_interval_ms, yaml.run_poll_interval_ms);
    set(&mut fb.run_poll_max_attempts, yaml.run_poll_max_attempts);
    Ok(())
}

fn apply_tools(tools: &mut ToolsConfig, yaml: ToolsYaml) {
    if yaml.endpoint.is_some() {
        tools.endpoint = yaml.endpoint;
    }
    set(&mut tools.timeout_secs, yaml.timeout_secs);
    set(&mut tools.definitions, yaml.definitions);
}

fn apply_security(config: &mut ServerConfig, yaml: SecurityYaml) {
    if yaml.cors_allowed_origins.is_some() {
        config.cors_allowed_origins = yaml.cors_allowed_origins;
    }
    set(
        &mut config.rate_limit_requests_per_second,
        yaml.rate_limit_requests_per_second,
    );
    set(&mut config.rate_limit_burst_size, yaml.rate_limit_burst_size);
    if yaml.max_connections.is_some() {
        config.max_realtime_connections = yaml.max_connections;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackMode;

    #[test]
    fn test_unset_yaml_fields_keep_base_values() {
        let mut config = ServerConfig::default();
        config.port = 4000;
        config.realtime.voice = "shimmer".to_string();

        let yaml = YamlConfig::from_str("realtime:\n  model: \"m2\"\n").unwrap();
        apply_yaml(&mut config, yaml).unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.realtime.voice, "shimmer");
        assert_eq!(config.realtime.model, "m2");
    }

    #[test]
    fn test_tls_requires_both_paths() {
        let mut config = ServerConfig::default();
        let yaml = YamlConfig::from_str("server:\n  tls:\n    enabled: true\n    cert_path: \"/c.pem\"\n").unwrap();
        assert!(apply_yaml(&mut config, yaml).is_err());

        let yaml = YamlConfig::from_str(
            "server:\n  tls:\n    cert_path: \"/c.pem\"\n    key_path: \"/k.pem\"\n",
        )
        .unwrap();
        apply_yaml(&mut config, yaml).unwrap();
        assert!(config.is_tls_enabled());

        let yaml = YamlConfig::from_str("server:\n  tls:\n    enabled: false\n").unwrap();
        apply_yaml(&mut config, yaml).unwrap();
        assert!(!config.is_tls_enabled());
    }

    #[test]
    fn test_fallback_mode_from_yaml() {
        let mut config = ServerConfig::default();
        let yaml = YamlConfig::from_str("fallback:\n  mode: Assistant\n  assistant_id: a1\n").unwrap();
        apply_yaml(&mut config, yaml).unwrap();
        assert_eq!(config.fallback.mode, FallbackMode::Assistant);

        let yaml = YamlConfig::from_str("fallback:\n  mode: psychic\n").unwrap();
        assert!(apply_yaml(&mut config, yaml).is_err());
    }
}
