//! Environment variable loading.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ConfigError, FallbackConfig, RealtimeConfig, ServerConfig, TlsConfig, ToolsConfig};

/// Non-empty value of `key`.
pub(super) fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub(super) fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Accepts true/false, 1/0, yes/no, on/off.
pub(super) fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        },
    }
}

/// Build a configuration from defaults overlaid with environment variables.
pub(super) fn from_env() -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    if let Some(host) = env_string("HOST") {
        config.host = host;
    }
    if let Some(port) = env_parse("PORT")? {
        config.port = port;
    }
    if let (Some(cert), Some(key)) = (env_string("TLS_CERT_PATH"), env_string("TLS_KEY_PATH")) {
        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        });
    }
    config.openai_api_key = env_string("OPENAI_API_KEY");

    realtime_from_env(&mut config.realtime)?;
    fallback_from_env(&mut config.fallback)?;
    tools_from_env(&mut config.tools)?;

    config.cors_allowed_origins = env_string("CORS_ALLOWED_ORIGINS");
    if let Some(rps) = env_parse("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = env_parse("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    config.max_realtime_connections = env_parse("MAX_REALTIME_CONNECTIONS")?;

    Ok(config)
}

fn realtime_from_env(rt: &mut RealtimeConfig) -> Result<(), ConfigError> {
    if let Some(v) = env_string("REALTIME_URL") {
        rt.url = v;
    }
    if let Some(v) = env_string("REALTIME_PATH") {
        rt.path = v;
    }
    if let Some(v) = env_string("REALTIME_MODEL") {
        rt.model = v;
    }
    if let Some(v) = env_string("REALTIME_VOICE") {
        rt.voice = v;
    }
    if let Some(v) = env_parse("REALTIME_TEMPERATURE")? {
        rt.temperature = v;
    }
    if let Some(v) = env_string("REALTIME_INSTRUCTIONS") {
        rt.instructions = Some(v);
    }
    if let Some(v) = env_bool("REALTIME_ENABLED")? {
        rt.enabled = v;
    }

    if let Some(v) = env_bool("SERVER_VAD_ENABLED")? {
        rt.vad.enabled = v;
    }
    if let Some(v) = env_parse("VAD_THRESHOLD")? {
        rt.vad.threshold = v;
    }
    if let Some(v) = env_parse("VAD_PREFIX_PADDING_MS")? {
        rt.vad.prefix_padding_ms = v;
    }
    if let Some(v) = env_parse("VAD_SILENCE_DURATION_MS")? {
        rt.vad.silence_duration_ms = v;
    }
    if let Some(v) = env_bool("VAD_CREATE_RESPONSE")? {
        rt.vad.create_response = v;
    }
    if let Some(v) = env_bool("VAD_INTERRUPT_RESPONSE")? {
        rt.vad.interrupt_response = v;
    }

    if let Some(v) = env_string("TRANSCRIPTION_MODEL") {
        rt.transcription_model = v;
    }
    if let Some(v) = env_string("INPUT_AUDIO_FORMAT") {
        rt.input_audio_format = v;
    }
    if let Some(v) = env_parse("SAMPLE_RATE")? {
        rt.sample_rate = v;
    }
    if let Some(v) = env_bool("IDLE_ECONOMY_ENABLED")? {
        rt.idle_economy_enabled = v;
    }
    if let Some(v) = env_parse("IDLE_ECONOMY_DELAY_MS")? {
        rt.idle_economy_delay_ms = v;
    }
    if let Some(v) = env_parse("BARGE_IN_GRACE_MS")? {
        rt.barge_in_grace_ms = v;
    }
    if let Some(v) = env_parse("KEEPALIVE_INTERVAL_SECS")? {
        rt.keepalive_interval_secs = v;
    }
    if let Some(v) = env_parse("CONNECT_TIMEOUT_SECS")? {
        rt.connect_timeout_secs = v;
    }
    Ok(())
}

fn fallback_from_env(fb: &mut FallbackConfig) -> Result<(), ConfigError> {
    if let Some(v) = env_string("FALLBACK_API_URL") {
        fb.api_url = v;
    }
    if let Some(v) = env_string("FALLBACK_CHAT_MODEL") {
        fb.chat_model = v;
    }
    if let Some(v) = env_string("FALLBACK_TTS_MODEL") {
        fb.tts_model = v;
    }
    if let Some(v) = env_string("FALLBACK_TTS_VOICE") {
        fb.tts_voice = v;
    }
    if let Some(v) = env_string("FALLBACK_STT_MODEL") {
        fb.stt_model = v;
    }
    if let Some(v) = env_parse("FALLBACK_MIN_TRANSCRIPT_CHARS")? {
        fb.min_transcript_chars = v;
    }
    if let Some(v) = env_parse("FALLBACK_MODE")? {
        fb.mode = v;
    }
    if let Some(v) = env_string("ASSISTANT_ID") {
        fb.assistant_id = Some(v);
    }
    if let Some(v) = env_parse("RUN_POLL_INTERVAL_MS")? {
        fb.run_poll_interval_ms = v;
    }
    if let Some(v) = env_parse("RUN_POLL_MAX_ATTEMPTS")? {
        fb.run_poll_max_attempts = v;
    }
    Ok(())
}

fn tools_from_env(tools: &mut ToolsConfig) -> Result<(), ConfigError> {
    if let Some(v) = env_string("TOOLS_ENDPOINT") {
        tools.endpoint = Some(v);
    }
    if let Some(v) = env_parse("TOOLS_TIMEOUT_SECS")? {
        tools.timeout_secs = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_bool_variants() {
        for (raw, expected) in [("true", true), ("1", true), ("On", true), ("no", false), ("0", false)] {
            unsafe {
                env::set_var("VOXRELAY_TEST_BOOL", raw);
            }
            assert_eq!(env_bool("VOXRELAY_TEST_BOOL").unwrap(), Some(expected), "{raw}");
        }

        unsafe {
            env::set_var("VOXRELAY_TEST_BOOL", "maybe");
        }
        assert!(env_bool("VOXRELAY_TEST_BOOL").is_err());

        unsafe {
            env::set_var("VOXRELAY_TEST_BOOL", "  ");
        }
        assert_eq!(env_bool("VOXRELAY_TEST_BOOL").unwrap(), None);

        unsafe {
            env::remove_var("VOXRELAY_TEST_BOOL");
        }
    }

    #[test]
    #[serial]
    fn test_fallback_mode_parse_error_names_key() {
        unsafe {
            env::set_var("FALLBACK_MODE", "oracle");
        }
        let mut fb = FallbackConfig::default();
        let err = fallback_from_env(&mut fb).unwrap_err();
        assert!(err.to_string().contains("FALLBACK_MODE"));
        unsafe {
            env::remove_var("FALLBACK_MODE");
        }
    }
}
