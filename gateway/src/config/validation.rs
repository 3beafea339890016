//! Configuration validation logic.

use super::{ConfigError, FallbackMode, ServerConfig};

pub(super) fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    let rt = &config.realtime;

    if rt.sample_rate == 0 {
        return Err(ConfigError::Validation("sample rate must be greater than 0".to_string()));
    }
    if !(0.0..=1.0).contains(&rt.vad.threshold) {
        return Err(ConfigError::Validation(format!(
            "VAD threshold must be between 0.0 and 1.0, got {}",
            rt.vad.threshold
        )));
    }
    if !rt.path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "realtime path must start with '/', got {}",
            rt.path
        )));
    }
    if !(rt.url.starts_with("ws://") || rt.url.starts_with("wss://")) {
        return Err(ConfigError::Validation(format!(
            "realtime url must use ws:// or wss://, got {}",
            rt.url
        )));
    }

    if config.fallback.mode == FallbackMode::Assistant && config.fallback.assistant_id.is_none() {
        return Err(ConfigError::Validation(
            "fallback mode 'assistant' requires ASSISTANT_ID".to_string(),
        ));
    }

    if let Some(tls) = &config.tls
        && (tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty())
    {
        return Err(ConfigError::Validation(
            "TLS requires both a certificate and a key path".to_string(),
        ));
    }

    if config.max_realtime_connections == Some(0) {
        return Err(ConfigError::Validation(
            "max realtime connections must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.realtime.sample_rate = 0;
        assert!(validate(&config).is_err());

        let mut config = ServerConfig::default();
        config.realtime.url = "https://api.example.com".to_string();
        assert!(validate(&config).is_err());

        let mut config = ServerConfig::default();
        config.realtime.path = "realtime".to_string();
        assert!(validate(&config).is_err());

        let mut config = ServerConfig::default();
        config.max_realtime_connections = Some(0);
        assert!(validate(&config).is_err());
    }
}
