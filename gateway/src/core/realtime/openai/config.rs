//! Upstream realtime endpoint constants and small value types.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::realtime::base::{RealtimeError, RealtimeResult};

/// Default upstream realtime WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Sample rate of PCM16 audio on the upstream session.
pub const OPENAI_REALTIME_SAMPLE_RATE: u32 = 24000;

/// Default model when none is configured.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Default voice when none is configured.
pub const DEFAULT_REALTIME_VOICE: &str = "alloy";

// =============================================================================
// Modalities
// =============================================================================

/// Output modality of an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }
}

/// Modalities used while the session is in audio+text mode.
pub fn audio_modalities() -> Vec<String> {
    vec![Modality::Text.as_str().to_string(), Modality::Audio.as_str().to_string()]
}

/// Modalities used while the session is in text-only mode.
pub fn text_modalities() -> Vec<String> {
    vec![Modality::Text.as_str().to_string()]
}

/// Build the upstream URL with the `model` query parameter.
pub fn build_realtime_url(base: &str, model: &str) -> RealtimeResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| RealtimeError::InvalidConfiguration(format!("invalid realtime url: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "realtime url must use ws or wss, got {other}"
            )));
        }
    }
    url.query_pairs_mut().append_pair("model", model);
    Ok(url)
}
