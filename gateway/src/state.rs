//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{FallbackMode, ServerConfig};
use crate::core::fallback::{
    AssistantRunCompleter, FallbackServices, OpenAIRestClient, RestClientConfig, RunPollerConfig,
    TextCompleter,
};
use crate::core::realtime::openai::audio_modalities;
use crate::core::realtime::{OpenAIRealtimeConnector, RealtimeConnector, SessionParams};
use crate::core::tools::{HttpToolExecutor, NoopToolExecutor, ToolExecutor};
use crate::session::{ConnectionRegistry, SessionSettings};

/// Request timeout for fallback REST calls.
const FALLBACK_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by every route.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub connector: Arc<dyn RealtimeConnector>,
    pub tools: Arc<dyn ToolExecutor>,
    /// `None` when no credential is configured
    pub fallback: Option<FallbackServices>,
}

impl AppState {
    /// Build production collaborators from configuration.
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let tools: Arc<dyn ToolExecutor> = match &config.tools.endpoint {
            Some(endpoint) => {
                info!(endpoint = %endpoint, tools = config.tools.definitions.len(), "HTTP tool executor enabled");
                Arc::new(
                    HttpToolExecutor::new(
                        endpoint.clone(),
                        Duration::from_secs(config.tools.timeout_secs.max(1)),
                        config.tools.definitions.clone(),
                    )
                    .context("Failed to create tool executor")?,
                )
            }
            None => {
                if !config.tools.definitions.is_empty() {
                    warn!("Tool definitions configured without TOOLS_ENDPOINT, tools disabled");
                }
                Arc::new(NoopToolExecutor)
            }
        };

        let fallback = build_fallback(&config)?;
        if fallback.is_none() {
            warn!("OPENAI_API_KEY not set, fallback replies disabled");
        }

        Ok(Self::with_parts(
            config,
            Arc::new(OpenAIRealtimeConnector),
            tools,
            fallback,
        ))
    }

    /// Assemble state from explicit collaborators.
    pub fn with_parts(
        config: ServerConfig,
        connector: Arc<dyn RealtimeConnector>,
        tools: Arc<dyn ToolExecutor>,
        fallback: Option<FallbackServices>,
    ) -> Arc<Self> {
        let registry = ConnectionRegistry::new(config.max_realtime_connections);
        Arc::new(Self {
            config,
            registry,
            connector,
            tools,
            fallback,
        })
    }

    /// Handshake parameters for a new upstream session.
    pub fn session_params(&self) -> SessionParams {
        let rt = &self.config.realtime;
        let mut vad = rt.vad.clone();
        if !rt.enabled {
            // The anticipatory fallback answers instead.
            vad.create_response = false;
        }

        SessionParams {
            url: rt.url.clone(),
            api_key: self.config.openai_api_key.clone().unwrap_or_default(),
            model: rt.model.clone(),
            voice: rt.voice.clone(),
            temperature: rt.temperature,
            instructions: rt.instructions.clone(),
            modalities: audio_modalities(),
            vad,
            transcription_model: rt.transcription_model.clone(),
            audio_format: rt.input_audio_format.clone(),
            tools: self.tools.definitions(),
            connect_timeout: rt.connect_timeout(),
        }
    }

    /// Per-connection behaviour derived from configuration.
    pub fn session_settings(&self) -> SessionSettings {
        let rt = &self.config.realtime;
        SessionSettings {
            server_vad_enabled: rt.vad.enabled,
            realtime_enabled: rt.enabled,
            barge_in_grace: Duration::from_millis(rt.barge_in_grace_ms),
            idle_economy: rt.idle_economy(),
            min_transcript_chars: self.config.fallback.min_transcript_chars,
            sample_rate: rt.sample_rate,
        }
    }
}

fn build_fallback(config: &ServerConfig) -> anyhow::Result<Option<FallbackServices>> {
    let Some(api_key) = config.openai_api_key.clone() else {
        return Ok(None);
    };
    let fb = &config.fallback;

    let rest = Arc::new(
        OpenAIRestClient::new(RestClientConfig {
            base_url: fb.api_url.clone(),
            api_key: api_key.clone(),
            chat_model: fb.chat_model.clone(),
            tts_model: fb.tts_model.clone(),
            tts_voice: fb.tts_voice.clone(),
            stt_model: fb.stt_model.clone(),
            instructions: config.realtime.instructions.clone(),
            timeout: FALLBACK_REQUEST_TIMEOUT,
        })
        .context("Failed to create fallback REST client")?,
    );

    let completer: Arc<dyn TextCompleter> = match fb.mode {
        FallbackMode::Chat => rest.clone(),
        FallbackMode::Assistant => {
            let assistant_id = fb
                .assistant_id
                .clone()
                .context("fallback mode 'assistant' requires ASSISTANT_ID")?;
            Arc::new(
                AssistantRunCompleter::new(RunPollerConfig {
                    base_url: fb.api_url.clone(),
                    api_key,
                    assistant_id,
                    poll_interval: Duration::from_millis(fb.run_poll_interval_ms),
                    max_attempts: fb.run_poll_max_attempts,
                    request_timeout: FALLBACK_REQUEST_TIMEOUT,
                })
                .context("Failed to create assistant run completer")?,
            )
        }
    };

    Ok(Some(FallbackServices {
        completer,
        synthesizer: rest.clone(),
        transcriber: rest,
    }))
}
