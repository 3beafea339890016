//! External collaborators for the non-streaming fallback path.
//!
//! When the realtime upstream cannot answer, the gateway falls back to three
//! plain request/response services: a text completer, a speech synthesizer
//! and a transcriber. They are trait objects so the session layer can be
//! exercised without network access.

mod openai;
mod run_poller;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::audio::AudioError;

pub use openai::{OpenAIRestClient, RestClientConfig};
pub use run_poller::{AssistantRunCompleter, RunPollerConfig};

/// Errors raised by fallback collaborators.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// Request could not be sent or its body could not be read
    #[error("Network error: {0}")]
    Network(String),

    /// Credential rejected by the provider
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Provider answered with a non-success status
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider answered with something we could not interpret
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Missing or invalid settings for the requested operation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A polled run ended in a terminal non-success state
    #[error("Run {run_id} ended with status {status}")]
    RunTerminal { run_id: String, status: String },

    /// A polled run did not finish within its attempt budget
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

pub type FallbackResult<T> = Result<T, FallbackError>;

/// Prompt for a one-shot text reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub user_id: String,
    /// Upstream conversation binding, required by thread-based completers
    pub thread_id: Option<String>,
    pub prompt: String,
}

/// Synthesized speech as raw PCM16 little-endian mono.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedSpeech {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

/// Generates a text reply from a prompt.
#[async_trait]
pub trait TextCompleter: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> FallbackResult<String>;
}

/// Turns text into speech audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> FallbackResult<SynthesizedSpeech>;
}

/// Recognizes speech from a WAV container.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> FallbackResult<String>;
}

/// The fallback collaborators a connection needs, bundled for sharing.
#[derive(Clone)]
pub struct FallbackServices {
    pub completer: Arc<dyn TextCompleter>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
}

impl std::fmt::Debug for FallbackServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackServices").finish_non_exhaustive()
    }
}

/// Shape of `{"error": {"message": ..., "type": ...}}` bodies.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProviderErrorBody {
    pub error: ProviderErrorDetail,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProviderErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
}

/// Read a response body, mapping non-success statuses to [`FallbackError`].
pub(crate) async fn read_success_body(response: reqwest::Response) -> FallbackResult<bytes::Bytes> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| FallbackError::Network(format!("Failed to read response: {e}")))?;

    if status.is_success() {
        return Ok(body);
    }

    let message = match serde_json::from_slice::<ProviderErrorBody>(&body) {
        Ok(parsed) => match parsed.error.error_type {
            Some(kind) => format!("{} ({kind})", parsed.error.message),
            None => parsed.error.message,
        },
        Err(_) => format!("HTTP {status}: {}", String::from_utf8_lossy(&body)),
    };

    if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(FallbackError::AuthenticationFailed(message))
    } else {
        Err(FallbackError::Provider(message))
    }
}
