//! Provider-neutral types for the upstream realtime session.
//!
//! The gateway talks to exactly one upstream session per client connection.
//! A [`RealtimeConnector`] performs the handshake and hands back an
//! [`UpstreamSession`]: a command sender plus a stream of decoded upstream
//! frames. Everything above this layer only sees the closed event vocabulary
//! in [`super::openai::messages`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::openai::messages::{ClientEvent, ServerEvent};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while talking to the upstream realtime API.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Connection to the upstream failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Session Parameters
// =============================================================================

/// Turn detection parameters sent in the session handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadParams {
    /// Whether server-side VAD is active at all
    pub enabled: bool,
    /// Activation threshold (0.0 to 1.0)
    pub threshold: f32,
    /// Audio kept before detected speech (ms)
    pub prefix_padding_ms: u32,
    /// Silence that ends a turn (ms)
    pub silence_duration_ms: u32,
    /// Upstream starts a response by itself when the user stops speaking
    pub create_response: bool,
    /// Upstream interrupts its own output when the user speaks
    pub interrupt_response: bool,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: true,
            interrupt_response: true,
        }
    }
}

/// Function tool schema advertised to the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Function name
    pub name: String,
    /// Function description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Everything needed to open and configure one upstream session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    /// Upstream WebSocket endpoint (without query string)
    pub url: String,
    /// Bearer credential
    pub api_key: String,
    /// Model identifier
    pub model: String,
    /// Voice identifier
    pub voice: String,
    /// Sampling temperature
    pub temperature: f32,
    /// System instructions
    pub instructions: Option<String>,
    /// Response modalities, e.g. `["text", "audio"]`
    pub modalities: Vec<String>,
    /// Turn detection settings
    pub vad: VadParams,
    /// Input transcription model
    pub transcription_model: String,
    /// Input/output audio format
    pub audio_format: String,
    /// Tool schema
    pub tools: Vec<ToolDefinition>,
    /// Handshake timeout
    pub connect_timeout: std::time::Duration,
}

// =============================================================================
// Session Handles
// =============================================================================

/// Commands accepted by the upstream writer task.
#[derive(Debug, Clone)]
pub enum UpstreamCommand {
    /// A typed event produced by the gateway itself
    Event(ClientEvent),
    /// A whitelisted client frame relayed without re-encoding
    Forward(String),
    /// Keep-alive ping
    Ping,
    /// Close the upstream socket
    Close,
}

/// One frame received from the upstream, decoded once at the boundary.
#[derive(Debug, Clone)]
pub struct UpstreamFrame {
    /// Typed view of the event
    pub event: ServerEvent,
    /// Original JSON text, relayed verbatim when no handler consumes it
    pub raw: Arc<str>,
}

impl UpstreamFrame {
    /// Decode a JSON text frame.
    ///
    /// A frame that is valid JSON but does not match the shape of its
    /// declared type is kept as [`ServerEvent::Unknown`] so it is still
    /// relayed to the client.
    pub fn parse(text: &str) -> RealtimeResult<Self> {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(schema_err) => {
                serde_json::from_str::<serde_json::Value>(text)
                    .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
                tracing::debug!(error = %schema_err, "Upstream event did not match its schema");
                ServerEvent::Unknown
            }
        };
        Ok(Self {
            event,
            raw: Arc::from(text),
        })
    }
}

/// A live upstream session.
///
/// Dropping the command sender (or sending [`UpstreamCommand::Close`]) shuts
/// the socket; `frames` yields `None` once the upstream has gone away.
pub struct UpstreamSession {
    /// Command channel into the writer half
    pub commands: mpsc::Sender<UpstreamCommand>,
    /// Decoded frames from the reader half
    pub frames: mpsc::Receiver<UpstreamFrame>,
    /// Socket pump task
    pub task: Option<JoinHandle<()>>,
}

impl UpstreamSession {
    /// Close the upstream socket and wait briefly for the pump to finish.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        let _ = self.commands.try_send(UpstreamCommand::Close);
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(std::time::Duration::from_secs(2), &mut task)
                .await
                .is_err()
        {
            tracing::debug!("Upstream pump did not stop in time");
            task.abort();
        }
    }

    /// Abort the socket pump. Safe to call more than once.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for UpstreamSession {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Opens upstream realtime sessions.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Perform the handshake and send the initial session configuration.
    async fn connect(&self, params: &SessionParams) -> RealtimeResult<UpstreamSession>;
}
