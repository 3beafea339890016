//! Client-facing realtime WebSocket message types
//!
//! Inbound frames use the upstream's own event names, but only the
//! whitelisted subset in [`ClientFrame`] is ever forwarded. Outbound frames
//! are either upstream events relayed verbatim or one of the gateway's own
//! [`GatewayEvent`]s.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum WebSocket frame and message size accepted from clients (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

// =============================================================================
// Incoming Messages (Client -> Gateway)
// =============================================================================

/// Client frames the gateway is willing to forward upstream.
///
/// Fields other than those needed locally are ignored here; the original
/// frame text is what gets forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "session.update")]
    SessionUpdate {},

    #[serde(rename = "transcription_session.update")]
    TranscriptionSessionUpdate {},

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64 PCM16
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit {},

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear {},

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {},

    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {},

    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete {},

    #[serde(rename = "conversation.item.retrieve")]
    ConversationItemRetrieve {},

    #[serde(rename = "response.create")]
    ResponseCreate {},

    #[serde(rename = "response.cancel")]
    ResponseCancel {},

    /// Anything outside the whitelist
    #[serde(other)]
    Other,
}

impl ClientFrame {
    /// Decode a client text frame. Frames that are not JSON objects with a
    /// known `type`, or whose known type is malformed, come back as `Other`.
    pub fn parse(text: &str) -> Self {
        // Tagged enums also accept the sequence form, so only objects may pass.
        match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => {
                ClientFrame::deserialize(value).unwrap_or(ClientFrame::Other)
            }
            _ => ClientFrame::Other,
        }
    }

    pub fn is_whitelisted(&self) -> bool {
        !matches!(self, ClientFrame::Other)
    }

    /// Raw PCM bytes carried by an append frame.
    pub fn decode_audio(&self) -> Option<Vec<u8>> {
        match self {
            ClientFrame::InputAudioBufferAppend { audio } => BASE64_STANDARD.decode(audio).ok(),
            _ => None,
        }
    }
}

// =============================================================================
// Outgoing Messages (Gateway -> Client)
// =============================================================================

/// Which path produced an assistant or user event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Upstream text output
    Realtime,
    /// Transcript of upstream audio output
    RealtimeTranscript,
    /// REST fallback collaborators
    Fallback,
}

/// Events the gateway itself emits to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    /// Handshake acknowledgement
    #[serde(rename = "connected")]
    Connected {
        thread_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },

    /// Complete assistant text for one response
    #[serde(rename = "assistant.text")]
    AssistantText {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        source: EventSource,
        /// Turn start, unix ms
        timestamp: u64,
    },

    /// Complete, non-streamed audio
    #[serde(rename = "assistant.audio")]
    AssistantAudio {
        /// Base64 PCM16
        audio: String,
        format: String,
        sample_rate: u32,
        source: EventSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    /// Streamed audio chunk
    #[serde(rename = "assistant.audio.delta")]
    AssistantAudioDelta {
        /// Base64 PCM16
        delta: String,
        response_id: String,
    },

    #[serde(rename = "assistant.citations")]
    AssistantCitations {
        citations: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    /// Recognized user speech
    #[serde(rename = "user.transcript")]
    UserTranscript {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        source: EventSource,
        /// Utterance start, unix ms
        timestamp: u64,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}
