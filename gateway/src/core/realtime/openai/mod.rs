//! OpenAI-style realtime upstream.
//!
//! Audio on the wire is PCM 16-bit signed little-endian at 24kHz, base64
//! encoded inside JSON events.

mod client;
mod config;
pub mod messages;

pub use client::OpenAIRealtimeConnector;
pub use config::{
    DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_VOICE, Modality, OPENAI_REALTIME_SAMPLE_RATE,
    OPENAI_REALTIME_URL, audio_modalities, build_realtime_url, text_modalities,
};
pub use messages::{ApiError, ClientEvent, ConversationItem, Response, ServerEvent};
