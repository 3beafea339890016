pub mod audio;
pub mod fallback;
pub mod realtime;
pub mod tools;

pub use audio::{AudioError, DecodedPcm, container_to_pcm16, pcm16_to_container};
pub use fallback::{
    CompletionRequest, FallbackError, FallbackResult, FallbackServices, SpeechSynthesizer,
    SynthesizedSpeech, TextCompleter, Transcriber,
};
pub use realtime::{RealtimeConnector, RealtimeError, RealtimeResult};
pub use tools::{ToolContext, ToolError, ToolExecutor};
