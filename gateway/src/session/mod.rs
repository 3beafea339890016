//! Per-connection session machinery.
//!
//! One client connection owns exactly one [`router::MessageRouter`], which
//! owns that connection's [`state::SessionState`]. Nothing in here is shared
//! between connections except the [`registry::ConnectionRegistry`].
//!
//! Event handlers never perform I/O directly. They push [`Outbound`] items
//! into an [`Outbox`] which the socket loop drains, and they hand slow work
//! (tool calls, fallback synthesis, timers) to [`tasks::ConnectionTasks`],
//! whose completions come back as [`InternalEvent`]s on the same loop.

pub mod fallback;
pub mod registry;
pub mod router;
pub mod state;
pub mod tasks;
pub mod tool_bridge;
pub mod turn;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::core::fallback::SynthesizedSpeech;
use crate::core::realtime::UpstreamCommand;
use crate::core::realtime::openai::ClientEvent;
use crate::handlers::realtime::messages::GatewayEvent;

pub use registry::{ConnectionGuard, ConnectionId, ConnectionRegistry, ConnectionSummary, RegistryError};
pub use router::MessageRouter;
pub use state::SessionState;

/// Identifiers supplied by the client when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub user_id: String,
    /// Upstream session / conversation thread binding
    pub thread_id: String,
    pub conversation_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// Behavioural knobs for one connection, derived from server config.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Upstream detects turns itself; client commits are dropped
    pub server_vad_enabled: bool,
    /// When false the upstream never answers on its own and the
    /// anticipatory fallback replies instead
    pub realtime_enabled: bool,
    pub barge_in_grace: Duration,
    /// `Some(delay)` enables the idle text-only switch
    pub idle_economy: Option<Duration>,
    /// Transcript length that triggers the anticipatory fallback
    pub min_transcript_chars: usize,
    /// Sample rate of PCM16 audio in both directions
    pub sample_rate: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_vad_enabled: true,
            realtime_enabled: true,
            barge_in_grace: Duration::from_millis(200),
            idle_economy: None,
            min_transcript_chars: 12,
            sample_rate: 24000,
        }
    }
}

/// Which condition started a fallback reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTrigger {
    Anticipatory,
    UpstreamFailure,
}

/// Completions posted back into a connection's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    BargeInElapsed {
        generation: u64,
    },
    IdleElapsed {
        generation: u64,
    },
    ToolCompleted {
        call_id: String,
        name: String,
        output: Value,
    },
    /// Fallback events carry the turn generation they were started under
    FallbackText {
        text: String,
        trigger: FallbackTrigger,
        generation: u64,
    },
    FallbackAudio {
        speech: Option<SynthesizedSpeech>,
        generation: u64,
    },
    FallbackFailed {
        message: String,
        generation: u64,
    },
    LocalTranscript {
        item_id: String,
        text: String,
        started_at_ms: u64,
    },
}

/// A frame to be written to one of the two sockets.
#[derive(Debug, Clone)]
pub enum Outbound {
    Upstream(UpstreamCommand),
    /// JSON text for the client socket
    Client(String),
}

/// Collects the frames produced while handling one event.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outbound>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upstream(&mut self, event: ClientEvent) {
        self.items.push(Outbound::Upstream(UpstreamCommand::Event(event)));
    }

    /// Relay a client frame upstream without re-encoding it.
    pub fn forward_upstream(&mut self, raw: &str) {
        self.items
            .push(Outbound::Upstream(UpstreamCommand::Forward(raw.to_string())));
    }

    pub fn client(&mut self, event: &GatewayEvent) {
        match serde_json::to_string(event) {
            Ok(json) => self.items.push(Outbound::Client(json)),
            Err(e) => tracing::error!("Failed to serialize client event: {}", e),
        }
    }

    /// Relay an upstream frame to the client verbatim.
    pub fn relay_client(&mut self, raw: &str) {
        self.items.push(Outbound::Client(raw.to_string()));
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Outbound> {
        self.items.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[Outbound] {
        &self.items
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
