//! Mutable state owned by a single connection.

use std::collections::{HashMap, VecDeque};

use super::ConnectionInfo;
use super::tasks::TimerHandle;

/// Longest stretch of client audio kept for local transcription
pub const MAX_BUFFERED_AUDIO_SECS: u32 = 30;

/// Speech-to-text accumulation for the current user utterance.
#[derive(Debug, Default)]
pub struct SttState {
    /// Raw PCM16 chunks mirrored from `input_audio_buffer.append`
    pcm_chunks: VecDeque<Vec<u8>>,
    buffered_bytes: usize,
    pub sample_rate: u32,
    /// Running transcript built from streamed deltas
    pub transcript: String,
    /// Most recent completed transcript, kept across turn end
    pub last_completed: Option<String>,
    pub has_received_transcription: bool,
    /// Guards the anticipatory fallback to once per utterance
    pub response_generation_started: bool,
}

impl SttState {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Default::default()
        }
    }

    /// Start of a new user utterance.
    pub fn begin_utterance(&mut self) {
        self.reset();
        self.last_completed = None;
    }

    /// Clear per-utterance accumulators and flags.
    pub fn reset(&mut self) {
        self.clear_audio();
        self.transcript.clear();
        self.has_received_transcription = false;
        self.response_generation_started = false;
    }

    pub fn clear_audio(&mut self) {
        self.pcm_chunks.clear();
        self.buffered_bytes = 0;
    }

    /// Byte budget for buffered PCM16 mono audio.
    pub fn max_buffered_bytes(&self) -> usize {
        self.sample_rate.max(1) as usize * 2 * MAX_BUFFERED_AUDIO_SECS as usize
    }

    /// Buffer a chunk, dropping the oldest audio once over budget. The
    /// newest chunk is always kept.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.buffered_bytes += chunk.len();
        self.pcm_chunks.push_back(chunk);

        let limit = self.max_buffered_bytes();
        while self.buffered_bytes > limit && self.pcm_chunks.len() > 1 {
            if let Some(dropped) = self.pcm_chunks.pop_front() {
                self.buffered_bytes -= dropped.len();
            }
        }
    }

    /// All buffered audio as one contiguous PCM16 buffer.
    pub fn buffered_pcm(&self) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(self.buffered_bytes);
        for chunk in &self.pcm_chunks {
            pcm.extend_from_slice(chunk);
        }
        pcm
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn buffered_chunks(&self) -> usize {
        self.pcm_chunks.len()
    }

    /// Accumulated transcript, or the last completed one if nothing is
    /// accumulating.
    pub fn best_transcript(&self) -> Option<String> {
        let current = self.transcript.trim();
        if !current.is_empty() {
            return Some(current.to_string());
        }
        self.last_completed
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

/// Where the assistant is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    AwaitingResponse,
    Speaking,
}

/// Turn, modality and double-voice guard state.
#[derive(Debug)]
pub struct TurnState {
    pub phase: TurnPhase,
    /// true = audio+text, false = text-only
    pub audio_mode: bool,
    pub idle_timer: Option<TimerHandle>,
    pub barge_in_timer: Option<TimerHandle>,
    /// Upstream audio reached the client during this turn
    pub seen_realtime_audio: bool,
    /// Fallback audio reached the client during this turn
    pub sent_fallback_speech: bool,
    /// A fallback request is running
    pub fallback_in_flight: bool,
    /// Bumped at turn boundaries; fallback replies carry the value they
    /// were started under and are dropped once it moves on
    pub generation: u64,
    /// Upstream response between `response.created` and `response.done`
    pub active_response: Option<String>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            phase: TurnPhase::Idle,
            audio_mode: true,
            idle_timer: None,
            barge_in_timer: None,
            seen_realtime_audio: false,
            sent_fallback_speech: false,
            fallback_in_flight: false,
            generation: 0,
            active_response: None,
        }
    }
}

impl TurnState {
    pub fn ai_speaking(&self) -> bool {
        self.phase == TurnPhase::Speaking
    }

    pub fn awaiting_response(&self) -> bool {
        self.phase == TurnPhase::AwaitingResponse
    }

    pub fn is_idle(&self) -> bool {
        self.phase == TurnPhase::Idle
    }

    pub fn clear_guards(&mut self) {
        self.seen_realtime_audio = false;
        self.sent_fallback_speech = false;
    }

    /// Move to a new turn generation, abandoning any fallback reply still
    /// running for the old one.
    pub fn advance_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.fallback_in_flight = false;
    }

    /// Drop both timers, cancelling them.
    pub fn cancel_timers(&mut self) {
        self.idle_timer = None;
        self.barge_in_timer = None;
    }
}

/// Streamed function call waiting for its arguments to complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallAccumulator {
    pub name: String,
    /// Identifier used when submitting the result; never the item id
    pub call_id: String,
    pub arguments: String,
}

/// Tool result held back until the response that requested it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedToolOutput {
    pub call_id: String,
    pub output: String,
}

/// Everything one connection knows about its conversation.
#[derive(Debug)]
pub struct SessionState {
    pub info: ConnectionInfo,
    pub stt: SttState,
    pub turn: TurnState,
    /// Keyed by upstream item id
    pub function_calls: HashMap<String, FunctionCallAccumulator>,
    /// Keyed by response id
    pub response_text: HashMap<String, String>,
    /// Keyed by response id
    pub audio_transcripts: HashMap<String, String>,
    pub response_start_times: HashMap<String, u64>,
    pub user_speech_start_times: HashMap<String, u64>,
    pub queued_tool_outputs: Vec<QueuedToolOutput>,
}

impl SessionState {
    pub fn new(info: ConnectionInfo, sample_rate: u32) -> Self {
        Self {
            info,
            stt: SttState::new(sample_rate),
            turn: TurnState::default(),
            function_calls: HashMap::new(),
            response_text: HashMap::new(),
            audio_transcripts: HashMap::new(),
            response_start_times: HashMap::new(),
            user_speech_start_times: HashMap::new(),
            queued_tool_outputs: Vec::new(),
        }
    }

    /// Clear streamed-output accumulators at the end of a turn.
    pub fn clear_turn_accumulators(&mut self) {
        self.response_text.clear();
        self.audio_transcripts.clear();
        self.function_calls.clear();
    }

    /// Release every per-connection map and timer.
    pub fn teardown(&mut self) {
        self.turn.cancel_timers();
        self.stt.begin_utterance();
        self.clear_turn_accumulators();
        self.response_start_times.clear();
        self.user_speech_start_times.clear();
        self.queued_tool_outputs.clear();
        self.turn.active_response = None;
    }

    /// Total number of live map entries, for leak checks.
    pub fn tracked_entries(&self) -> usize {
        self.function_calls.len()
            + self.response_text.len()
            + self.audio_transcripts.len()
            + self.response_start_times.len()
            + self.user_speech_start_times.len()
            + self.queued_tool_outputs.len()
    }
}
