//! Per-connection message router.
//!
//! Client frames are checked against the [`ClientFrame`] whitelist and
//! forwarded raw. Upstream events are decoded once into [`ServerEvent`] and
//! dispatched to the turn, tool and fallback handlers; whatever no handler
//! consumes is relayed to the client verbatim. Events that a handler turns
//! into a gateway event (text and audio deltas, transcripts, function call
//! arguments) are never relayed a second time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::SessionState;
use super::tasks::ConnectionTasks;
use super::{
    ConnectionInfo, InternalEvent, Outbox, SessionSettings, fallback, now_ms, tool_bridge, turn,
};
use crate::core::fallback::FallbackServices;
use crate::core::realtime::UpstreamFrame;
use crate::core::realtime::openai::ServerEvent;
use crate::core::tools::{ToolContext, ToolExecutor};
use crate::handlers::realtime::messages::{ClientFrame, EventSource, GatewayEvent};

/// Owns one connection's state and background work.
pub struct MessageRouter {
    state: SessionState,
    settings: SessionSettings,
    tasks: ConnectionTasks,
    tools: Arc<dyn ToolExecutor>,
    fallback: Option<FallbackServices>,
}

impl MessageRouter {
    pub fn new(
        info: ConnectionInfo,
        settings: SessionSettings,
        tools: Arc<dyn ToolExecutor>,
        fallback: Option<FallbackServices>,
        events: mpsc::Sender<InternalEvent>,
    ) -> Self {
        let state = SessionState::new(info, settings.sample_rate);
        Self {
            state,
            settings,
            tasks: ConnectionTasks::new(events),
            tools,
            fallback,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Background tasks not yet reaped.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Handle one client text frame. Returns whether it was forwarded.
    pub fn handle_client_text(&mut self, text: &str, out: &mut Outbox) -> bool {
        let frame = ClientFrame::parse(text);
        match &frame {
            ClientFrame::Other => {
                debug!(user_id = %self.state.info.user_id, "Dropping non-whitelisted client frame");
                return false;
            }
            ClientFrame::InputAudioBufferAppend { .. } => match frame.decode_audio() {
                Some(pcm) => self.state.stt.push_chunk(pcm),
                None => debug!("Append frame carried undecodable audio"),
            },
            ClientFrame::InputAudioBufferCommit {} if self.settings.server_vad_enabled => {
                debug!("Ignoring client commit, server VAD commits on its own");
                return false;
            }
            ClientFrame::InputAudioBufferClear {} => self.state.stt.clear_audio(),
            ClientFrame::ResponseCreate {} => turn::on_response_requested(&mut self.state),
            _ => {}
        }

        out.forward_upstream(text);
        true
    }

    /// Handle one upstream event.
    pub fn handle_upstream(&mut self, frame: UpstreamFrame, out: &mut Outbox) {
        let UpstreamFrame { event, raw } = frame;
        let state = &mut self.state;
        let settings = &self.settings;
        let tasks = &mut self.tasks;
        let services = self.fallback.as_ref();

        match event {
            ServerEvent::Error { error } => {
                if error.is_benign_cancel_rejection() {
                    debug!(message = %error.message, "Ignoring rejected cancel for inactive response");
                    return;
                }
                warn!(
                    user_id = %state.info.user_id,
                    error_type = %error.error_type,
                    code = ?error.code,
                    message = %error.message,
                    "Upstream error"
                );
                out.relay_client(&raw);
                fallback::maybe_on_failure(state, services, tasks, &error.message);
            }

            ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
                debug!(session_id = ?session.id, modalities = ?session.modalities, "Upstream session configured");
                out.relay_client(&raw);
            }

            ServerEvent::SpeechStarted { item_id, .. } => {
                turn::on_speech_started(state, settings, tasks, &item_id, out);
                out.relay_client(&raw);
            }

            ServerEvent::SpeechStopped { .. } => {
                turn::on_speech_stopped(state);
                out.relay_client(&raw);
            }

            ServerEvent::InputAudioBufferCommitted { .. } => {
                turn::on_input_committed(state, settings);
                out.relay_client(&raw);
            }

            ServerEvent::TranscriptionDelta { delta, .. } => {
                state.stt.transcript.push_str(&delta);
                state.stt.has_received_transcription = true;
                fallback::maybe_anticipatory(state, settings, services, tasks);
                out.relay_client(&raw);
            }

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => {
                let text = transcript.trim().to_string();
                state.stt.has_received_transcription = true;
                if state.stt.transcript.trim().is_empty() {
                    state.stt.transcript = text.clone();
                }
                state.stt.last_completed = Some(text.clone());

                let timestamp = state
                    .user_speech_start_times
                    .remove(&item_id)
                    .unwrap_or_else(now_ms);
                if !text.is_empty() {
                    out.client(&GatewayEvent::UserTranscript {
                        text,
                        item_id: (!item_id.is_empty()).then_some(item_id),
                        source: EventSource::Realtime,
                        timestamp,
                    });
                }
                fallback::maybe_anticipatory(state, settings, services, tasks);
            }

            ServerEvent::TranscriptionFailed { item_id, error } => {
                warn!(
                    item_id = %item_id,
                    message = error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                    "Upstream transcription failed, transcribing locally"
                );
                let started_at = state
                    .user_speech_start_times
                    .remove(&item_id)
                    .unwrap_or_else(now_ms);
                fallback::spawn_local_transcription(state, services, tasks, &item_id, started_at);
            }

            ServerEvent::ResponseCreated { response } => {
                debug!(response_id = %response.id, "Response created");
                turn::on_response_created(state, &response, out);
                out.relay_client(&raw);
            }

            ServerEvent::OutputItemAdded { item, .. } => {
                if item.is_function_call() {
                    tool_bridge::on_call_added(state, &item);
                }
                out.relay_client(&raw);
            }

            ServerEvent::TextDelta {
                response_id, delta, ..
            } => {
                state.response_text.entry(response_id).or_default().push_str(&delta);
            }

            ServerEvent::TextDone {
                response_id, text, ..
            } => {
                let accumulated = state.response_text.remove(&response_id);
                emit_assistant_text(state, response_id, accumulated, text, EventSource::Realtime, out);
            }

            ServerEvent::AudioTranscriptDelta {
                response_id, delta, ..
            } => {
                state
                    .audio_transcripts
                    .entry(response_id)
                    .or_default()
                    .push_str(&delta);
            }

            ServerEvent::AudioTranscriptDone {
                response_id,
                transcript,
                ..
            } => {
                let accumulated = state.audio_transcripts.remove(&response_id);
                emit_assistant_text(
                    state,
                    response_id,
                    accumulated,
                    transcript,
                    EventSource::RealtimeTranscript,
                    out,
                );
            }

            ServerEvent::AudioDelta {
                response_id, delta, ..
            } => {
                if fallback::admit_realtime_audio(state) {
                    out.client(&GatewayEvent::AssistantAudioDelta { delta, response_id });
                } else {
                    debug!(response_id = %response_id, "Dropping upstream audio, fallback voice already played");
                }
            }

            ServerEvent::FunctionCallArgumentsDelta { item_id, delta, .. } => {
                tool_bridge::on_arguments_delta(state, &item_id, &delta);
            }

            ServerEvent::FunctionCallArgumentsDone {
                item_id,
                call_id,
                arguments,
                ..
            } => {
                if let Some(invocation) =
                    tool_bridge::on_arguments_done(state, &item_id, call_id.as_deref(), &arguments)
                {
                    info!(
                        item_id = %item_id,
                        call_id = %invocation.call_id,
                        tool = %invocation.name,
                        "Invoking tool"
                    );
                    let ctx = ToolContext {
                        user_id: state.info.user_id.clone(),
                    };
                    tool_bridge::spawn_invocation(tasks, Arc::clone(&self.tools), ctx, invocation);
                }
            }

            ServerEvent::ResponseDone { response } => {
                if response.is_failed() {
                    fallback::maybe_on_failure(state, services, tasks, "response failed");
                }
                debug!(response_id = %response.id, status = %response.status, "Response done");
                turn::on_response_done(state, settings, tasks, &response.id);
                out.relay_client(&raw);
                tool_bridge::submit_queued_outputs(state, out);
            }

            ServerEvent::InputAudioBufferCleared
            | ServerEvent::ConversationItemCreated { .. }
            | ServerEvent::OutputItemDone { .. }
            | ServerEvent::AudioDone { .. }
            | ServerEvent::RateLimitsUpdated { .. }
            | ServerEvent::Unknown => out.relay_client(&raw),
        }
    }

    /// Handle a completion posted by one of this connection's tasks.
    pub fn handle_internal(&mut self, event: InternalEvent, out: &mut Outbox) {
        match event {
            InternalEvent::BargeInElapsed { generation } => {
                turn::on_barge_in_elapsed(&mut self.state, generation, out)
            }
            InternalEvent::IdleElapsed { generation } => {
                turn::on_idle_elapsed(&mut self.state, generation, out)
            }
            InternalEvent::ToolCompleted {
                call_id,
                name,
                output,
            } => tool_bridge::on_tool_completed(&mut self.state, &call_id, &name, &output, out),
            InternalEvent::FallbackText {
                text,
                trigger,
                generation,
            } => {
                debug!(?trigger, generation, "Fallback text ready");
                fallback::on_fallback_text(&self.state, &text, generation, out);
            }
            InternalEvent::FallbackAudio { speech, generation } => {
                fallback::on_fallback_audio(&mut self.state, speech, generation, out)
            }
            InternalEvent::FallbackFailed {
                message,
                generation,
            } => fallback::on_fallback_failed(&mut self.state, &message, generation, out),
            InternalEvent::LocalTranscript {
                item_id,
                text,
                started_at_ms,
            } => fallback::on_local_transcript(&item_id, &text, started_at_ms, out),
        }
    }

    /// Cancel timers and background work and release all per-connection
    /// state. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.state.teardown();
        self.tasks.abort_all();
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Flush one accumulated output stream as a single `assistant.text`.
fn emit_assistant_text(
    state: &mut SessionState,
    response_id: String,
    accumulated: Option<String>,
    final_text: String,
    source: EventSource,
    out: &mut Outbox,
) {
    let text = accumulated
        .filter(|t| !t.is_empty())
        .unwrap_or(final_text);
    if text.is_empty() {
        return;
    }
    let timestamp = state
        .response_start_times
        .get(&response_id)
        .copied()
        .unwrap_or_else(now_ms);
    out.client(&GatewayEvent::AssistantText {
        text,
        response_id: (!response_id.is_empty()).then_some(response_id),
        source,
        timestamp,
    });
}
