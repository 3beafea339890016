//! Turn and barge-in state machine.
//!
//! `Idle -> AwaitingResponse -> Speaking -> Idle`, with audio mode as an
//! orthogonal flag. Two timers hang off the turn state:
//!
//! * the barge-in grace timer, armed when the user starts speaking over the
//!   assistant and cancelled if the speech stops before it fires;
//! * the idle economy timer, armed at the end of each turn when enabled,
//!   which switches the session to text-only output.
//!
//! When both could act, barge-in wins: any user or assistant activity
//! cancels the idle timer, and an idle timer that fires while a barge-in is
//! pending or a turn is in progress does nothing.

use tracing::{debug, info, warn};

use super::state::{SessionState, TurnPhase};
use super::tasks::ConnectionTasks;
use super::{InternalEvent, Outbox, SessionSettings, now_ms};
use crate::core::realtime::openai::{ClientEvent, Response, audio_modalities, text_modalities};

/// Restore audio+text output if the idle economy switched it off.
pub fn ensure_audio_mode(state: &mut SessionState, out: &mut Outbox) {
    if !state.turn.audio_mode {
        info!(user_id = %state.info.user_id, "Restoring audio output");
        out.upstream(ClientEvent::set_modalities(audio_modalities()));
        state.turn.audio_mode = true;
    }
}

/// Any activity supersedes a pending idle switch.
pub fn cancel_idle(state: &mut SessionState) {
    if state.turn.idle_timer.take().is_some() {
        debug!("Idle economy timer cancelled");
    }
}

pub fn on_response_created(state: &mut SessionState, response: &Response, out: &mut Outbox) {
    cancel_idle(state);
    if !response.id.is_empty() {
        state.response_start_times.insert(response.id.clone(), now_ms());
    }
    state.turn.active_response = Some(response.id.clone());

    if response.has_audio(state.turn.audio_mode) {
        if state.turn.ai_speaking() {
            warn!(response_id = %response.id, "Response started while previous turn still speaking");
        }
        state.turn.phase = TurnPhase::Speaking;
        ensure_audio_mode(state, out);
    } else {
        state.turn.phase = TurnPhase::AwaitingResponse;
    }
}

pub fn on_speech_started(
    state: &mut SessionState,
    settings: &SessionSettings,
    tasks: &mut ConnectionTasks,
    item_id: &str,
    out: &mut Outbox,
) {
    cancel_idle(state);
    if !item_id.is_empty() {
        state.user_speech_start_times.insert(item_id.to_string(), now_ms());
    }
    state.stt.begin_utterance();
    state.turn.advance_generation();
    ensure_audio_mode(state, out);

    match state.turn.phase {
        TurnPhase::Speaking => {
            if state.turn.barge_in_timer.is_none() {
                debug!(grace_ms = settings.barge_in_grace.as_millis() as u64, "Barge-in pending");
                state.turn.barge_in_timer = Some(tasks.schedule(settings.barge_in_grace, |generation| {
                    InternalEvent::BargeInElapsed { generation }
                }));
            }
        }
        TurnPhase::Idle => state.turn.clear_guards(),
        TurnPhase::AwaitingResponse => {}
    }
}

/// Speech stopped inside the grace window: treat the barge-in as noise.
pub fn on_speech_stopped(state: &mut SessionState) {
    if state.turn.barge_in_timer.take().is_some() {
        debug!("Barge-in debounced");
    }
}

/// The upstream will answer the committed buffer.
pub fn on_input_committed(state: &mut SessionState, settings: &SessionSettings) {
    if state.turn.is_idle() && settings.realtime_enabled {
        state.turn.phase = TurnPhase::AwaitingResponse;
    }
}

/// The gateway asked the upstream to continue.
pub fn on_response_requested(state: &mut SessionState) {
    cancel_idle(state);
    if state.turn.is_idle() {
        state.turn.phase = TurnPhase::AwaitingResponse;
    }
}

pub fn on_response_done(
    state: &mut SessionState,
    settings: &SessionSettings,
    tasks: &mut ConnectionTasks,
    response_id: &str,
) {
    state.turn.phase = TurnPhase::Idle;
    state.turn.active_response = None;
    state.turn.barge_in_timer = None;
    state.turn.clear_guards();
    // A reply already running answers the turn that just ended.
    if !state.turn.fallback_in_flight {
        state.turn.advance_generation();
    }
    state.clear_turn_accumulators();
    state.response_start_times.remove(response_id);
    state.stt.reset();

    if let Some(delay) = settings.idle_economy {
        state.turn.idle_timer =
            Some(tasks.schedule(delay, |generation| InternalEvent::IdleElapsed { generation }));
    }
}

pub fn on_barge_in_elapsed(state: &mut SessionState, generation: u64, out: &mut Outbox) {
    let current = state.turn.barge_in_timer.as_ref().map(|t| t.generation());
    if current != Some(generation) {
        return;
    }
    state.turn.barge_in_timer = None;

    if state.turn.ai_speaking() {
        info!(user_id = %state.info.user_id, "Barge-in confirmed, cancelling response");
        out.upstream(ClientEvent::ResponseCancel);
    }
}

pub fn on_idle_elapsed(state: &mut SessionState, generation: u64, out: &mut Outbox) {
    let current = state.turn.idle_timer.as_ref().map(|t| t.generation());
    if current != Some(generation) {
        return;
    }
    state.turn.idle_timer = None;

    if state.turn.is_idle() && state.turn.barge_in_timer.is_none() && state.turn.audio_mode {
        info!(user_id = %state.info.user_id, "Idle, switching to text-only output");
        out.upstream(ClientEvent::set_modalities(text_modalities()));
        state.turn.audio_mode = false;
    }
}
