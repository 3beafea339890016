//! Substitute replies when the streaming path cannot answer.
//!
//! Two triggers start a fallback reply: the anticipatory one (realtime
//! replies disabled, transcript long enough) and the failure one (upstream
//! error or failed response before any upstream audio). Either way the text
//! reaches the client first, then synthesized audio, and the audio is only
//! delivered if no other voice has been heard for the turn.
//!
//! Every reply is stamped with the turn generation it was started under.
//! Completions that arrive after the generation moved on (new user speech,
//! or a later turn finishing) are discarded.

use base64::prelude::*;
use tracing::{debug, info, warn};

use super::state::{SessionState, TurnPhase};
use super::tasks::ConnectionTasks;
use super::{FallbackTrigger, InternalEvent, Outbox, SessionSettings, now_ms};
use crate::core::audio::{pcm16_bytes_to_samples, pcm16_to_container};
use crate::core::fallback::{CompletionRequest, FallbackServices, SynthesizedSpeech};
use crate::handlers::realtime::messages::{EventSource, GatewayEvent};

/// Fire the anticipatory reply once per utterance when realtime replies are
/// disabled and the transcript has reached the threshold.
pub fn maybe_anticipatory(
    state: &mut SessionState,
    settings: &SessionSettings,
    services: Option<&FallbackServices>,
    tasks: &mut ConnectionTasks,
) -> bool {
    if settings.realtime_enabled || state.stt.response_generation_started {
        return false;
    }
    let prompt = state.stt.transcript.trim().to_string();
    if prompt.chars().count() < settings.min_transcript_chars.max(1) {
        return false;
    }
    let Some(services) = services else {
        return false;
    };

    state.stt.response_generation_started = true;
    info!(user_id = %state.info.user_id, chars = prompt.len(), "Anticipatory fallback reply");
    spawn_reply(state, services, tasks, prompt, FallbackTrigger::Anticipatory);
    true
}

/// Fire the failure reply unless a voice was already heard or sent for
/// this turn.
pub fn maybe_on_failure(
    state: &mut SessionState,
    services: Option<&FallbackServices>,
    tasks: &mut ConnectionTasks,
    reason: &str,
) -> bool {
    let turn = &state.turn;
    if turn.seen_realtime_audio || turn.sent_fallback_speech || turn.fallback_in_flight {
        debug!(reason, "Fallback suppressed by voice guards");
        return false;
    }
    let Some(services) = services else {
        return false;
    };
    let Some(prompt) = state.stt.best_transcript() else {
        debug!(reason, "No transcript available for fallback");
        return false;
    };

    warn!(user_id = %state.info.user_id, reason, "Upstream failed, answering with fallback");
    // The awaited upstream answer is not coming.
    if state.turn.awaiting_response() {
        state.turn.phase = TurnPhase::Idle;
    }
    spawn_reply(state, services, tasks, prompt, FallbackTrigger::UpstreamFailure);
    true
}

fn spawn_reply(
    state: &mut SessionState,
    services: &FallbackServices,
    tasks: &mut ConnectionTasks,
    prompt: String,
    trigger: FallbackTrigger,
) {
    state.turn.fallback_in_flight = true;
    let generation = state.turn.generation;

    let request = CompletionRequest {
        user_id: state.info.user_id.clone(),
        thread_id: Some(state.info.thread_id.clone()),
        prompt,
    };
    let completer = services.completer.clone();
    let synthesizer = services.synthesizer.clone();
    let events = tasks.events();

    tasks.spawn(async move {
        let text = match completer.complete(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Fallback completion failed");
                let _ = events
                    .send(InternalEvent::FallbackFailed {
                        message: e.to_string(),
                        generation,
                    })
                    .await;
                return;
            }
        };

        if events
            .send(InternalEvent::FallbackText {
                text: text.clone(),
                trigger,
                generation,
            })
            .await
            .is_err()
        {
            return;
        }

        let speech = match synthesizer.synthesize(&text).await {
            Ok(speech) => Some(speech),
            Err(e) => {
                warn!(error = %e, "Fallback speech synthesis failed, text only");
                None
            }
        };
        let _ = events
            .send(InternalEvent::FallbackAudio { speech, generation })
            .await;
    });
}

/// Gate for streamed upstream audio. Returns `false` when fallback audio
/// already played for this turn.
pub fn admit_realtime_audio(state: &mut SessionState) -> bool {
    if state.turn.sent_fallback_speech {
        return false;
    }
    state.turn.seen_realtime_audio = true;
    true
}

fn is_current(state: &SessionState, generation: u64) -> bool {
    if state.turn.generation == generation {
        return true;
    }
    debug!(
        generation,
        current = state.turn.generation,
        "Discarding fallback output from an earlier turn"
    );
    false
}

pub fn on_fallback_text(state: &SessionState, text: &str, generation: u64, out: &mut Outbox) {
    if !is_current(state, generation) {
        return;
    }
    out.client(&GatewayEvent::AssistantText {
        text: text.to_string(),
        response_id: None,
        source: EventSource::Fallback,
        timestamp: now_ms(),
    });
}

pub fn on_fallback_audio(
    state: &mut SessionState,
    speech: Option<SynthesizedSpeech>,
    generation: u64,
    out: &mut Outbox,
) {
    if !is_current(state, generation) {
        return;
    }
    state.turn.fallback_in_flight = false;
    let Some(speech) = speech else {
        return;
    };

    let turn = &state.turn;
    if turn.seen_realtime_audio || turn.sent_fallback_speech || turn.ai_speaking() {
        info!("Dropping fallback audio, another voice already played");
        return;
    }
    if turn.awaiting_response() {
        info!("Dropping fallback audio, an upstream response is on its way");
        return;
    }

    state.turn.sent_fallback_speech = true;
    out.client(&GatewayEvent::AssistantAudio {
        audio: BASE64_STANDARD.encode(&speech.pcm),
        format: "pcm16".to_string(),
        sample_rate: speech.sample_rate,
        source: EventSource::Fallback,
        response_id: None,
    });
}

pub fn on_fallback_failed(
    state: &mut SessionState,
    message: &str,
    generation: u64,
    out: &mut Outbox,
) {
    if !is_current(state, generation) {
        return;
    }
    state.turn.fallback_in_flight = false;
    out.client(&GatewayEvent::Error {
        code: "fallback_failed".to_string(),
        message: message.to_string(),
    });
}

/// Transcribe the buffered utterance locally after the upstream's own
/// transcription failed. The result is for display only.
pub fn spawn_local_transcription(
    state: &mut SessionState,
    services: Option<&FallbackServices>,
    tasks: &mut ConnectionTasks,
    item_id: &str,
    started_at_ms: u64,
) -> bool {
    let Some(services) = services else {
        return false;
    };
    let pcm = state.stt.buffered_pcm();
    if pcm.is_empty() {
        debug!(item_id, "No buffered audio for local transcription");
        return false;
    }

    let wav = match pcm16_to_container(&pcm16_bytes_to_samples(&pcm), state.stt.sample_rate, 1) {
        Ok(wav) => wav,
        Err(e) => {
            warn!(error = %e, "Failed to encode buffered audio");
            return false;
        }
    };

    let transcriber = services.transcriber.clone();
    let events = tasks.events();
    let item_id = item_id.to_string();
    tasks.spawn(async move {
        match transcriber.transcribe(wav).await {
            Ok(text) if !text.is_empty() => {
                let _ = events
                    .send(InternalEvent::LocalTranscript {
                        item_id,
                        text,
                        started_at_ms,
                    })
                    .await;
            }
            Ok(_) => debug!("Local transcription was empty"),
            Err(e) => warn!(error = %e, "Local transcription failed"),
        }
    });
    true
}

pub fn on_local_transcript(item_id: &str, text: &str, started_at_ms: u64, out: &mut Outbox) {
    out.client(&GatewayEvent::UserTranscript {
        text: text.to_string(),
        item_id: Some(item_id.to_string()),
        source: EventSource::Fallback,
        timestamp: started_at_ms,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fallback::{
        FallbackError, FallbackResult, SpeechSynthesizer, TextCompleter, Transcriber,
    };
    use crate::session::state::TurnPhase;
    use crate::session::{ConnectionInfo, Outbound};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Fake {
        prompts: Mutex<Vec<String>>,
        fail_text: bool,
        fail_speech: bool,
    }

    #[async_trait]
    impl TextCompleter for Fake {
        async fn complete(&self, request: &CompletionRequest) -> FallbackResult<String> {
            self.prompts.lock().push(request.prompt.clone());
            if self.fail_text {
                return Err(FallbackError::Provider("down".into()));
            }
            Ok(format!("reply to {}", request.prompt))
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for Fake {
        async fn synthesize(&self, _text: &str) -> FallbackResult<SynthesizedSpeech> {
            if self.fail_speech {
                return Err(FallbackError::Provider("tts down".into()));
            }
            Ok(SynthesizedSpeech {
                pcm: vec![1, 0, 2, 0],
                sample_rate: 24000,
            })
        }
    }

    #[async_trait]
    impl Transcriber for Fake {
        async fn transcribe(&self, wav: Vec<u8>) -> FallbackResult<String> {
            assert_eq!(&wav[0..4], b"RIFF");
            Ok("locally heard".into())
        }
    }

    fn services(fake: Arc<Fake>) -> FallbackServices {
        FallbackServices {
            completer: fake.clone(),
            synthesizer: fake.clone(),
            transcriber: fake,
        }
    }

    fn setup() -> (SessionState, ConnectionTasks, mpsc::Receiver<InternalEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let state = SessionState::new(
            ConnectionInfo {
                user_id: "u1".into(),
                thread_id: "t1".into(),
                conversation_id: None,
                tenant_id: None,
            },
            24000,
        );
        (state, ConnectionTasks::new(tx), rx)
    }

    fn client_values(out: &mut Outbox) -> Vec<Value> {
        out.drain()
            .filter_map(|o| match o {
                Outbound::Client(json) => serde_json::from_str(&json).ok(),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_anticipatory_fires_once_per_utterance() {
        let (mut state, mut tasks, mut rx) = setup();
        let fake = Arc::new(Fake::default());
        let svc = services(fake.clone());
        let settings = SessionSettings {
            realtime_enabled: false,
            min_transcript_chars: 5,
            ..Default::default()
        };

        state.stt.transcript.push_str("hi");
        assert!(!maybe_anticipatory(&mut state, &settings, Some(&svc), &mut tasks));

        state.stt.transcript.push_str(" there you");
        assert!(maybe_anticipatory(&mut state, &settings, Some(&svc), &mut tasks));
        state.stt.transcript.push_str(" again");
        assert!(!maybe_anticipatory(&mut state, &settings, Some(&svc), &mut tasks));

        assert_eq!(
            rx.recv().await.unwrap(),
            InternalEvent::FallbackText {
                text: "reply to hi there you".into(),
                trigger: FallbackTrigger::Anticipatory,
                generation: 0,
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            InternalEvent::FallbackAudio { speech: Some(_), generation: 0 }
        ));
        assert_eq!(fake.prompts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_anticipatory_inactive_when_realtime_enabled() {
        let (mut state, mut tasks, _rx) = setup();
        let svc = services(Arc::new(Fake::default()));
        state.stt.transcript.push_str("a long enough transcript");
        assert!(!maybe_anticipatory(
            &mut state,
            &SessionSettings::default(),
            Some(&svc),
            &mut tasks
        ));
    }

    #[tokio::test]
    async fn test_failure_fallback_guards() {
        let (mut state, mut tasks, _rx) = setup();
        let svc = services(Arc::new(Fake::default()));

        // No transcript yet.
        assert!(!maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error"));

        state.stt.last_completed = Some("where is my flat".into());
        state.turn.seen_realtime_audio = true;
        assert!(!maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error"));

        state.turn.seen_realtime_audio = false;
        assert!(maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error"));
        assert!(state.turn.fallback_in_flight);
        // In flight: a second error does not start another reply.
        assert!(!maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error"));
    }

    #[tokio::test]
    async fn test_text_failure_surfaces_error() {
        let (mut state, mut tasks, mut rx) = setup();
        let svc = services(Arc::new(Fake {
            fail_text: true,
            ..Default::default()
        }));
        state.stt.transcript.push_str("hello");
        assert!(maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error"));

        let InternalEvent::FallbackFailed { message, generation } = rx.recv().await.unwrap() else {
            panic!("expected failure");
        };
        let mut out = Outbox::new();
        on_fallback_failed(&mut state, &message, generation, &mut out);
        assert!(!state.turn.fallback_in_flight);
        assert_eq!(client_values(&mut out)[0]["type"], "error");
    }

    #[tokio::test]
    async fn test_speech_failure_degrades_to_text() {
        let (mut state, mut tasks, mut rx) = setup();
        let svc = services(Arc::new(Fake {
            fail_speech: true,
            ..Default::default()
        }));
        state.stt.transcript.push_str("hello");
        maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error");

        let mut out = Outbox::new();
        let InternalEvent::FallbackText { text, generation, .. } = rx.recv().await.unwrap() else {
            panic!("expected text");
        };
        on_fallback_text(&state, &text, generation, &mut out);
        let InternalEvent::FallbackAudio { speech, generation } = rx.recv().await.unwrap() else {
            panic!("expected audio slot");
        };
        on_fallback_audio(&mut state, speech, generation, &mut out);

        let values = client_values(&mut out);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["type"], "assistant.text");
        assert_eq!(values[0]["source"], "fallback");
        assert!(!state.turn.sent_fallback_speech);
    }

    #[test]
    fn test_no_double_voice() {
        let mut state = SessionState::new(
            ConnectionInfo {
                user_id: "u".into(),
                thread_id: "t".into(),
                conversation_id: None,
                tenant_id: None,
            },
            24000,
        );
        let speech = SynthesizedSpeech {
            pcm: vec![0, 0],
            sample_rate: 24000,
        };
        let mut out = Outbox::new();

        // Fallback audio first: later upstream audio is refused.
        on_fallback_audio(&mut state, Some(speech.clone()), 0, &mut out);
        assert_eq!(out.len(), 1);
        assert!(state.turn.sent_fallback_speech);
        assert!(!admit_realtime_audio(&mut state));
        assert!(!(state.turn.seen_realtime_audio && state.turn.sent_fallback_speech));

        // Upstream audio first: later fallback audio is dropped.
        state.turn.clear_guards();
        out.drain();
        assert!(admit_realtime_audio(&mut state));
        on_fallback_audio(&mut state, Some(speech.clone()), 0, &mut out);
        assert!(out.is_empty());
        assert!(!(state.turn.seen_realtime_audio && state.turn.sent_fallback_speech));

        // Assistant currently speaking: fallback audio is dropped.
        state.turn.clear_guards();
        state.turn.phase = TurnPhase::Speaking;
        on_fallback_audio(&mut state, Some(speech.clone()), 0, &mut out);
        assert!(out.is_empty());

        // Upstream response requested but not started: fallback audio is dropped.
        state.turn.phase = TurnPhase::AwaitingResponse;
        on_fallback_audio(&mut state, Some(speech), 0, &mut out);
        assert!(out.is_empty());
        assert!(!state.turn.sent_fallback_speech);
    }

    #[tokio::test]
    async fn test_reply_from_earlier_turn_is_discarded() {
        let (mut state, mut tasks, mut rx) = setup();
        let svc = services(Arc::new(Fake::default()));
        state.stt.last_completed = Some("what time is it".into());
        state.turn.phase = TurnPhase::AwaitingResponse;
        assert!(maybe_on_failure(&mut state, Some(&svc), &mut tasks, "error"));
        assert!(state.turn.is_idle());

        state.turn.advance_generation();
        state.turn.phase = TurnPhase::AwaitingResponse;

        let mut out = Outbox::new();
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            match event {
                InternalEvent::FallbackText { text, generation, .. } => {
                    assert_eq!(generation, 0);
                    on_fallback_text(&state, &text, generation, &mut out);
                }
                InternalEvent::FallbackAudio { speech, generation } => {
                    on_fallback_audio(&mut state, speech, generation, &mut out);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(out.is_empty());
        assert!(!state.turn.sent_fallback_speech);
        assert!(admit_realtime_audio(&mut state));
    }

    #[tokio::test]
    async fn test_local_transcription_from_buffered_audio() {
        let (mut state, mut tasks, mut rx) = setup();
        let svc = services(Arc::new(Fake::default()));

        assert!(!spawn_local_transcription(&mut state, Some(&svc), &mut tasks, "item_1", 7));

        state.stt.push_chunk(vec![0u8; 320]);
        assert!(spawn_local_transcription(&mut state, Some(&svc), &mut tasks, "item_1", 7));

        let InternalEvent::LocalTranscript { item_id, text, started_at_ms } = rx.recv().await.unwrap() else {
            panic!("expected transcript");
        };
        let mut out = Outbox::new();
        on_local_transcript(&item_id, &text, started_at_ms, &mut out);

        let values = client_values(&mut out);
        assert_eq!(values[0]["type"], "user.transcript");
        assert_eq!(values[0]["text"], "locally heard");
        assert_eq!(values[0]["itemId"], "item_1");
        assert_eq!(values[0]["source"], "fallback");
        assert_eq!(values[0]["timestamp"], 7);
    }
}
