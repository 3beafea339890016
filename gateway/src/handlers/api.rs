//! REST endpoints: health, connection introspection and the synchronous
//! fallback reply.

use axum::{Json, extract::State, response::IntoResponse};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::fallback::CompletionRequest;
use crate::errors::{AppError, AppResult};
use crate::session::ConnectionSummary;
use crate::state::AppState;

/// Health check
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "OK" }))
}

/// Live realtime connections, oldest first.
pub async fn list_connections(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionSummary>> {
    Json(state.registry.list_active())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackReplyRequest {
    pub user_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub text: String,
    /// Also synthesize speech for the reply
    #[serde(default)]
    pub speak: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackReplyResponse {
    pub text: String,
    /// Base64 PCM16, present when speech was requested and synthesized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    pub format: String,
    pub sample_rate: u32,
}

/// One-shot reply through the fallback collaborators.
pub async fn fallback_reply(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FallbackReplyRequest>,
) -> AppResult<Json<FallbackReplyResponse>> {
    let services = state
        .fallback
        .as_ref()
        .ok_or_else(|| AppError::ServiceUnavailable("fallback replies are not configured".to_string()))?;

    let prompt = request.text.trim();
    if prompt.is_empty() {
        return Err(AppError::BadRequest("text must not be empty".to_string()));
    }
    if request.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId must not be empty".to_string()));
    }

    info!(user_id = %request.user_id, chars = prompt.len(), speak = request.speak, "REST fallback reply");

    let text = services
        .completer
        .complete(&CompletionRequest {
            user_id: request.user_id.clone(),
            thread_id: request.thread_id.clone(),
            prompt: prompt.to_string(),
        })
        .await?;

    let mut sample_rate = state.config.realtime.sample_rate;
    let audio = if request.speak {
        match services.synthesizer.synthesize(&text).await {
            Ok(speech) => {
                sample_rate = speech.sample_rate;
                Some(BASE64_STANDARD.encode(&speech.pcm))
            }
            Err(e) => {
                warn!(error = %e, "Speech synthesis failed, returning text only");
                None
            }
        }
    } else {
        None
    };

    Ok(Json(FallbackReplyResponse {
        text,
        audio,
        format: "pcm16".to_string(),
        sample_rate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::core::fallback::{
        FallbackError, FallbackResult, FallbackServices, SpeechSynthesizer, SynthesizedSpeech,
        TextCompleter, Transcriber,
    };
    use crate::core::realtime::OpenAIRealtimeConnector;
    use crate::core::tools::NoopToolExecutor;

    struct Echo {
        fail_run: bool,
    }

    #[async_trait]
    impl TextCompleter for Echo {
        async fn complete(&self, request: &CompletionRequest) -> FallbackResult<String> {
            if self.fail_run {
                return Err(FallbackError::RunTerminal {
                    run_id: "run_1".to_string(),
                    status: "expired".to_string(),
                });
            }
            Ok(format!("echo: {}", request.prompt))
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for Echo {
        async fn synthesize(&self, _text: &str) -> FallbackResult<SynthesizedSpeech> {
            Ok(SynthesizedSpeech {
                pcm: vec![1, 0, 2, 0],
                sample_rate: 24000,
            })
        }
    }

    #[async_trait]
    impl Transcriber for Echo {
        async fn transcribe(&self, _wav: Vec<u8>) -> FallbackResult<String> {
            Ok(String::new())
        }
    }

    fn app(fallback: Option<FallbackServices>) -> Router {
        let state = AppState::with_parts(
            ServerConfig::default(),
            Arc::new(OpenAIRealtimeConnector),
            Arc::new(NoopToolExecutor),
            fallback,
        );
        Router::new()
            .route("/", get(health_check))
            .route("/connections", get(list_connections))
            .route("/fallback/reply", post(fallback_reply))
            .with_state(state)
    }

    fn services(fail_run: bool) -> Option<FallbackServices> {
        let echo = Arc::new(Echo { fail_run });
        Some(FallbackServices {
            completer: echo.clone(),
            synthesizer: echo.clone(),
            transcriber: echo,
        })
    }

    fn reply_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/fallback/reply")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_empty_connections() {
        let app = app(None);
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "OK"}));

        let response = app
            .oneshot(Request::builder().uri("/connections").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn test_fallback_reply_with_speech() {
        let response = app(services(false))
            .oneshot(reply_request(json!({"userId": "u1", "text": " hi ", "speak": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["text"], "echo: hi");
        assert_eq!(body["audio"], BASE64_STANDARD.encode([1u8, 0, 2, 0]));
        assert_eq!(body["format"], "pcm16");
        assert_eq!(body["sampleRate"], 24000);
    }

    #[tokio::test]
    async fn test_fallback_reply_errors() {
        let response = app(None)
            .oneshot(reply_request(json!({"userId": "u1", "text": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app(services(false))
            .oneshot(reply_request(json!({"userId": "u1", "text": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(services(true))
            .oneshot(reply_request(json!({"userId": "u1", "threadId": "t1", "text": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["code"], "run_terminal");
        assert!(body.get("audio").is_none());
    }
}
