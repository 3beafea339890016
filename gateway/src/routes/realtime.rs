//! Realtime WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::realtime::realtime_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the Realtime WebSocket router
///
/// # Endpoint
///
/// `GET {path}?userId=..&threadId=..` - WebSocket upgrade, where `path`
/// comes from `REALTIME_PATH` (default `/realtime`).
///
/// # Example
///
/// ```json
/// // Server greets the client
/// {"type": "connected", "threadId": "thread_abc"}
///
/// // Client streams microphone audio
/// {"type": "input_audio_buffer.append", "audio": "<base64 pcm16>"}
///
/// // Server sends the finished assistant text once per response
/// {"type": "assistant.text", "text": "Hello!", "responseId": "resp_1", "source": "realtime", "timestamp": 1700000000000}
/// ```
pub fn create_realtime_router(path: &str) -> Router<Arc<AppState>> {
    Router::new()
        .route(path, get(realtime_handler))
        .layer(TraceLayer::new_for_http())
}
