//! Router assembly.

pub mod api;
pub mod realtime;

use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

/// REST and realtime routes with state attached. Middleware shared by both
/// (CORS, rate limiting, security headers) is layered on in main.rs.
pub fn create_app(state: Arc<AppState>) -> Router {
    let path = state.config.realtime.path.clone();
    api::create_api_router()
        .merge(realtime::create_realtime_router(&path))
        .with_state(state)
}
