use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// Create the REST API router
///
/// Rate limiting and CORS are applied in main.rs on the combined router.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/connections", get(api::list_connections))
        .route("/fallback/reply", post(api::fallback_reply))
        .layer(TraceLayer::new_for_http())
}
