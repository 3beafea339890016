//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check, connection listing and the REST fallback reply
//! - `realtime` - Client WebSocket proxied to the upstream realtime session

pub mod api;
pub mod realtime;

pub use realtime::realtime_handler;
