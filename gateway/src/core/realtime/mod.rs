//! Upstream realtime session layer.
//!
//! [`RealtimeConnector`] is the seam between the per-connection state
//! machine and the upstream socket. Production wiring uses
//! [`OpenAIRealtimeConnector`]; tests substitute an in-process fake.

mod base;
pub mod openai;

pub use base::{
    RealtimeConnector, RealtimeError, RealtimeResult, SessionParams, ToolDefinition,
    UpstreamCommand, UpstreamFrame, UpstreamSession, VadParams,
};
pub use openai::{OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeConnector};
