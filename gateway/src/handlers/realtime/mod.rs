//! Realtime voice WebSocket
//!
//! Clients connect with `?userId=...&threadId=...` (optionally
//! `conversationId` and `tenantId`). Every connection is paired with exactly
//! one upstream realtime session.
//!
//! # Protocol
//!
//! ## Client → Server
//!
//! Upstream client events, forwarded byte-for-byte when whitelisted:
//!
//! - `session.update`, `transcription_session.update`
//! - `input_audio_buffer.append` / `.commit` / `.clear`
//!   (commits are dropped while server VAD is enabled)
//! - `conversation.item.create` / `.truncate` / `.delete` / `.retrieve`
//! - `response.create`, `response.cancel`
//!
//! Anything else is dropped. Binary frames are ignored.
//!
//! ## Server → Client
//!
//! - **connected**: Session established
//! - **assistant.text**: Complete assistant text for a response
//! - **assistant.audio** / **assistant.audio.delta**: PCM16 speech
//! - **assistant.citations**: Sources reported by a tool
//! - **user.transcript**: Completed user transcription
//! - **error**: Gateway-level error
//! - every other upstream event, relayed verbatim

mod handler;
pub mod messages;

pub use handler::{RealtimeQuery, realtime_handler};
