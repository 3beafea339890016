//! Realtime WebSocket handler
//!
//! One client socket is paired with one upstream realtime session. A single
//! select loop owns the [`MessageRouter`]; writes to the client go through a
//! dedicated sender task so a slow client never blocks the loop.

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval_at};
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::core::realtime::UpstreamCommand;
use crate::session::{ConnectionInfo, InternalEvent, MessageRouter, Outbound, Outbox, RegistryError};
use crate::state::AppState;

use super::messages::{GatewayEvent, MAX_MESSAGE_SIZE};

/// Buffer for client-bound frames; audio deltas arrive in bursts
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Buffer for background task completions
const INTERNAL_BUFFER_SIZE: usize = 64;

/// How long the sender task may take to flush the close frame
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Query string accepted on the realtime path.
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeQuery {
    #[serde(rename = "userId", alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(rename = "threadId", alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(rename = "conversationId", alias = "conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(rename = "tenantId", alias = "tenant_id")]
    pub tenant_id: Option<String>,
}

impl RealtimeQuery {
    /// Both identifiers must be present and non-blank.
    pub fn into_info(self) -> Option<ConnectionInfo> {
        let non_blank = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        Some(ConnectionInfo {
            user_id: non_blank(self.user_id)?,
            thread_id: non_blank(self.thread_id)?,
            conversation_id: non_blank(self.conversation_id),
            tenant_id: non_blank(self.tenant_id),
        })
    }
}

/// Frames queued for the client sender task.
#[derive(Debug)]
enum ClientRoute {
    Text(String),
    Ping,
    Close { code: u16, reason: &'static str },
}

/// Realtime WebSocket handler
///
/// Upgrades the HTTP connection; identifiers are validated after the upgrade
/// so the client receives a proper close code instead of an HTTP error.
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RealtimeQuery>,
) -> Response {
    debug!(user_id = ?query.user_id, thread_id = ?query.thread_id, "Realtime WebSocket upgrade requested");

    ws.max_frame_size(MAX_MESSAGE_SIZE)
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_realtime_socket(socket, state, query))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

async fn handle_realtime_socket(socket: WebSocket, state: Arc<AppState>, query: RealtimeQuery) {
    let Some(info) = query.into_info() else {
        warn!("Realtime connection rejected: userId and threadId are required");
        close_with(socket, close_code::POLICY, "userId and threadId are required").await;
        return;
    };

    if !state.registry.has_capacity() {
        warn!(user_id = %info.user_id, "Realtime connection rejected: at capacity");
        close_with(socket, close_code::AGAIN, "server at capacity").await;
        return;
    }

    let mut upstream = match state.connector.connect(&state.session_params()).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, user_id = %info.user_id, "Failed to connect upstream");
            close_with(socket, close_code::ERROR, "upstream connection failed").await;
            return;
        }
    };

    // Only a connection with a live upstream session is registered.
    let guard = match state.registry.register(&info) {
        Ok(guard) => guard,
        Err(RegistryError::AtCapacity(max)) => {
            warn!(max, user_id = %info.user_id, "Realtime connection rejected: at capacity");
            upstream.shutdown().await;
            close_with(socket, close_code::AGAIN, "server at capacity").await;
            return;
        }
    };

    info!(
        connection_id = %guard.id(),
        user_id = %info.user_id,
        thread_id = %info.thread_id,
        "Realtime session established"
    );

    let (mut sender, mut receiver) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<ClientRoute>(CHANNEL_BUFFER_SIZE);

    let sender_task = tokio::spawn(async move {
        while let Some(route) = client_rx.recv().await {
            let result = match route {
                ClientRoute::Text(text) => sender.send(Message::Text(text.into())).await,
                ClientRoute::Ping => sender.send(Message::Ping(Bytes::new())).await,
                ClientRoute::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let connected = GatewayEvent::Connected {
        thread_id: info.thread_id.clone(),
        conversation_id: info.conversation_id.clone(),
    };
    let mut outbox = Outbox::new();
    outbox.client(&connected);

    let (events_tx, mut events_rx) = mpsc::channel::<InternalEvent>(INTERNAL_BUFFER_SIZE);
    let mut router = MessageRouter::new(
        info,
        state.session_settings(),
        state.tools.clone(),
        state.fallback.clone(),
        events_tx,
    );

    let period = state.config.realtime.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    let token = guard.token().clone();

    let (code, reason) = loop {
        if !flush(&mut outbox, &upstream.commands, &client_tx).await {
            break (close_code::NORMAL, "connection closed");
        }

        select! {
            _ = token.cancelled() => {
                info!(connection_id = %guard.id(), "Closing realtime session for shutdown");
                break (close_code::NORMAL, "server shutting down");
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    router.handle_client_text(text.as_str(), &mut outbox);
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(bytes = data.len(), "Ignoring binary client frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!(connection_id = %guard.id(), "Client closed realtime connection");
                    break (close_code::NORMAL, "client closed");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Realtime WebSocket error");
                    break (close_code::NORMAL, "client error");
                }
            },
            frame = upstream.frames.recv() => match frame {
                Some(frame) => router.handle_upstream(frame, &mut outbox),
                None => {
                    warn!(connection_id = %guard.id(), "Upstream closed realtime session");
                    break (close_code::NORMAL, "upstream closed");
                }
            },
            Some(event) = events_rx.recv() => {
                router.handle_internal(event, &mut outbox);
            }
            _ = keepalive.tick() => {
                if upstream.commands.try_send(UpstreamCommand::Ping).is_err() {
                    debug!("Upstream keepalive skipped");
                }
                if client_tx.send(ClientRoute::Ping).await.is_err() {
                    break (close_code::NORMAL, "client gone");
                }
            }
        }
    };

    // Teardown runs in the same order no matter which side ended the session.
    flush(&mut outbox, &upstream.commands, &client_tx).await;
    router.teardown();
    upstream.shutdown().await;
    guard.release();

    let _ = client_tx
        .send(ClientRoute::Close { code, reason })
        .await;
    drop(client_tx);
    let mut sender_task = sender_task;
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }

    info!(connection_id = %guard.id(), reason, "Realtime session closed");
}

/// Deliver queued frames. Returns `false` once either side is gone.
async fn flush(
    outbox: &mut Outbox,
    upstream: &mpsc::Sender<UpstreamCommand>,
    client: &mpsc::Sender<ClientRoute>,
) -> bool {
    for item in outbox.drain() {
        match item {
            Outbound::Upstream(command) => {
                if upstream.send(command).await.is_err() {
                    debug!("Upstream command channel closed");
                    return false;
                }
            }
            Outbound::Client(text) => {
                if client.send(ClientRoute::Text(text)).await.is_err() {
                    debug!("Client channel closed");
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(user: Option<&str>, thread: Option<&str>) -> RealtimeQuery {
        RealtimeQuery {
            user_id: user.map(String::from),
            thread_id: thread.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_query_requires_both_identifiers() {
        assert!(query(Some("u1"), None).into_info().is_none());
        assert!(query(None, Some("t1")).into_info().is_none());
        assert!(query(Some("u1"), Some("  ")).into_info().is_none());

        let info = query(Some("u1"), Some("t1")).into_info().unwrap();
        assert_eq!(info.user_id, "u1");
        assert_eq!(info.thread_id, "t1");
        assert!(info.conversation_id.is_none());
    }

    #[test]
    fn test_query_accepts_snake_case_aliases() {
        let uri: axum::http::Uri = "/realtime?user_id=u1&thread_id=t1&conversationId=c1"
            .parse()
            .unwrap();
        let Query(q) = Query::<RealtimeQuery>::try_from_uri(&uri).unwrap();
        let info = q.into_info().unwrap();
        assert_eq!(info.user_id, "u1");
        assert_eq!(info.conversation_id.as_deref(), Some("c1"));
    }
}
