//! WebSocket client for the upstream realtime API.
//!
//! One [`OpenAIRealtimeConnector::connect`] call performs the handshake,
//! sends the initial `session.update`, and spawns a single pump task that
//! owns both halves of the socket. The task exits when the upstream closes,
//! on a socket error, on [`UpstreamCommand::Close`], or when the command
//! channel is dropped. There is no automatic reconnection: losing the
//! upstream tears the client connection down.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, warn};

use super::config::build_realtime_url;
use super::messages::{ClientEvent, SessionConfig};
use crate::core::realtime::base::{
    RealtimeConnector, RealtimeError, RealtimeResult, SessionParams, UpstreamCommand,
    UpstreamFrame, UpstreamSession,
};

/// Channel capacity for each direction of the pump.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Connector for the OpenAI-style realtime WebSocket protocol.
#[derive(Debug, Default, Clone)]
pub struct OpenAIRealtimeConnector;

impl OpenAIRealtimeConnector {
    pub fn new() -> Self {
        Self
    }

    fn build_request(
        params: &SessionParams,
    ) -> RealtimeResult<tokio_tungstenite::tungstenite::http::Request<()>> {
        let url = build_realtime_url(&params.url, &params.model)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", params.api_key))
            .map_err(|_| RealtimeError::InvalidConfiguration("API key is not a valid header".into()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        Ok(request)
    }
}

#[async_trait]
impl RealtimeConnector for OpenAIRealtimeConnector {
    async fn connect(&self, params: &SessionParams) -> RealtimeResult<UpstreamSession> {
        if params.api_key.is_empty() {
            return Err(RealtimeError::AuthenticationFailed("API key is required".into()));
        }

        let request = Self::build_request(params)?;

        let (ws_stream, _response) =
            tokio::time::timeout(params.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    RealtimeError::Timeout(format!(
                        "upstream handshake exceeded {:?}",
                        params.connect_timeout
                    ))
                })?
                .map_err(|e| match e {
                    tokio_tungstenite::tungstenite::Error::Http(resp)
                        if resp.status() == 401 || resp.status() == 403 =>
                    {
                        RealtimeError::AuthenticationFailed(format!("HTTP {}", resp.status()))
                    }
                    other => RealtimeError::ConnectionFailed(other.to_string()),
                })?;

        info!(model = %params.model, "Connected to upstream realtime API");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let handshake = ClientEvent::SessionUpdate {
            session: SessionConfig::from_params(params),
        };
        let json = serde_json::to_string(&handshake)
            .map_err(|e| RealtimeError::SerializationError(e.to_string()))?;
        ws_sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<UpstreamCommand>(WS_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel::<UpstreamFrame>(WS_CHANNEL_CAPACITY);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let outgoing = match cmd {
                            Some(UpstreamCommand::Event(event)) => match serde_json::to_string(&event) {
                                Ok(json) => Message::Text(json.into()),
                                Err(e) => {
                                    error!("Failed to serialize upstream event: {}", e);
                                    continue;
                                }
                            },
                            Some(UpstreamCommand::Forward(text)) => Message::Text(text.into()),
                            Some(UpstreamCommand::Ping) => Message::Ping(Default::default()),
                            Some(UpstreamCommand::Close) | None => {
                                let _ = ws_sink.send(Message::Close(None)).await;
                                break;
                            }
                        };
                        if let Err(e) = ws_sink.send(outgoing).await {
                            warn!("Failed to send upstream message: {}", e);
                            break;
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => match UpstreamFrame::parse(text.as_str()) {
                                Ok(frame) => {
                                    if frame_tx.send(frame).await.is_err() {
                                        debug!("Upstream frame receiver dropped");
                                        break;
                                    }
                                }
                                Err(e) => warn!("Dropping malformed upstream frame: {}", e),
                            },
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!("Failed to send pong: {}", e);
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(?frame, "Upstream closed the session");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Upstream WebSocket error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Upstream pump stopped");
        });

        Ok(UpstreamSession {
            commands: cmd_tx,
            frames: frame_rx,
            task: Some(task),
        })
    }
}
