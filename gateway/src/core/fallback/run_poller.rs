//! Thread-based completions with bounded run polling.
//!
//! The prompt is appended to the connection's thread, a run is started
//! against the configured assistant, and the run is polled at a fixed
//! interval until it reaches a terminal status or the attempt budget runs
//! out.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{CompletionRequest, FallbackError, FallbackResult, TextCompleter, read_success_body};

/// Settings for [`AssistantRunCompleter`].
#[derive(Debug, Clone)]
pub struct RunPollerConfig {
    pub base_url: String,
    pub api_key: String,
    pub assistant_id: String,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Pending,
    Completed,
    Terminal,
}

fn classify(status: &str) -> RunPhase {
    match status {
        "completed" => RunPhase::Completed,
        "failed" | "cancelled" | "expired" | "incomplete" | "requires_action" => RunPhase::Terminal,
        _ => RunPhase::Pending,
    }
}

/// Text completer backed by assistant threads and polled runs.
#[derive(Debug, Clone)]
pub struct AssistantRunCompleter {
    http: Client,
    config: RunPollerConfig,
}

impl AssistantRunCompleter {
    pub fn new(config: RunPollerConfig) -> FallbackResult<Self> {
        if config.assistant_id.is_empty() {
            return Err(FallbackError::Configuration("assistant id is required".into()));
        }
        if config.max_attempts == 0 {
            return Err(FallbackError::Configuration("max_attempts must be > 0".into()));
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FallbackError::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .bearer_auth(&self.config.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        builder: reqwest::RequestBuilder,
    ) -> FallbackResult<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("Request failed: {e}")))?;
        let bytes = read_success_body(response).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FallbackError::InvalidResponse(format!("Failed to parse response: {e}")))
    }

    async fn wait_for_run(&self, thread_id: &str, run: Run) -> FallbackResult<()> {
        let mut status = run.status;
        for attempt in 1..=self.config.max_attempts {
            match classify(&status) {
                RunPhase::Completed => return Ok(()),
                RunPhase::Terminal => {
                    warn!(run_id = %run.id, %status, "Assistant run ended without completing");
                    return Err(FallbackError::RunTerminal {
                        run_id: run.id,
                        status,
                    });
                }
                RunPhase::Pending => {}
            }

            tokio::time::sleep(self.config.poll_interval).await;
            let polled: Run = Self::send_json(self.get(&format!(
                "threads/{thread_id}/runs/{}",
                run.id
            )))
            .await?;
            debug!(run_id = %run.id, attempt, status = %polled.status, "Polled assistant run");
            status = polled.status;
        }

        match classify(&status) {
            RunPhase::Completed => Ok(()),
            RunPhase::Terminal => Err(FallbackError::RunTerminal {
                run_id: run.id,
                status,
            }),
            RunPhase::Pending => Err(FallbackError::Timeout(format!(
                "run {} still {} after {} polls",
                run.id, status, self.config.max_attempts
            ))),
        }
    }
}

#[async_trait]
impl TextCompleter for AssistantRunCompleter {
    async fn complete(&self, request: &CompletionRequest) -> FallbackResult<String> {
        let thread_id = request
            .thread_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FallbackError::Configuration("thread id is required".into()))?;

        let response = self
            .post(&format!("threads/{thread_id}/messages"))
            .json(&json!({"role": "user", "content": request.prompt}))
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("Request failed: {e}")))?;
        read_success_body(response).await?;

        let run: Run = Self::send_json(
            self.post(&format!("threads/{thread_id}/runs"))
                .json(&json!({"assistant_id": self.config.assistant_id})),
        )
        .await?;
        info!(run_id = %run.id, thread_id, "Started assistant run");

        self.wait_for_run(thread_id, run).await?;

        let messages: MessageList = Self::send_json(
            self.get(&format!("threads/{thread_id}/messages"))
                .query(&[("order", "desc"), ("limit", "10")]),
        )
        .await?;

        messages
            .data
            .into_iter()
            .find(|m| m.role == "assistant")
            .map(|m| {
                m.content
                    .into_iter()
                    .filter_map(|c| c.text.map(|t| t.value))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| FallbackError::InvalidResponse("run produced no assistant message".into()))
    }
}
