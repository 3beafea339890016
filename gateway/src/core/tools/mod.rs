//! Tool executor seam.
//!
//! The gateway does not know what a tool does. It hands the function name,
//! parsed arguments and caller context to a [`ToolExecutor`] and relays
//! whatever JSON comes back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::core::realtime::ToolDefinition;

/// Errors raised while executing a tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool timed out after {0:?}")]
    Timeout(Duration),
}

/// Caller context passed alongside every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub user_id: String,
}

/// Executes named tools on behalf of the upstream model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;

    /// Tool schema advertised in the session handshake.
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// Executor used when no tool backend is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopToolExecutor;

#[async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn execute(&self, name: &str, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Err(ToolError::UnknownTool(name.to_string()))
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// Forwards invocations to an HTTP endpoint as
/// `{"name": ..., "arguments": ..., "context": {"userId": ...}}`.
#[derive(Debug, Clone)]
pub struct HttpToolExecutor {
    http: Client,
    endpoint: String,
    timeout: Duration,
    definitions: Vec<ToolDefinition>,
}

impl HttpToolExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        definitions: Vec<ToolDefinition>,
    ) -> Result<Self, ToolError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Execution(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout,
            definitions,
        })
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let body = json!({
            "name": name,
            "arguments": args,
            "context": ctx,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(self.timeout)
                } else {
                    ToolError::Execution(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("Failed to read response: {e}")))?;

        if status.as_u16() == 404 {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        if !status.is_success() {
            return Err(ToolError::Execution(format!("HTTP {status}: {text}")));
        }

        debug!(tool = name, bytes = text.len(), "Tool executed");

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

/// Shared handle type stored in application state.
pub type SharedToolExecutor = Arc<dyn ToolExecutor>;

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ToolContext {
        ToolContext {
            user_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_http_executor_posts_name_args_and_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools"))
            .and(body_json(json!({
                "name": "search_listings",
                "arguments": {"city": "Lyon"},
                "context": {"userId": "u1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let executor =
            HttpToolExecutor::new(format!("{}/tools", server.uri()), Duration::from_secs(5), vec![])
                .unwrap();
        let result = executor
            .execute("search_listings", json!({"city": "Lyon"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_http_executor_maps_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let executor = HttpToolExecutor::new(server.uri(), Duration::from_secs(5), vec![]).unwrap();
        let err = executor.execute("x", Value::Null, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_http_executor_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let executor =
            HttpToolExecutor::new(server.uri(), Duration::from_millis(50), vec![]).unwrap();
        let err = executor.execute("slow", Value::Null, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_noop_executor_rejects_everything() {
        let err = NoopToolExecutor.execute("anything", Value::Null, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "anything"));
        assert!(NoopToolExecutor.definitions().is_empty());
    }
}
