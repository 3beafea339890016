//! Streams function calls out of the upstream and results back in.
//!
//! The upstream announces a call (`response.output_item.added`), streams its
//! JSON arguments in fragments, then marks them done. Entries are keyed by
//! item id, but results are always submitted against the call id recorded
//! when the call was announced.
//!
//! The upstream accepts one active response at a time. A result that comes
//! back while the response that asked for it is still streaming is queued
//! and submitted, with a single continuation request, at `response.done`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::state::{FunctionCallAccumulator, QueuedToolOutput, SessionState};
use super::tasks::ConnectionTasks;
use super::{InternalEvent, Outbox, turn};
use crate::core::realtime::openai::{ClientEvent, ConversationItem, audio_modalities};
use crate::core::tools::{ToolContext, ToolExecutor};
use crate::handlers::realtime::messages::GatewayEvent;

/// A completed call ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInvocation {
    pub name: String,
    pub call_id: String,
    /// Parsed arguments, or why they could not be parsed
    pub arguments: Result<Value, String>,
}

/// `response.output_item.added` for a function call.
pub fn on_call_added(state: &mut SessionState, item: &ConversationItem) {
    let Some(item_id) = item.id.clone() else {
        warn!("Function call announced without an item id");
        return;
    };
    let entry = FunctionCallAccumulator {
        name: item.name.clone().unwrap_or_default(),
        call_id: item.call_id.clone().unwrap_or_default(),
        arguments: String::new(),
    };
    debug!(item_id = %item_id, call_id = %entry.call_id, name = %entry.name, "Function call started");
    state.function_calls.insert(item_id, entry);
}

/// `response.function_call_arguments.delta`: buffer without validating.
pub fn on_arguments_delta(state: &mut SessionState, item_id: &str, delta: &str) {
    match state.function_calls.get_mut(item_id) {
        Some(entry) => entry.arguments.push_str(delta),
        None => debug!(item_id, "Arguments delta for unknown function call"),
    }
}

/// `response.function_call_arguments.done`: close the entry and parse.
pub fn on_arguments_done(
    state: &mut SessionState,
    item_id: &str,
    call_id: Option<&str>,
    arguments: &str,
) -> Option<PendingInvocation> {
    let entry = match state.function_calls.remove(item_id) {
        Some(entry) => entry,
        None => {
            let call_id = call_id.filter(|c| !c.is_empty())?;
            warn!(item_id, call_id, "Arguments done for a call that was never announced");
            return Some(PendingInvocation {
                name: String::new(),
                call_id: call_id.to_string(),
                arguments: Err("function call was never announced".to_string()),
            });
        }
    };

    let call_id = if entry.call_id.is_empty() {
        call_id.unwrap_or_default().to_string()
    } else {
        entry.call_id
    };
    if call_id.is_empty() {
        warn!(item_id, "Function call has no call id, result cannot be submitted");
        return None;
    }

    let raw = if arguments.is_empty() {
        entry.arguments
    } else {
        arguments.to_string()
    };
    let parsed = if raw.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(&raw).map_err(|e| e.to_string())
    };

    Some(PendingInvocation {
        name: entry.name,
        call_id,
        arguments: parsed,
    })
}

/// Run the tool in the background; the result comes back as
/// [`InternalEvent::ToolCompleted`].
pub fn spawn_invocation(
    tasks: &mut ConnectionTasks,
    executor: Arc<dyn ToolExecutor>,
    ctx: ToolContext,
    invocation: PendingInvocation,
) {
    let events = tasks.events();
    tasks.spawn(async move {
        let PendingInvocation {
            name,
            call_id,
            arguments,
        } = invocation;

        let output = match arguments {
            Err(message) => json!({ "error": format!("Invalid tool arguments: {message}") }),
            Ok(args) => {
                let call = AssertUnwindSafe(executor.execute(&name, args, &ctx)).catch_unwind();
                match call.await {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => json!({ "error": e.to_string() }),
                    Err(_) => json!({ "error": "tool execution panicked" }),
                }
            }
        };

        let _ = events
            .send(InternalEvent::ToolCompleted {
                call_id,
                name,
                output,
            })
            .await;
    });
}

/// Citation list carried by a tool result, if any.
pub fn extract_citations(output: &Value) -> Option<Value> {
    ["citations", "sources"]
        .iter()
        .filter_map(|key| output.get(*key))
        .find(|v| v.as_array().is_some_and(|a| !a.is_empty()))
        .cloned()
}

fn output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Submit a tool result upstream and ask for a spoken continuation, or
/// queue it while a response is still active.
pub fn on_tool_completed(
    state: &mut SessionState,
    call_id: &str,
    name: &str,
    output: &Value,
    out: &mut Outbox,
) {
    if let Some(citations) = extract_citations(output) {
        out.client(&GatewayEvent::AssistantCitations {
            citations,
            response_id: None,
        });
    }

    let failed = output.get("error").is_some();
    state.queued_tool_outputs.push(QueuedToolOutput {
        call_id: call_id.to_string(),
        output: output_text(output),
    });

    if let Some(response_id) = &state.turn.active_response {
        debug!(call_id, tool = name, failed, response_id = %response_id, "Tool result queued until response is done");
        return;
    }
    info!(call_id, tool = name, failed, "Submitting tool result");
    submit_queued_outputs(state, out);
}

/// Submit every queued result followed by one continuation request.
/// Called once the active response is done.
pub fn submit_queued_outputs(state: &mut SessionState, out: &mut Outbox) {
    if state.queued_tool_outputs.is_empty() {
        return;
    }
    for queued in state.queued_tool_outputs.drain(..) {
        debug!(call_id = %queued.call_id, "Submitting tool output");
        out.upstream(ClientEvent::function_output(&queued.call_id, queued.output));
    }
    out.upstream(ClientEvent::response_with_modalities(audio_modalities()));
    turn::on_response_requested(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::ToolDefinition;
    use crate::core::realtime::UpstreamCommand;
    use crate::core::tools::ToolError;
    use crate::session::{ConnectionInfo, Outbound};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn state() -> SessionState {
        SessionState::new(
            ConnectionInfo {
                user_id: "u1".into(),
                thread_id: "t1".into(),
                conversation_id: None,
                tenant_id: None,
            },
            24000,
        )
    }

    fn call_item(item_id: &str, call_id: &str, name: &str) -> ConversationItem {
        ConversationItem {
            id: Some(item_id.into()),
            item_type: "function_call".into(),
            call_id: Some(call_id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    struct Echo;

    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
            match name {
                "fail" => Err(ToolError::Execution("backend down".into())),
                "explode" => panic!("boom"),
                _ => Ok(json!({"tool": name, "args": args, "user": ctx.user_id})),
            }
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    #[test]
    fn test_accumulates_and_uses_recorded_call_id() {
        let mut s = state();
        on_call_added(&mut s, &call_item("item_1", "call_A", "search"));
        on_arguments_delta(&mut s, "item_1", "{\"city\":");
        on_arguments_delta(&mut s, "item_1", "\"Lyon\"}");

        // The done event carries a different call id; the recorded one wins.
        let inv = on_arguments_done(&mut s, "item_1", Some("call_B"), "").unwrap();
        assert_eq!(inv.call_id, "call_A");
        assert_ne!(inv.call_id, "item_1");
        assert_eq!(inv.name, "search");
        assert_eq!(inv.arguments, Ok(json!({"city": "Lyon"})));
        assert!(s.function_calls.is_empty());
    }

    #[test]
    fn test_done_arguments_take_precedence() {
        let mut s = state();
        on_call_added(&mut s, &call_item("item_1", "call_A", "search"));
        on_arguments_delta(&mut s, "item_1", "{\"ci");
        let inv = on_arguments_done(&mut s, "item_1", None, "{\"city\":\"Nice\"}").unwrap();
        assert_eq!(inv.arguments, Ok(json!({"city": "Nice"})));
    }

    #[test]
    fn test_invalid_json_is_an_error_not_a_panic() {
        let mut s = state();
        on_call_added(&mut s, &call_item("item_1", "call_A", "search"));
        on_arguments_delta(&mut s, "item_1", "{\"city\": ");
        let inv = on_arguments_done(&mut s, "item_1", None, "").unwrap();
        assert!(inv.arguments.is_err());
    }

    #[test]
    fn test_empty_arguments_are_an_empty_object() {
        let mut s = state();
        on_call_added(&mut s, &call_item("item_1", "call_A", "ping"));
        let inv = on_arguments_done(&mut s, "item_1", None, "").unwrap();
        assert_eq!(inv.arguments, Ok(json!({})));
    }

    #[test]
    fn test_unannounced_call_still_gets_an_answer() {
        let mut s = state();
        let inv = on_arguments_done(&mut s, "item_x", Some("call_X"), "{}").unwrap();
        assert_eq!(inv.call_id, "call_X");
        assert!(inv.arguments.is_err());

        assert!(on_arguments_done(&mut s, "item_y", None, "{}").is_none());
    }

    #[tokio::test]
    async fn test_execution_results_and_failures_are_posted() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut tasks = ConnectionTasks::new(tx);
        let ctx = ToolContext {
            user_id: "u1".into(),
        };
        let executor: Arc<dyn ToolExecutor> = Arc::new(Echo);

        for (name, args) in [
            ("search", Ok(json!({"q": 1}))),
            ("fail", Ok(json!({}))),
            ("explode", Ok(json!({}))),
            ("search", Err("expected value".to_string())),
        ] {
            spawn_invocation(
                &mut tasks,
                Arc::clone(&executor),
                ctx.clone(),
                PendingInvocation {
                    name: name.into(),
                    call_id: format!("call_{name}"),
                    arguments: args,
                },
            );
        }

        let mut outputs = Vec::new();
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                InternalEvent::ToolCompleted { call_id, output, .. } => outputs.push((call_id, output)),
                other => panic!("unexpected event {other:?}"),
            }
        }

        let find = |id: &str| outputs.iter().filter(|(c, _)| c == id).map(|(_, o)| o.clone()).collect::<Vec<_>>();
        assert!(find("call_search").contains(&json!({"tool": "search", "args": {"q": 1}, "user": "u1"})));
        assert!(find("call_search").iter().any(|o| o["error"].as_str().unwrap_or("").contains("Invalid tool arguments")));
        assert_eq!(find("call_fail")[0], json!({"error": "Tool execution failed: backend down"}));
        assert_eq!(find("call_explode")[0], json!({"error": "tool execution panicked"}));
    }

    #[test]
    fn test_completion_submits_output_then_spoken_continuation() {
        let mut s = state();
        let mut out = Outbox::new();
        let output = json!({"answer": 42, "citations": [{"title": "Doc", "url": "https://x"}]});

        on_tool_completed(&mut s, "call_A", "search", &output, &mut out);

        let items: Vec<_> = out.drain().collect();
        assert_eq!(items.len(), 3);
        match &items[0] {
            Outbound::Client(json) => {
                let v: Value = serde_json::from_str(json).unwrap();
                assert_eq!(v["type"], "assistant.citations");
                assert_eq!(v["citations"][0]["title"], "Doc");
            }
            other => panic!("expected citations, got {other:?}"),
        }
        match &items[1] {
            Outbound::Upstream(UpstreamCommand::Event(ClientEvent::ConversationItemCreate { item, .. })) => {
                assert_eq!(item.call_id.as_deref(), Some("call_A"));
                assert_eq!(item.item_type, "function_call_output");
            }
            other => panic!("expected function output, got {other:?}"),
        }
        match &items[2] {
            Outbound::Upstream(UpstreamCommand::Event(event)) => {
                assert_eq!(*event, ClientEvent::response_with_modalities(audio_modalities()));
            }
            other => panic!("expected response.create, got {other:?}"),
        }
        assert!(s.turn.awaiting_response());
        assert!(s.queued_tool_outputs.is_empty());
    }

    #[test]
    fn test_results_wait_for_active_response() {
        let mut s = state();
        let mut out = Outbox::new();
        s.turn.active_response = Some("r1".into());

        on_tool_completed(&mut s, "call_A", "search", &json!({"a": 1}), &mut out);
        on_tool_completed(&mut s, "call_B", "fail", &json!({"error": "x"}), &mut out);
        assert!(out.is_empty());
        assert_eq!(s.queued_tool_outputs.len(), 2);

        s.turn.active_response = None;
        submit_queued_outputs(&mut s, &mut out);

        let events: Vec<_> = out
            .drain()
            .filter_map(|o| match o {
                Outbound::Upstream(UpstreamCommand::Event(e)) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(events.len(), 3);
        let call_ids: Vec<_> = events[..2]
            .iter()
            .filter_map(|e| match e {
                ClientEvent::ConversationItemCreate { item, .. } => item.call_id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(call_ids, vec!["call_A".to_string(), "call_B".to_string()]);
        assert_eq!(events[2], ClientEvent::response_with_modalities(audio_modalities()));
        assert!(s.queued_tool_outputs.is_empty());

        // Nothing queued: nothing sent.
        submit_queued_outputs(&mut s, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_extract_citations() {
        assert!(extract_citations(&json!({"citations": []})).is_none());
        assert!(extract_citations(&json!("text")).is_none());
        assert_eq!(
            extract_citations(&json!({"sources": [{"id": 1}]})),
            Some(json!([{"id": 1}]))
        );
    }
}
