//! Function-call dispatch: the bridge between model tool requests and tool
//! execution.
//!
//! Given the tool calls of one model response, the dispatcher:
//!
//! 1. Assigns framework ids (reserved `adk-` prefix) to calls missing one.
//! 2. Partitions calls into long-running and immediate.
//! 3. Runs immediate calls in parallel under bounded concurrency. Per-call
//!    failures become function responses with `error` set; sibling calls
//!    are not cancelled.
//! 4. Defers long-running calls: a `ToolCall` event records the id, the
//!    response arrives in a later invocation addressed by that id.
//! 5. Merges all responses into one composite tool-response event whose
//!    parts follow the originating call order.
//!
//! Two call names are handled without touching application code: the
//! credential-request tool (its auth configuration is echoed back to the
//! caller) and the agent-transfer tool (reported to the agent loop, which
//! ends the invocation).

use crate::context::InvocationContext;
use crate::event::{Event, EventActions, EventKind};
use crate::flow::TRANSFER_TO_AGENT_TOOL;
use crate::plugin::{Plugin, run_after_tool, run_before_tool};
use crate::tool::{CREDENTIAL_REQUEST_TOOL, Tool, ToolContext};
use crate::types::{Content, FunctionCall, FunctionResponse, Part};
use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Prefix of framework-generated call ids. Ids carrying this prefix are
/// scrubbed from model-visible history so they never leak to providers.
pub const RESERVED_CALL_ID_PREFIX: &str = "adk-";

/// Default bound on concurrently executing tool calls.
pub const DEFAULT_TOOL_CONCURRENCY: usize = 8;

/// Generates a fresh framework call id.
pub fn new_call_id() -> String {
    format!("{RESERVED_CALL_ID_PREFIX}{}", Uuid::new_v4())
}

/// Whether an id was generated by the framework.
pub fn is_framework_call_id(id: &str) -> bool {
    id.starts_with(RESERVED_CALL_ID_PREFIX)
}

/// Assigns fresh framework ids to calls that are missing one. Existing ids
/// are kept; they stay stable for the life of the call/response pair.
pub fn assign_call_ids(calls: &mut [FunctionCall]) {
    for call in calls {
        if call.id.is_none() {
            call.id = Some(new_call_id());
        }
    }
}

/// Assigns framework ids to every function-call part of a content.
pub fn assign_ids_in_content(content: &mut Content) {
    for part in &mut content.parts {
        if let Part::FunctionCall(call) = part {
            if call.id.is_none() {
                call.id = Some(new_call_id());
            }
        }
    }
}

/// Everything produced by dispatching one model response's tool calls.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// `ToolCall` events for deferred and transfer calls.
    pub tool_call_events: Vec<Event>,

    /// The merged tool-response event, when any immediate call ran.
    pub response_event: Option<Event>,

    /// Ids of calls deferred past this invocation.
    pub long_running_ids: Vec<String>,

    /// Target agent when the model requested a transfer.
    pub transfer_to: Option<String>,
}

/// Executes the tool calls of one model response.
#[derive(Debug, Clone)]
pub struct FunctionDispatcher {
    max_concurrency: usize,
}

impl Default for FunctionDispatcher {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_TOOL_CONCURRENCY,
        }
    }
}

impl FunctionDispatcher {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Dispatches `calls` against `tools`. Calls must already carry ids
    /// (see [`assign_call_ids`]). `state` is the session-state snapshot
    /// handed to each tool context.
    pub async fn dispatch(
        &self,
        calls: &[FunctionCall],
        tools: &HashMap<String, Arc<dyn Tool>>,
        plugins: &[Arc<dyn Plugin>],
        ctx: &InvocationContext,
        state: &HashMap<String, Value>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        // Futures for immediate calls, keyed by position so the merged
        // event preserves the originating call order.
        let mut immediate: Vec<(usize, &FunctionCall, Arc<dyn Tool>)> = Vec::new();
        // Responses produced without execution (transfer acks, credential
        // echoes, unknown tools, deferred markers are omitted entirely).
        let mut direct: Vec<(usize, FunctionResponse)> = Vec::new();

        for (position, call) in calls.iter().enumerate() {
            let call_id = call.id.clone().unwrap_or_default();

            if call.name == TRANSFER_TO_AGENT_TOOL {
                let target = call
                    .args
                    .get("agent_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                outcome.tool_call_events.push(
                    Event::new(
                        &ctx.invocation_id,
                        &ctx.agent_name,
                        &ctx.branch,
                        EventKind::ToolCall,
                    )
                    .with_content(Content::assistant(vec![Part::FunctionCall(call.clone())])),
                );
                direct.push((
                    position,
                    FunctionResponse::new(
                        &call_id,
                        &call.name,
                        json!({"status": "transferring", "agent_name": target}),
                    ),
                ));
                outcome.transfer_to = Some(target);
                continue;
            }

            if call.name == CREDENTIAL_REQUEST_TOOL {
                // Surface the auth configuration to the caller instead of
                // invoking application code.
                direct.push((
                    position,
                    FunctionResponse::new(
                        &call_id,
                        &call.name,
                        json!({"status": "credential_request", "auth_config": call.args}),
                    ),
                ));
                continue;
            }

            let Some(tool) = tools.get(&call.name) else {
                log::warn!("model requested unknown tool '{}'", call.name);
                direct.push((
                    position,
                    FunctionResponse::error(
                        &call_id,
                        &call.name,
                        format!("Tool '{}' not found", call.name),
                    ),
                ));
                continue;
            };

            if tool.is_long_running() {
                outcome.long_running_ids.push(call_id.clone());
                outcome.tool_call_events.push(
                    Event::new(
                        &ctx.invocation_id,
                        &ctx.agent_name,
                        &ctx.branch,
                        EventKind::ToolCall,
                    )
                    .with_content(Content::assistant(vec![Part::FunctionCall(call.clone())])),
                );

                // Start the work detached; the response arrives in a later
                // invocation as a user-supplied function response with the
                // same id.
                let tool = Arc::clone(tool);
                let args = call.args.clone();
                let tool_ctx = ToolContext::new(
                    &ctx.invocation_id,
                    &ctx.agent_name,
                    &ctx.branch,
                    &call_id,
                    state.clone(),
                );
                tokio::spawn(async move {
                    if let Err(err) = tool.execute(args, tool_ctx).await {
                        log::warn!("long-running tool '{}' failed: {}", tool.name(), err);
                    }
                });
                continue;
            }

            immediate.push((position, call, Arc::clone(tool)));
        }

        // Run the immediate calls in parallel, bounded, preserving order.
        let executions: Vec<BoxFuture<'_, (usize, FunctionResponse, HashMap<String, Value>)>> =
            immediate
                .into_iter()
                .map(|(position, call, tool)| {
                    let fut = async move {
                        let (response, delta) =
                            self.execute_one(call, tool, plugins, ctx, state).await;
                        (position, response, delta)
                    };
                    Box::pin(fut) as BoxFuture<'_, _>
                })
                .collect();

        let executed: Vec<(usize, FunctionResponse, HashMap<String, Value>)> =
            futures::stream::iter(executions)
                .buffered(self.max_concurrency)
                .collect()
                .await;

        let mut state_delta: HashMap<String, Value> = HashMap::new();
        let mut responses: Vec<(usize, FunctionResponse)> = direct;
        for (position, response, delta) in executed {
            state_delta.extend(delta);
            responses.push((position, response));
        }
        responses.sort_by_key(|(position, _)| *position);

        if !responses.is_empty() {
            let parts = responses
                .into_iter()
                .map(|(_, response)| Part::FunctionResponse(response))
                .collect();
            let mut actions = EventActions {
                state_delta,
                ..Default::default()
            };
            if outcome.transfer_to.is_some() {
                actions.transfer_to_agent = outcome.transfer_to.clone();
            }
            outcome.response_event = Some(
                Event::new(
                    &ctx.invocation_id,
                    &ctx.agent_name,
                    &ctx.branch,
                    EventKind::ToolResponse,
                )
                .with_content(Content::tool(parts))
                .with_actions(actions),
            );
        }

        outcome
    }

    /// Runs one immediate call through the plugin hooks and the tool.
    async fn execute_one(
        &self,
        call: &FunctionCall,
        tool: Arc<dyn Tool>,
        plugins: &[Arc<dyn Plugin>],
        ctx: &InvocationContext,
        state: &HashMap<String, Value>,
    ) -> (FunctionResponse, HashMap<String, Value>) {
        let call_id = call.id.clone().unwrap_or_default();
        let mut args = call.args.clone();

        match run_before_tool(plugins, &call.name, &args, ctx).await {
            Ok(Some(decision)) => {
                if !decision.proceed {
                    let reason = decision
                        .reason
                        .unwrap_or_else(|| "blocked by plugin".to_string());
                    return (
                        FunctionResponse::error(&call_id, &call.name, reason),
                        HashMap::new(),
                    );
                }
                if let Some(modified) = decision.modified_args {
                    args = modified;
                }
            }
            Ok(None) => {}
            Err(err) => {
                // Plugin failures never abort the run
                log::warn!("before_tool plugin failed for '{}': {}", call.name, err);
            }
        }

        let tool_ctx = ToolContext::new(
            &ctx.invocation_id,
            &ctx.agent_name,
            &ctx.branch,
            &call_id,
            state.clone(),
        );

        let mut response = match tool.execute(args, tool_ctx.clone()).await {
            Ok(result) => FunctionResponse::new(&call_id, &call.name, result),
            Err(err) => {
                log::debug!("tool '{}' failed: {}", call.name, err);
                FunctionResponse::error(&call_id, &call.name, err.to_string())
            }
        };

        match run_after_tool(plugins, &call.name, &response.content, ctx).await {
            Ok(Some(decision)) => {
                if let Some(modified) = decision.modified_result {
                    response.content = modified;
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("after_tool plugin failed for '{}': {}", call.name, err);
            }
        }

        (response, tool_ctx.take_state_delta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentTree;
    use crate::session::InMemorySessionService;
    use crate::tool::function_tool;
    use std::time::Duration;

    fn test_ctx() -> InvocationContext {
        let service = InMemorySessionService::new_shared();
        InvocationContext::new(
            "app",
            "u1",
            "s1",
            "tester",
            Content::user("hi"),
            service,
            Arc::new(AgentTree::empty()),
        )
    }

    fn tool_map(tools: Vec<Arc<dyn Tool>>) -> HashMap<String, Arc<dyn Tool>> {
        tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect()
    }

    #[test]
    fn test_assign_call_ids() {
        let mut calls = vec![
            FunctionCall::new("a", json!({})),
            FunctionCall::with_id("user-id", "b", json!({})),
        ];
        assign_call_ids(&mut calls);
        assert!(is_framework_call_id(calls[0].id.as_deref().unwrap()));
        assert_eq!(calls[1].id.as_deref(), Some("user-id"));
    }

    #[tokio::test]
    async fn test_merged_responses_preserve_call_order() {
        // The slow tool is listed first; its response must still come first
        let slow: Arc<dyn Tool> = Arc::new(
            function_tool("slow", "Slow tool").build(|_, _| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(json!("slow done"))
            }),
        );
        let fast: Arc<dyn Tool> = Arc::new(
            function_tool("fast", "Fast tool").build(|_, _| async { Ok(json!("fast done")) }),
        );

        let mut calls = vec![
            FunctionCall::new("slow", json!({})),
            FunctionCall::new("fast", json!({})),
        ];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &tool_map(vec![slow, fast]), &[], &ctx, &HashMap::new())
            .await;

        let event = outcome.response_event.unwrap();
        let responses = event.content.as_ref().unwrap().function_responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].name, "slow");
        assert_eq!(responses[1].name, "fast");
        assert_eq!(responses[0].id, calls[0].id);
        assert_eq!(responses[1].id, calls[1].id);
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_error_response() {
        let failing: Arc<dyn Tool> = Arc::new(
            function_tool("explode", "Always fails")
                .build(|_, _| async { Err(crate::Error::tool("boom")) }),
        );
        let ok: Arc<dyn Tool> =
            Arc::new(function_tool("ok", "Works").build(|_, _| async { Ok(json!(1)) }));

        let mut calls = vec![
            FunctionCall::new("explode", json!({})),
            FunctionCall::new("ok", json!({})),
        ];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &tool_map(vec![failing, ok]), &[], &ctx, &HashMap::new())
            .await;

        let event = outcome.response_event.unwrap();
        let responses = event.content.as_ref().unwrap().function_responses();
        assert!(responses[0].is_error());
        // Sibling call is not cancelled
        assert!(!responses[1].is_error());
        assert_eq!(responses[1].content, json!(1));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let mut calls = vec![FunctionCall::new("missing", json!({}))];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &HashMap::new(), &[], &ctx, &HashMap::new())
            .await;

        let event = outcome.response_event.unwrap();
        let responses = event.content.as_ref().unwrap().function_responses();
        assert!(responses[0].is_error());
        assert!(responses[0].error.as_ref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_long_running_deferred() {
        let pending: Arc<dyn Tool> = Arc::new(
            function_tool("bg_job", "Background job")
                .long_running(true)
                .build(|_, _| async { Ok(json!({"started": true})) }),
        );

        let mut calls = vec![FunctionCall::new("bg_job", json!({}))];
        assign_call_ids(&mut calls);
        let call_id = calls[0].id.clone().unwrap();

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &tool_map(vec![pending]), &[], &ctx, &HashMap::new())
            .await;

        assert_eq!(outcome.long_running_ids, vec![call_id]);
        assert_eq!(outcome.tool_call_events.len(), 1);
        // No immediate response is merged for a deferred call
        assert!(outcome.response_event.is_none());
    }

    #[tokio::test]
    async fn test_credential_request_is_not_executed() {
        let mut calls = vec![FunctionCall::new(
            CREDENTIAL_REQUEST_TOOL,
            json!({"scheme": "oauth2", "scopes": ["calendar"]}),
        )];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &HashMap::new(), &[], &ctx, &HashMap::new())
            .await;

        let event = outcome.response_event.unwrap();
        let responses = event.content.as_ref().unwrap().function_responses();
        assert_eq!(responses[0].content["status"], "credential_request");
        assert_eq!(responses[0].content["auth_config"]["scheme"], "oauth2");
    }

    #[tokio::test]
    async fn test_transfer_call_reported() {
        let mut calls = vec![FunctionCall::new(
            TRANSFER_TO_AGENT_TOOL,
            json!({"agent_name": "greeter"}),
        )];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &HashMap::new(), &[], &ctx, &HashMap::new())
            .await;

        assert_eq!(outcome.transfer_to.as_deref(), Some("greeter"));
        assert_eq!(outcome.tool_call_events.len(), 1);
        let event = outcome.response_event.unwrap();
        assert_eq!(
            event.actions.transfer_to_agent.as_deref(),
            Some("greeter")
        );
    }

    #[tokio::test]
    async fn test_state_delta_merged_into_response_event() {
        let counter: Arc<dyn Tool> = Arc::new(
            function_tool("count", "Counts visits").build(|_, ctx| async move {
                ctx.set_state("visits", json!(7));
                Ok(json!("counted"))
            }),
        );

        let mut calls = vec![FunctionCall::new("count", json!({}))];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let outcome = FunctionDispatcher::default()
            .dispatch(&calls, &tool_map(vec![counter]), &[], &ctx, &HashMap::new())
            .await;

        let event = outcome.response_event.unwrap();
        assert_eq!(event.actions.state_delta["visits"], json!(7));
    }

    #[tokio::test]
    async fn test_plugin_block_and_rewrite() {
        use crate::plugin::ToolDecision;
        use async_trait::async_trait;

        struct Gate;
        #[async_trait]
        impl Plugin for Gate {
            fn name(&self) -> &str {
                "gate"
            }
            async fn before_tool(
                &self,
                tool_name: &str,
                _args: &Value,
                _ctx: &InvocationContext,
            ) -> crate::Result<Option<ToolDecision>> {
                if tool_name == "dangerous" {
                    Ok(Some(ToolDecision::block("not allowed")))
                } else {
                    Ok(None)
                }
            }
            async fn after_tool(
                &self,
                _tool_name: &str,
                _result: &Value,
                _ctx: &InvocationContext,
            ) -> crate::Result<Option<ToolDecision>> {
                Ok(Some(ToolDecision::modify_result(json!("redacted"), "policy")))
            }
        }

        let dangerous: Arc<dyn Tool> = Arc::new(
            function_tool("dangerous", "Blocked").build(|_, _| async { Ok(json!("ran")) }),
        );
        let safe: Arc<dyn Tool> =
            Arc::new(function_tool("safe", "Allowed").build(|_, _| async { Ok(json!("ran")) }));

        let mut calls = vec![
            FunctionCall::new("dangerous", json!({})),
            FunctionCall::new("safe", json!({})),
        ];
        assign_call_ids(&mut calls);

        let ctx = test_ctx();
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(Gate)];
        let outcome = FunctionDispatcher::default()
            .dispatch(
                &calls,
                &tool_map(vec![dangerous, safe]),
                &plugins,
                &ctx,
                &HashMap::new(),
            )
            .await;

        let event = outcome.response_event.unwrap();
        let responses = event.content.as_ref().unwrap().function_responses();
        assert!(responses[0].is_error());
        assert_eq!(responses[0].error.as_deref(), Some("not allowed"));
        assert_eq!(responses[1].content, json!("redacted"));
    }
}
