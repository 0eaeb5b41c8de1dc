//! The request/response processor pipeline.
//!
//! A model request is never assembled in one place. Each iteration starts
//! from an empty [`LlmRequest`] and runs it through the flow's ordered
//! request processors, each performing a targeted mutation:
//!
//! 1. **Basic** - model id, generation config, safety settings, tool
//!    declarations.
//! 2. **Instructions** - the root agent's global instruction and the
//!    current agent's instruction, resolved canonically and templated
//!    against session state.
//! 3. **Identity** - who the agent is, for self-reference in answers.
//! 4. **Contents** - the history view materialized from the session log.
//! 5. **Agent transfer** (AutoFlow only) - the virtual
//!    `transfer_to_agent` tool with its allowed targets.
//!
//! Response processors mirror the request side and may rewrite a response
//! before the dispatcher sees it.
//!
//! [`Flow::single`] wires processors 1-4; [`Flow::auto`] adds transfer.
//!
//! ## History view
//!
//! [`build_history_view`] turns an event log into the content list a model
//! sees: branch filtering first (peer sub-agent chatter is hidden), then
//! event-to-content mapping, then the async function-response rearrangement
//! that moves each response directly after its originating call, and
//! finally the scrub that strips framework-generated call ids. The whole
//! construction is a view; the event log itself is never mutated, and
//! applying the construction twice yields the same list.

use crate::agent::LlmAgent;
use crate::context::{InvocationContext, trim_history};
use crate::dispatcher::is_framework_call_id;
use crate::error::Result;
use crate::event::{Event, EventKind, branch_visible};
use crate::instruction::inject_session_state;
use crate::model::{Llm, LlmRequest, LlmResponse, ToolDeclaration};
use crate::session::Session;
use crate::tool::Tool;
use crate::types::{Content, Part};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Name of the virtual transfer tool declared by [`AgentTransferProcessor`].
pub const TRANSFER_TO_AGENT_TOOL: &str = "transfer_to_agent";

/// A mutation step applied to an outgoing model request.
///
/// Processors run in declared order, may append events (yielded and
/// recorded before the model call), and may end the invocation through the
/// context.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Applies this processor's mutation to `request`.
    async fn process(
        &self,
        agent: &LlmAgent,
        ctx: &InvocationContext,
        session: &Session,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>>;
}

/// A mutation step applied to a model response before dispatch.
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Applies this processor's mutation to `response`.
    async fn process(
        &self,
        agent: &LlmAgent,
        ctx: &InvocationContext,
        response: &mut LlmResponse,
    ) -> Result<Vec<Event>>;
}

/// An ordered processor chain.
#[derive(Clone)]
pub struct Flow {
    name: &'static str,
    request_processors: Vec<Arc<dyn RequestProcessor>>,
    response_processors: Vec<Arc<dyn ResponseProcessor>>,
}

impl Flow {
    /// The flow for a self-contained agent: itself and its tools, no
    /// transfer.
    pub fn single() -> Self {
        Self {
            name: "single",
            request_processors: vec![
                Arc::new(BasicProcessor),
                Arc::new(InstructionsProcessor),
                Arc::new(IdentityProcessor),
                Arc::new(ContentsProcessor),
            ],
            response_processors: Vec::new(),
        }
    }

    /// [`Flow::single`] plus agent transfer.
    pub fn auto() -> Self {
        let mut flow = Self::single();
        flow.name = "auto";
        flow.request_processors.push(Arc::new(AgentTransferProcessor));
        flow
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn request_processors(&self) -> &[Arc<dyn RequestProcessor>] {
        &self.request_processors
    }

    pub fn response_processors(&self) -> &[Arc<dyn ResponseProcessor>] {
        &self.response_processors
    }

    /// Appends a custom request processor to the chain.
    pub fn with_request_processor(mut self, processor: Arc<dyn RequestProcessor>) -> Self {
        self.request_processors.push(processor);
        self
    }

    /// Appends a custom response processor to the chain.
    pub fn with_response_processor(mut self, processor: Arc<dyn ResponseProcessor>) -> Self {
        self.response_processors.push(processor);
        self
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field(
                "request_processors",
                &self
                    .request_processors
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>(),
            )
            .field(
                "response_processors",
                &self
                    .response_processors
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ============================================================================
// REQUEST PROCESSORS
// ============================================================================

/// Sets model id, generation config, safety settings, and tool
/// declarations.
pub struct BasicProcessor;

#[async_trait]
impl RequestProcessor for BasicProcessor {
    fn name(&self) -> &str {
        "basic"
    }

    async fn process(
        &self,
        agent: &LlmAgent,
        _ctx: &InvocationContext,
        _session: &Session,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        request.model = agent.model().name().to_string();
        request.generation_config = agent.generation_config().cloned();
        request.safety_settings = agent.safety_settings().to_vec();

        for tool in agent.tools() {
            request.declare_tool(ToolDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            });
        }
        Ok(Vec::new())
    }
}

/// Resolves the root agent's global instruction and the current agent's
/// instruction, templating both against session state unless the provider
/// bypasses injection.
pub struct InstructionsProcessor;

#[async_trait]
impl RequestProcessor for InstructionsProcessor {
    fn name(&self) -> &str {
        "instructions"
    }

    async fn process(
        &self,
        agent: &LlmAgent,
        ctx: &InvocationContext,
        session: &Session,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        use crate::agent::BaseAgent;

        let readonly = ctx.readonly(session.state.clone());

        let global = match ctx.tree().root_agent() {
            Some(root) => root.canonical_global_instruction(&readonly),
            // Without a tree the current agent is its own root
            None => agent.canonical_global_instruction(&readonly),
        };
        if let Some(global) = global {
            let text = if global.bypass_state_injection {
                global.text
            } else {
                inject_session_state(&global.text, &session.state)
            };
            request.append_instruction(&text);
        }

        if let Some(instruction) = agent.canonical_instruction(&readonly) {
            let text = if instruction.bypass_state_injection {
                instruction.text
            } else {
                inject_session_state(&instruction.text, &session.state)
            };
            request.append_instruction(&text);
        }

        Ok(Vec::new())
    }
}

/// Tells the model who it is.
pub struct IdentityProcessor;

#[async_trait]
impl RequestProcessor for IdentityProcessor {
    fn name(&self) -> &str {
        "identity"
    }

    async fn process(
        &self,
        agent: &LlmAgent,
        _ctx: &InvocationContext,
        _session: &Session,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        use crate::agent::BaseAgent;

        let mut identity = format!(
            "You are an agent. Your internal name is \"{}\".",
            agent.name()
        );
        if !agent.description().is_empty() {
            identity.push_str(&format!("\nThe description about you is \"{}\".", agent.description()));
        }
        request.append_instruction(&identity);
        Ok(Vec::new())
    }
}

/// Materializes the history view into `request.contents`.
pub struct ContentsProcessor;

#[async_trait]
impl RequestProcessor for ContentsProcessor {
    fn name(&self) -> &str {
        "contents"
    }

    async fn process(
        &self,
        agent: &LlmAgent,
        ctx: &InvocationContext,
        session: &Session,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        use crate::agent::IncludeContents;

        let mut contents = match agent.include_contents() {
            IncludeContents::Default => build_history_view(&session.events, &ctx.branch),
            // History suppressed: the model sees only the current turn
            IncludeContents::None => vec![ctx.user_content.clone()],
        };
        if let Some(max) = ctx.max_history_size {
            contents = trim_history(contents, max);
        }
        request.contents = contents;
        Ok(Vec::new())
    }
}

/// Declares the virtual `transfer_to_agent` tool (AutoFlow only).
///
/// Allowed targets are the agent's parent, its own sub-agents, and its
/// peers when the shared parent is an LLM agent and neither side opted
/// out of peer transfer.
pub struct AgentTransferProcessor;

#[async_trait]
impl RequestProcessor for AgentTransferProcessor {
    fn name(&self) -> &str {
        "agent_transfer"
    }

    async fn process(
        &self,
        agent: &LlmAgent,
        ctx: &InvocationContext,
        _session: &Session,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        use crate::agent::BaseAgent;

        let tree = ctx.tree();
        let mut targets: Vec<(String, String)> = Vec::new();

        if !agent.disallow_transfer_to_parent() {
            if let Some(parent) = tree.parent_agent(agent.name()) {
                targets.push((
                    parent.name().to_string(),
                    parent.description().to_string(),
                ));
            }
        }

        for child in agent.sub_agents() {
            targets.push((child.name().to_string(), child.description().to_string()));
        }

        if !agent.disallow_peer_transfer() {
            if let Some(parent) = tree.parent_agent(agent.name()) {
                if parent.is_llm_agent() {
                    for peer in parent.sub_agents() {
                        if peer.name() != agent.name() && !peer.disallow_peer_transfer() {
                            targets.push((
                                peer.name().to_string(),
                                peer.description().to_string(),
                            ));
                        }
                    }
                }
            }
        }

        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<&str> = targets.iter().map(|(name, _)| name.as_str()).collect();
        request.declare_tool(ToolDeclaration {
            name: TRANSFER_TO_AGENT_TOOL.to_string(),
            description: "Transfer the conversation to another agent better suited to handle the request.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "agent_name": {
                        "type": "string",
                        "enum": names,
                        "description": "Name of the agent to transfer to"
                    }
                },
                "required": ["agent_name"]
            }),
        });

        let mut section = String::from(
            "You can transfer the conversation to one of the following agents when they are better suited to answer:\n",
        );
        for (name, description) in &targets {
            if description.is_empty() {
                section.push_str(&format!("- {name}\n"));
            } else {
                section.push_str(&format!("- {name}: {description}\n"));
            }
        }
        section.push_str(&format!(
            "Call the \"{TRANSFER_TO_AGENT_TOOL}\" tool with the agent's name to hand off.",
        ));
        request.append_instruction(&section);

        Ok(Vec::new())
    }
}

// ============================================================================
// HISTORY VIEW
// ============================================================================

/// Builds the content list a model on `branch` should see from an event
/// log. The log itself is never mutated and the construction is
/// idempotent.
pub fn build_history_view(events: &[Event], branch: &str) -> Vec<Content> {
    let retained = events
        .iter()
        .filter(|event| branch_visible(&event.branch, branch));

    let mut contents: Vec<Content> = Vec::new();
    for event in retained {
        if let Some(content) = event_to_content(event) {
            // Delegation re-presents the triggering message on the child
            // branch; consecutive identical contents collapse to one.
            if contents.last() != Some(&content) {
                contents.push(content);
            }
        }
    }

    scrub_framework_ids(rearrange_async_function_responses(contents))
}

/// Maps one event to at most one content.
///
/// Conversation-bearing events map to their content. `ToolCall` events are
/// skipped (the call already appears in the model-response content), and
/// `AgentEnd` is skipped (its content repeats the last model response).
fn event_to_content(event: &Event) -> Option<Content> {
    match event.kind {
        EventKind::AgentStart | EventKind::ModelResponse | EventKind::ToolResponse => {
            event.content.clone().filter(|c| !c.is_empty())
        }
        EventKind::AgentEnd
        | EventKind::ModelRequest
        | EventKind::ToolCall
        | EventKind::IterationStart
        | EventKind::IterationEnd
        | EventKind::Error => None,
    }
}

/// Moves each function-response content immediately after the earliest
/// content carrying an unmatched function call with a matching id.
/// Responses with no matching call, and calls with no response, stay in
/// place.
pub fn rearrange_async_function_responses(contents: Vec<Content>) -> Vec<Content> {
    let mut result: Vec<Content> = Vec::new();

    for content in contents {
        let is_response_content = !content.parts.is_empty()
            && content
                .parts
                .iter()
                .all(|p| matches!(p, Part::FunctionResponse(_)));

        if !is_response_content {
            result.push(content);
            continue;
        }

        let response_ids: Vec<String> = content
            .function_responses()
            .iter()
            .filter_map(|r| r.id.clone())
            .collect();

        let mut insert_at = None;
        'scan: for (index, prior) in result.iter().enumerate() {
            for call in prior.function_calls() {
                if let Some(call_id) = &call.id {
                    if response_ids.iter().any(|id| id == call_id) {
                        insert_at = Some(index + 1);
                        break 'scan;
                    }
                }
            }
        }

        match insert_at {
            Some(mut position) => {
                // Step over responses already sitting after the call so
                // re-applying the rearrangement is a no-op.
                while position < result.len()
                    && result[position]
                        .parts
                        .iter()
                        .all(|p| matches!(p, Part::FunctionResponse(_)))
                {
                    position += 1;
                }
                result.insert(position, content);
            }
            None => result.push(content),
        }
    }

    result
}

/// Strips framework-generated call ids so they never leak to the model.
/// User-supplied ids pass through untouched.
pub fn scrub_framework_ids(contents: Vec<Content>) -> Vec<Content> {
    contents
        .into_iter()
        .map(|mut content| {
            for part in &mut content.parts {
                match part {
                    Part::FunctionCall(call) => {
                        if call.id.as_deref().is_some_and(is_framework_call_id) {
                            call.id = None;
                        }
                    }
                    Part::FunctionResponse(response) => {
                        if response.id.as_deref().is_some_and(is_framework_call_id) {
                            response.id = None;
                        }
                    }
                    _ => {}
                }
            }
            content
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::assign_ids_in_content;
    use crate::types::Role;
    use serde_json::json;

    fn call_content(id: &str, name: &str) -> Content {
        Content::assistant(vec![Part::FunctionCall(crate::types::FunctionCall::with_id(
            id,
            name,
            json!({}),
        ))])
    }

    fn response_content(id: &str, name: &str) -> Content {
        Content::tool(vec![Part::function_response(id, name, json!("done"))])
    }

    #[test]
    fn test_rearrange_moves_response_after_call() {
        let contents = vec![
            call_content("c1", "greet"),
            Content::user("unrelated chatter"),
            response_content("c1", "greet"),
        ];

        let arranged = rearrange_async_function_responses(contents);
        assert_eq!(arranged.len(), 3);
        assert_eq!(arranged[0].function_calls()[0].id.as_deref(), Some("c1"));
        assert_eq!(arranged[1].function_responses()[0].id.as_deref(), Some("c1"));
        assert_eq!(arranged[2].text(), "unrelated chatter");
    }

    #[test]
    fn test_rearrange_is_idempotent() {
        let contents = vec![
            call_content("c1", "greet"),
            Content::user("between"),
            response_content("c1", "greet"),
            call_content("c2", "count"),
        ];

        let once = rearrange_async_function_responses(contents);
        let twice = rearrange_async_function_responses(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rearrange_unmatched_stay_in_place() {
        let contents = vec![
            call_content("c1", "greet"),
            response_content("other", "greet"),
        ];
        let arranged = rearrange_async_function_responses(contents.clone());
        assert_eq!(arranged, contents);
    }

    #[test]
    fn test_scrub_framework_ids_roundtrip() {
        // For content lacking framework ids, scrub(assign(c)) == c
        let original = Content::assistant(vec![
            Part::text("calling"),
            Part::function_call("greet", json!({"name": "John"})),
        ]);
        let mut assigned = original.clone();
        assign_ids_in_content(&mut assigned);
        assert!(assigned.function_calls()[0].id.is_some());

        let scrubbed = scrub_framework_ids(vec![assigned]);
        assert_eq!(scrubbed[0], original);
    }

    #[test]
    fn test_scrub_preserves_user_ids() {
        let content = call_content("user-supplied", "greet");
        let scrubbed = scrub_framework_ids(vec![content.clone()]);
        assert_eq!(scrubbed[0], content);
    }

    #[test]
    fn test_history_view_branch_filtering() {
        let mut events = Vec::new();
        let mut event = Event::new("inv", "coordinator", "coordinator", EventKind::AgentStart);
        event.content = Some(Content::user("hello"));
        events.push(event);

        let mut peer = Event::new("inv", "peer", "coordinator.peer", EventKind::ModelResponse);
        peer.content = Some(Content::assistant_text("peer chatter"));
        events.push(peer);

        let mut own = Event::new("inv", "greeter", "coordinator.greeter", EventKind::ModelResponse);
        own.content = Some(Content::assistant_text("greeting"));
        events.push(own);

        let view = build_history_view(&events, "coordinator.greeter");
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].text(), "hello");
        assert_eq!(view[1].text(), "greeting");
    }

    #[test]
    fn test_history_view_idempotent_and_collapses_duplicates() {
        let mut events = Vec::new();
        let mut parent = Event::new("inv", "seq", "seq", EventKind::AgentStart);
        parent.content = Some(Content::user("do it"));
        events.push(parent);

        // Delegated child re-presents the same message
        let mut child = Event::new("inv", "worker", "seq.worker", EventKind::AgentStart);
        child.content = Some(Content::user("do it"));
        events.push(child);

        let view = build_history_view(&events, "seq.worker");
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].text(), "do it");
    }

    #[test]
    fn test_event_to_content_skips_non_conversation_events() {
        let end = Event::new("inv", "a", "a", EventKind::AgentEnd)
            .with_content(Content::assistant_text("final"));
        assert!(event_to_content(&end).is_none());

        let iter = Event::new("inv", "a", "a", EventKind::IterationStart).with_iteration(1);
        assert!(event_to_content(&iter).is_none());

        let response = Event::new("inv", "a", "a", EventKind::ModelResponse)
            .with_content(Content::assistant_text("text"));
        let mapped = event_to_content(&response).unwrap();
        assert_eq!(mapped.role, Role::Assistant);
    }
}
