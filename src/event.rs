//! Event records appended to session logs.
//!
//! An [`Event`] is an append-only record of something that happened during
//! an invocation: an agent starting or finishing, a model request or
//! response, a tool call or response, iteration boundaries, or an error.
//! Events carry the invocation id, the author (the user or an agent name),
//! a dotted branch path used to scope history visibility, and optional
//! [`Content`].
//!
//! [`EventActions`] piggyback side effects on events: session state deltas,
//! transfer requests, and invocation control flags. The session service
//! applies the state delta atomically when the event is appended.

use crate::types::Content;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Author name used for user-originated events.
pub const USER_AUTHOR: &str = "user";

/// What kind of occurrence an [`Event`] records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An agent began handling a message. Carries the input content.
    AgentStart,

    /// An agent finished. Carries the final response content, the run
    /// duration, and any deferred long-running tool ids.
    AgentEnd,

    /// A model request was assembled and is about to be sent.
    ModelRequest,

    /// The model produced a response. Carries the response content.
    ModelResponse,

    /// A tool call was issued (used for long-running and transfer calls).
    ToolCall,

    /// Tool execution finished. Carries the merged function responses.
    ToolResponse,

    /// A reasoning-loop iteration began.
    IterationStart,

    /// A reasoning-loop iteration finished.
    IterationEnd,

    /// Something failed. Carries the error message.
    Error,
}

/// Side effects attached to an event.
///
/// Deltas and flags accumulate during an iteration and are applied by the
/// session service when the carrying event is appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventActions {
    /// Session state changes to apply atomically with the append.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_delta: HashMap<String, Value>,

    /// Request that downstream summarization skip this event.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_summarization: bool,

    /// Name of the agent this invocation should hand off to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,

    /// Request that the current invocation end after this event.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end_invocation: bool,

    /// Set on the closing event when the iteration cap was hit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub max_iterations_reached: bool,
}

impl EventActions {
    /// Whether no action is recorded.
    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty()
            && !self.skip_summarization
            && self.transfer_to_agent.is_none()
            && !self.end_invocation
            && !self.max_iterations_reached
    }

    /// Merges another action set into this one. Later flags win.
    pub fn merge(&mut self, other: EventActions) {
        self.state_delta.extend(other.state_delta);
        self.skip_summarization |= other.skip_summarization;
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        self.end_invocation |= other.end_invocation;
        self.max_iterations_reached |= other.max_iterations_reached;
    }
}

/// An append-only record of something that happened during an invocation.
///
/// Events are constructed with [`Event::new`] and refined with the
/// builder-style `with_*` methods:
///
/// ```
/// use agent_kit::{Content, Event, EventKind};
///
/// let event = Event::new("inv-1", "greeter", "coordinator.greeter", EventKind::ModelResponse)
///     .with_content(Content::assistant_text("Hello!"));
/// assert_eq!(event.author, "greeter");
/// assert!(event.content.is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event id.
    pub id: String,

    /// Id of the invocation this event belongs to.
    pub invocation_id: String,

    /// The user or the name of the agent that produced the event.
    pub author: String,

    /// Dotted agent lineage (`a.b.c`) used to scope history visibility.
    pub branch: String,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// What this event records.
    pub kind: EventKind,

    /// Conversation content carried by the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    /// Side effects to apply along with the append.
    #[serde(default, skip_serializing_if = "EventActions::is_empty")]
    pub actions: EventActions,

    /// Iteration number for iteration-boundary events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,

    /// Error message for [`EventKind::Error`] events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Run duration in milliseconds, set on [`EventKind::AgentEnd`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Token accounting for [`EventKind::ModelResponse`] events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<crate::types::TokenUsage>,

    /// Ids of tool calls deferred past the end of this invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<String>,
}

impl Event {
    /// Creates an event with a fresh id and the current timestamp.
    pub fn new(
        invocation_id: impl Into<String>,
        author: impl Into<String>,
        branch: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            branch: branch.into(),
            timestamp: Utc::now(),
            kind,
            content: None,
            actions: EventActions::default(),
            iteration: None,
            error: None,
            duration_ms: None,
            usage: None,
            long_running_tool_ids: Vec::new(),
        }
    }

    /// Attaches content.
    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    /// Attaches actions.
    pub fn with_actions(mut self, actions: EventActions) -> Self {
        self.actions = actions;
        self
    }

    /// Attaches an iteration number.
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attaches a duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attaches token usage.
    pub fn with_usage(mut self, usage: crate::types::TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attaches long-running tool ids.
    pub fn with_long_running_tool_ids(mut self, ids: Vec<String>) -> Self {
        self.long_running_tool_ids = ids;
        self
    }

    /// Whether this event is the final response of its invocation.
    pub fn is_final_response(&self) -> bool {
        self.kind == EventKind::AgentEnd && self.content.is_some()
    }
}

/// Whether an event recorded on `event_branch` is visible from
/// `current_branch`.
///
/// Visibility follows direct lineage: an event is visible when its branch
/// is an ancestor of, or equal to, the current branch. Peer sub-agent
/// chatter is hidden.
///
/// ```
/// use agent_kit::event::branch_visible;
///
/// assert!(branch_visible("a", "a.b"));
/// assert!(branch_visible("a.b", "a.b"));
/// assert!(!branch_visible("a.b", "a.c"));
/// assert!(!branch_visible("a.bc", "a.b"));
/// ```
pub fn branch_visible(event_branch: &str, current_branch: &str) -> bool {
    if event_branch.is_empty() || event_branch == current_branch {
        return true;
    }
    current_branch
        .strip_prefix(event_branch)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Extends a branch path with a child segment.
pub fn extend_branch(branch: &str, child: &str) -> String {
    if branch.is_empty() {
        child.to_string()
    } else {
        format!("{branch}.{child}")
    }
}
