//! Invocation context threaded through one agent run.
//!
//! An [`InvocationContext`] is created per top-level run and passed by
//! reference (behind `Arc`) through the reasoning loop, processors, the
//! dispatcher, and tools. It identifies the run (app, user, session,
//! invocation, request), names the current agent and its branch, and gives
//! access to the session service and the agent tree.
//!
//! The context is immutable apart from two documented channels: the shared
//! `end_invocation` flag, and derived child contexts that extend the branch
//! when a parent delegates to a sub-agent or hands off via transfer.

use crate::agent::AgentTree;
use crate::error::Result;
use crate::event::{Event, extend_branch};
use crate::session::{Session, SessionService};
use crate::types::Content;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Default reasoning-loop iteration cap.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Per-run context shared by every component of one invocation.
pub struct InvocationContext {
    /// Application the run belongs to.
    pub app_name: String,

    /// User the run belongs to.
    pub user_id: String,

    /// Session receiving this run's events.
    pub session_id: String,

    /// Unique id for this invocation.
    pub invocation_id: String,

    /// Caller-supplied request correlation id.
    pub request_id: String,

    /// When the invocation started.
    pub timestamp: DateTime<Utc>,

    /// Name of the agent currently handling the invocation.
    pub agent_name: String,

    /// Dotted agent lineage for history scoping.
    pub branch: String,

    /// The message that triggered this invocation.
    pub user_content: Content,

    /// Iteration cap imposed by the runner for this invocation.
    pub max_iterations: u32,

    /// Optional bound on the number of history contents sent to the model.
    pub max_history_size: Option<usize>,

    session_service: Arc<dyn SessionService>,
    tree: Arc<AgentTree>,
    end_invocation: Arc<AtomicBool>,
}

impl InvocationContext {
    /// Creates a root context for a top-level run. The branch starts at the
    /// agent's own name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        user_content: Content,
        session_service: Arc<dyn SessionService>,
        tree: Arc<AgentTree>,
    ) -> Self {
        let agent_name = agent_name.into();
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            invocation_id: Uuid::new_v4().to_string(),
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            branch: agent_name.clone(),
            agent_name,
            user_content,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_history_size: None,
            session_service,
            tree,
            end_invocation: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the request correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Overrides the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Bounds the history view length.
    pub fn with_max_history_size(mut self, max_history_size: usize) -> Self {
        self.max_history_size = Some(max_history_size);
        self
    }

    /// The session service backing this run.
    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.session_service
    }

    /// The agent tree the run executes in.
    pub fn tree(&self) -> &Arc<AgentTree> {
        &self.tree
    }

    /// Fetches a snapshot of the session.
    pub async fn session(&self) -> Result<Session> {
        self.session_service
            .get_session(&self.app_name, &self.user_id, &self.session_id)
            .await
    }

    /// Appends an event to the session log.
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        self.session_service
            .append_event(&self.app_name, &self.user_id, &self.session_id, event.clone())
            .await
    }

    /// Whether a processor or callback requested the invocation to end.
    pub fn end_invocation(&self) -> bool {
        self.end_invocation.load(Ordering::SeqCst)
    }

    /// Requests that the invocation end at the next check point.
    pub fn set_end_invocation(&self) {
        self.end_invocation.store(true, Ordering::SeqCst);
    }

    /// Derives a context for a sub-agent delegation. The invocation id and
    /// the end flag are shared; the branch extends with the child's name.
    pub fn for_sub_agent(&self, child_name: &str, message: Content) -> Arc<InvocationContext> {
        Arc::new(InvocationContext {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            invocation_id: self.invocation_id.clone(),
            request_id: self.request_id.clone(),
            timestamp: self.timestamp,
            agent_name: child_name.to_string(),
            branch: extend_branch(&self.branch, child_name),
            user_content: message,
            max_iterations: self.max_iterations,
            max_history_size: self.max_history_size,
            session_service: Arc::clone(&self.session_service),
            tree: Arc::clone(&self.tree),
            end_invocation: Arc::clone(&self.end_invocation),
        })
    }

    /// Derives a fresh context for an agent transfer. The current
    /// invocation ends; the target starts a new one with the pending user
    /// message and an extended branch.
    pub fn for_transfer(&self, target_name: &str) -> Arc<InvocationContext> {
        Arc::new(InvocationContext {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            invocation_id: Uuid::new_v4().to_string(),
            request_id: self.request_id.clone(),
            timestamp: Utc::now(),
            agent_name: target_name.to_string(),
            branch: extend_branch(&self.branch, target_name),
            user_content: self.user_content.clone(),
            max_iterations: self.max_iterations,
            max_history_size: self.max_history_size,
            session_service: Arc::clone(&self.session_service),
            tree: Arc::clone(&self.tree),
            end_invocation: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds a read-only view over this context and a state snapshot, for
    /// instruction providers.
    pub fn readonly(&self, state: HashMap<String, Value>) -> ReadonlyContext {
        ReadonlyContext {
            invocation_id: self.invocation_id.clone(),
            agent_name: self.agent_name.clone(),
            branch: self.branch.clone(),
            user_content: self.user_content.clone(),
            state,
        }
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("app_name", &self.app_name)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("invocation_id", &self.invocation_id)
            .field("agent_name", &self.agent_name)
            .field("branch", &self.branch)
            .finish()
    }
}

/// Read-only snapshot handed to instruction providers and templating.
#[derive(Debug, Clone)]
pub struct ReadonlyContext {
    /// Id of the invocation being resolved.
    pub invocation_id: String,

    /// Name of the agent whose instruction is being resolved.
    pub agent_name: String,

    /// Current branch path.
    pub branch: String,

    /// The triggering user message.
    pub user_content: Content,

    /// Snapshot of session state at resolution time.
    pub state: HashMap<String, Value>,
}

/// Drops contents from the head so that at most `max` remain.
///
/// The tail of a conversation carries the active context, so trimming
/// always removes the oldest entries first.
pub fn trim_history(contents: Vec<Content>, max: usize) -> Vec<Content> {
    let len = contents.len();
    if len <= max {
        return contents;
    }
    contents.into_iter().skip(len - max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_history() {
        let contents = vec![
            Content::user("one"),
            Content::assistant_text("two"),
            Content::user("three"),
        ];
        let trimmed = trim_history(contents.clone(), 2);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].text(), "two");
        assert_eq!(trimmed[1].text(), "three");

        let untouched = trim_history(contents, 10);
        assert_eq!(untouched.len(), 3);
    }

    #[test]
    fn test_trim_history_zero() {
        let contents = vec![Content::user("one")];
        assert!(trim_history(contents, 0).is_empty());
    }
}
