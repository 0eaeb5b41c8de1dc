//! The session-scoped driver.
//!
//! A [`Runner`] binds an agent tree to a session service and drives
//! invocations: it validates inputs, builds the invocation context,
//! enforces the timeout and iteration cap, bridges events to registered
//! callbacks, and aggregates per-run metrics.
//!
//! [`Runner::run_streaming`] returns the lazy event stream (with timeout
//! and callbacks already applied); [`Runner::run`] consumes that stream
//! and folds it into a [`RunnerResult`]. [`InMemoryRunner`] bundles a
//! runner with an in-memory session service for tests and local use.

use crate::agent::{AgentTree, BaseAgent, EventStream};
use crate::context::{DEFAULT_MAX_ITERATIONS, InvocationContext};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::session::{InMemorySessionService, Session, SessionService};
use crate::types::Content;
use async_stream::try_stream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default wall-clock budget for one run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Limits applied to every run driven by a runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Wall-clock budget. On expiry the inner stream is cancelled, an
    /// error event is recorded, and the run fails with a timeout.
    pub timeout: Duration,

    /// Reasoning-loop iteration cap handed to agents.
    pub max_iterations: u32,

    /// Optional bound on the history view length, trimmed from the head.
    pub max_history_size: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_history_size: None,
        }
    }
}

/// Aggregated metrics for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerMetrics {
    /// Wall-clock duration of the run.
    pub execution_time: Duration,

    /// Number of model requests issued.
    pub iterations: u32,

    /// Total tokens reported by the model across the run.
    pub tokens_used: u64,

    /// Number of tool calls executed or deferred.
    pub tool_calls: u32,

    /// Number of error events observed.
    pub errors: u32,
}

/// Everything one completed run produced.
#[derive(Debug, Clone)]
pub struct RunnerResult {
    /// The final response, when the run produced one.
    pub final_response: Option<Content>,

    /// Every event the run emitted, in order.
    pub events: Vec<Event>,

    /// Aggregated metrics.
    pub metrics: RunnerMetrics,

    /// Whether any agent in the run hit its iteration cap.
    pub max_iterations_reached: bool,

    /// Tool calls deferred past this run, addressed by id.
    pub long_running_tool_ids: Vec<String>,
}

/// External subscriber notified of every event. Callback panics are
/// isolated and logged; they never affect the run.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Session-scoped driver for one agent tree.
pub struct Runner {
    app_name: String,
    agent: Arc<dyn BaseAgent>,
    tree: Arc<AgentTree>,
    session_service: Arc<dyn SessionService>,
    config: RunnerConfig,
    callbacks: Vec<EventCallback>,
}

impl Runner {
    /// Creates a runner for `agent`, validating the agent tree.
    pub fn new(
        app_name: impl Into<String>,
        agent: Arc<dyn BaseAgent>,
        session_service: Arc<dyn SessionService>,
    ) -> Result<Self> {
        let tree = Arc::new(AgentTree::build(Arc::clone(&agent))?);
        Ok(Self {
            app_name: app_name.into(),
            agent,
            tree,
            session_service,
            config: RunnerConfig::default(),
            callbacks: Vec::new(),
        })
    }

    /// Replaces the runner configuration.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an event callback.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// The application name this runner serves.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The session service backing this runner.
    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.session_service
    }

    /// Returns the session, creating it when missing.
    pub async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<String>,
    ) -> Result<Session> {
        match &session_id {
            Some(id) => match self
                .session_service
                .get_session(&self.app_name, user_id, id)
                .await
            {
                Ok(session) => Ok(session),
                Err(Error::Session(_)) => {
                    self.session_service
                        .create_session(&self.app_name, user_id, session_id)
                        .await
                }
                Err(err) => Err(err),
            },
            None => {
                self.session_service
                    .create_session(&self.app_name, user_id, None)
                    .await
            }
        }
    }

    fn notify(callbacks: &[EventCallback], event: &Event) {
        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event)
            }));
            if result.is_err() {
                log::warn!("event callback panicked; continuing");
            }
        }
    }

    /// Starts a run and returns its lazy event stream.
    ///
    /// The stream has the timeout and the registered callbacks already
    /// applied. Dropping it cancels the run; nothing is appended for
    /// post-cancel work.
    pub async fn run_streaming(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
    ) -> Result<EventStream> {
        if message.is_empty() {
            return Err(Error::validation("message must contain at least one part"));
        }
        // Session must exist before the run starts
        self.session_service
            .get_session(&self.app_name, user_id, session_id)
            .await?;

        let mut ctx = InvocationContext::new(
            &self.app_name,
            user_id,
            session_id,
            self.agent.name(),
            message,
            Arc::clone(&self.session_service),
            Arc::clone(&self.tree),
        )
        .with_max_iterations(self.config.max_iterations);
        if let Some(max) = self.config.max_history_size {
            ctx = ctx.with_max_history_size(max);
        }
        let ctx = Arc::new(ctx);

        let inner = self.agent.run(Arc::clone(&ctx)).await?;
        let callbacks = self.callbacks.clone();
        let deadline = Instant::now() + self.config.timeout;

        let events = try_stream! {
            let mut inner = inner;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, inner.next()).await {
                    Err(_elapsed) => {
                        // Cancel the run: record the timeout and surface
                        // it; the inner stream drops with the generator.
                        let error_event = Event::new(
                            &ctx.invocation_id,
                            &ctx.agent_name,
                            &ctx.branch,
                            EventKind::Error,
                        )
                        .with_error("run timed out");
                        if let Err(append_err) = ctx.append_event(&error_event).await {
                            log::warn!("failed to record timeout event: {append_err}");
                        }
                        Runner::notify(&callbacks, &error_event);
                        yield error_event;
                        Err(Error::Timeout)?
                    }
                    Ok(None) => break,
                    Ok(Some(Ok(event))) => {
                        Runner::notify(&callbacks, &event);
                        yield event;
                    }
                    Ok(Some(Err(err))) => Err(err)?,
                }
            }
        };

        Ok(Box::pin(events))
    }

    /// Runs to completion, folding the event stream into a
    /// [`RunnerResult`].
    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
    ) -> Result<RunnerResult> {
        let started = Instant::now();
        let mut stream = self.run_streaming(user_id, session_id, message).await?;

        let mut events: Vec<Event> = Vec::new();
        let mut metrics = RunnerMetrics::default();
        let mut final_response: Option<Content> = None;
        let mut max_iterations_reached = false;
        let mut long_running_tool_ids: Vec<String> = Vec::new();

        while let Some(item) = stream.next().await {
            let event = item?;

            match event.kind {
                EventKind::ModelRequest => metrics.iterations += 1,
                EventKind::ModelResponse => {
                    if let Some(usage) = &event.usage {
                        metrics.tokens_used += usage.total_tokens;
                    }
                }
                EventKind::ToolCall => metrics.tool_calls += 1,
                EventKind::ToolResponse => {
                    if let Some(content) = &event.content {
                        metrics.tool_calls += content.function_responses().len() as u32;
                    }
                }
                EventKind::Error => metrics.errors += 1,
                EventKind::AgentEnd => {
                    if let Some(content) = &event.content {
                        final_response = Some(content.clone());
                    }
                }
                _ => {}
            }

            max_iterations_reached |= event.actions.max_iterations_reached;
            long_running_tool_ids.extend(event.long_running_tool_ids.iter().cloned());
            events.push(event);
        }

        metrics.execution_time = started.elapsed();

        Ok(RunnerResult {
            final_response,
            events,
            metrics,
            max_iterations_reached,
            long_running_tool_ids,
        })
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("app_name", &self.app_name)
            .field("agent", &self.agent.name())
            .field("agents", &self.tree.len())
            .field("config", &self.config)
            .field("callbacks", &format!("{} callbacks", self.callbacks.len()))
            .finish()
    }
}

/// A [`Runner`] bundled with an [`InMemorySessionService`].
///
/// Final session state persists in the service under the session id for
/// the lifetime of the runner.
pub struct InMemoryRunner {
    runner: Runner,
    service: Arc<InMemorySessionService>,
}

impl InMemoryRunner {
    pub fn new(app_name: impl Into<String>, agent: Arc<dyn BaseAgent>) -> Result<Self> {
        let service = InMemorySessionService::new_shared();
        let runner = Runner::new(
            app_name,
            agent,
            Arc::clone(&service) as Arc<dyn SessionService>,
        )?;
        Ok(Self { runner, service })
    }

    /// Replaces the runner configuration.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.runner = self.runner.with_config(config);
        self
    }

    /// Registers an event callback.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.runner = self.runner.on_event(callback);
        self
    }

    /// The wrapped runner.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// The in-memory session service.
    pub fn session_service(&self) -> &Arc<InMemorySessionService> {
        &self.service
    }

    /// Returns the session, creating it when missing.
    pub async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<String>,
    ) -> Result<Session> {
        self.runner.ensure_session(user_id, session_id).await
    }

    /// Runs to completion. See [`Runner::run`].
    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
    ) -> Result<RunnerResult> {
        self.runner.run(user_id, session_id, message).await
    }

    /// Starts a run and returns its event stream. See
    /// [`Runner::run_streaming`].
    pub async fn run_streaming(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
    ) -> Result<EventStream> {
        self.runner.run_streaming(user_id, session_id, message).await
    }

    /// Snapshot of a session's state map.
    pub async fn session_state(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<HashMap<String, Value>> {
        let session = self
            .service
            .get_session(self.runner.app_name(), user_id, session_id)
            .await?;
        Ok(session.state)
    }
}
