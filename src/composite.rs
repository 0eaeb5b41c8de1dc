//! Composite agents: combinators that compose child agents.
//!
//! All composites are themselves [`BaseAgent`]s and emit
//! `AgentStart`/`AgentEnd` around the composition, so they nest freely:
//! a parallel agent of sequential agents of LLM agents is just a tree.
//!
//! - [`SequentialAgent`] runs children in order, optionally feeding each
//!   child the previous child's final response.
//! - [`ParallelAgent`] launches all children concurrently, either
//!   gathering results in child order or streaming events as they arrive.
//!   A failed child surfaces an error event; its siblings keep running.
//! - [`LoopAgent`] reruns one child up to a cap, with an optional stop
//!   condition and message update hook.

use crate::agent::{BaseAgent, EventStream};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::types::{Content, Part, Role};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

/// Stop condition evaluated before each loop iteration: receives the
/// 1-based iteration number, the last child response, and the context.
pub type LoopCondition =
    Arc<dyn Fn(u32, Option<&Content>, &InvocationContext) -> bool + Send + Sync>;

/// Message update hook: computes the next iteration's input from the
/// iteration number, the last child response, and the original message.
pub type UpdateMessage = Arc<dyn Fn(u32, Option<&Content>, &Content) -> Content + Send + Sync>;

/// Extracts a child's final response from its event stream while
/// forwarding every event. Matching is by branch so nested grandchildren
/// do not shadow the child's own end event.
fn capture_final_response(event: &Event, child_branch: &str) -> Option<Content> {
    if event.kind == EventKind::AgentEnd && event.branch == child_branch {
        event.content.clone()
    } else {
        None
    }
}

/// Re-addresses a child's response as the next child's input message.
fn response_as_message(response: &Content) -> Content {
    Content::new(Role::User, response.parts.clone())
}

// ============================================================================
// SEQUENTIAL
// ============================================================================

/// Runs children in order.
///
/// With `pass_results` (the default), child *k+1* receives child *k*'s
/// final response as its input message; otherwise every child receives the
/// original message. The composite's final response is the concatenation
/// of child-response parts, or just the last child's response when
/// `last_response_only` is set.
pub struct SequentialAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn BaseAgent>>,
    pass_results: bool,
    last_response_only: bool,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn BaseAgent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            children,
            pass_results: true,
            last_response_only: false,
        }
    }

    /// Sets the one-line description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether each child receives the previous child's response (default
    /// true).
    pub fn pass_results(mut self, pass_results: bool) -> Self {
        self.pass_results = pass_results;
        self
    }

    /// Use only the last child's response as the composite result instead
    /// of concatenating all child responses.
    pub fn last_response_only(mut self, last_response_only: bool) -> Self {
        self.last_response_only = last_response_only;
        self
    }
}

#[async_trait]
impl BaseAgent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn BaseAgent>] {
        &self.children
    }

    async fn run(&self, ctx: Arc<InvocationContext>) -> Result<EventStream> {
        let name = self.name.clone();
        let children = self.children.clone();
        let pass_results = self.pass_results;
        let last_response_only = self.last_response_only;

        let events = try_stream! {
            let started = Instant::now();

            let start_event = Event::new(
                &ctx.invocation_id,
                &name,
                &ctx.branch,
                EventKind::AgentStart,
            )
            .with_content(ctx.user_content.clone());
            ctx.append_event(&start_event).await?;
            yield start_event;

            let original = ctx.user_content.clone();
            let mut last_response: Option<Content> = None;
            let mut collected_parts: Vec<Part> = Vec::new();

            for child in children {
                if ctx.end_invocation() {
                    break;
                }

                let message = if pass_results {
                    last_response
                        .as_ref()
                        .map(response_as_message)
                        .unwrap_or_else(|| original.clone())
                } else {
                    original.clone()
                };

                let child_ctx = ctx.for_sub_agent(child.name(), message);
                let child_branch = child_ctx.branch.clone();
                let mut child_response: Option<Content> = None;

                let mut child_events = child.run(child_ctx).await?;
                while let Some(event) = child_events.next().await {
                    let event = event?;
                    if let Some(response) = capture_final_response(&event, &child_branch) {
                        child_response = Some(response);
                    }
                    yield event;
                }

                if let Some(response) = child_response {
                    collected_parts.extend(response.parts.clone());
                    last_response = Some(response);
                }
            }

            let final_response = if last_response_only {
                last_response
            } else if collected_parts.is_empty() {
                None
            } else {
                Some(Content::assistant(collected_parts))
            };

            let mut end_event = Event::new(
                &ctx.invocation_id,
                &name,
                &ctx.branch,
                EventKind::AgentEnd,
            )
            .with_duration_ms(started.elapsed().as_millis() as u64);
            if let Some(response) = &final_response {
                end_event = end_event.with_content(response.clone());
            }
            ctx.append_event(&end_event).await?;
            yield end_event;
        };

        Ok(Box::pin(events))
    }
}

// ============================================================================
// PARALLEL
// ============================================================================

/// Launches all children concurrently.
///
/// With `wait_for_all` (the default) results are gathered and each child's
/// events are emitted in child order once everyone finished; otherwise
/// events stream interleaved as they arrive. Either way a failed child
/// surfaces an error event and its siblings are unaffected; the combined
/// result concatenates the parts of successful children in child order.
pub struct ParallelAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn BaseAgent>>,
    wait_for_all: bool,
}

impl ParallelAgent {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn BaseAgent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            children,
            wait_for_all: true,
        }
    }

    /// Sets the one-line description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether to gather all children before emitting events (default
    /// true). When false, events stream as they arrive.
    pub fn wait_for_all(mut self, wait_for_all: bool) -> Self {
        self.wait_for_all = wait_for_all;
        self
    }
}

#[async_trait]
impl BaseAgent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn BaseAgent>] {
        &self.children
    }

    async fn run(&self, ctx: Arc<InvocationContext>) -> Result<EventStream> {
        let name = self.name.clone();
        let children = self.children.clone();
        let wait_for_all = self.wait_for_all;

        let events = try_stream! {
            let started = Instant::now();

            let start_event = Event::new(
                &ctx.invocation_id,
                &name,
                &ctx.branch,
                EventKind::AgentStart,
            )
            .with_content(ctx.user_content.clone());
            ctx.append_event(&start_event).await?;
            yield start_event;

            // Child responses by child index, successful children only
            let mut responses: Vec<Option<Content>> = vec![None; children.len()];

            if wait_for_all {
                let mut handles = Vec::with_capacity(children.len());
                for child in &children {
                    let child = Arc::clone(child);
                    let child_ctx = ctx.for_sub_agent(child.name(), ctx.user_content.clone());
                    handles.push(tokio::spawn(async move {
                        let mut collected = Vec::new();
                        let mut stream = child.run(child_ctx).await?;
                        while let Some(event) = stream.next().await {
                            collected.push(event?);
                        }
                        Ok::<Vec<Event>, Error>(collected)
                    }));
                }

                let results = futures::future::join_all(handles).await;
                for (index, (child, joined)) in children.iter().zip(results).enumerate() {
                    let child_branch =
                        crate::event::extend_branch(&ctx.branch, child.name());
                    match joined {
                        Ok(Ok(collected)) => {
                            for event in collected {
                                if let Some(response) =
                                    capture_final_response(&event, &child_branch)
                                {
                                    responses[index] = Some(response);
                                }
                                yield event;
                            }
                        }
                        Ok(Err(err)) => {
                            log::warn!("parallel child '{}' failed: {}", child.name(), err);
                            let error_event = Event::new(
                                &ctx.invocation_id,
                                child.name(),
                                &child_branch,
                                EventKind::Error,
                            )
                            .with_error(err.to_string());
                            ctx.append_event(&error_event).await?;
                            yield error_event;
                        }
                        Err(join_error) => {
                            log::warn!(
                                "parallel child '{}' panicked: {}",
                                child.name(),
                                join_error
                            );
                            let error_event = Event::new(
                                &ctx.invocation_id,
                                child.name(),
                                &child_branch,
                                EventKind::Error,
                            )
                            .with_error(join_error.to_string());
                            ctx.append_event(&error_event).await?;
                            yield error_event;
                        }
                    }
                }
            } else {
                // Streaming mode: merge child streams as events arrive
                let mut tagged = Vec::with_capacity(children.len());
                for (index, child) in children.iter().enumerate() {
                    let child_ctx = ctx.for_sub_agent(child.name(), ctx.user_content.clone());
                    let child_branch = child_ctx.branch.clone();
                    let stream = child.run(child_ctx).await?;
                    tagged.push(
                        stream
                            .map(move |item| (index, child_branch.clone(), item))
                            .boxed(),
                    );
                }

                let mut merged = futures::stream::select_all(tagged);
                while let Some((index, child_branch, item)) = merged.next().await {
                    match item {
                        Ok(event) => {
                            if let Some(response) =
                                capture_final_response(&event, &child_branch)
                            {
                                responses[index] = Some(response);
                            }
                            yield event;
                        }
                        Err(err) => {
                            let child_name = children[index].name();
                            log::warn!("parallel child '{child_name}' failed: {err}");
                            let error_event = Event::new(
                                &ctx.invocation_id,
                                child_name,
                                &child_branch,
                                EventKind::Error,
                            )
                            .with_error(err.to_string());
                            ctx.append_event(&error_event).await?;
                            yield error_event;
                        }
                    }
                }
            }

            let collected_parts: Vec<Part> = responses
                .into_iter()
                .flatten()
                .flat_map(|response| response.parts)
                .collect();
            let final_response = if collected_parts.is_empty() {
                None
            } else {
                Some(Content::assistant(collected_parts))
            };

            let mut end_event = Event::new(
                &ctx.invocation_id,
                &name,
                &ctx.branch,
                EventKind::AgentEnd,
            )
            .with_duration_ms(started.elapsed().as_millis() as u64);
            if let Some(response) = &final_response {
                end_event = end_event.with_content(response.clone());
            }
            ctx.append_event(&end_event).await?;
            yield end_event;
        };

        Ok(Box::pin(events))
    }
}

// ============================================================================
// LOOP
// ============================================================================

/// Reruns one child up to `max_iterations` times.
///
/// Before each iteration the optional condition is evaluated with the
/// iteration number and the last response; returning false stops the
/// loop. The optional message hook computes the next input; absent, the
/// original message is reused. The composite's final response is the last
/// child response.
pub struct LoopAgent {
    name: String,
    description: String,
    child: Arc<dyn BaseAgent>,
    children: Vec<Arc<dyn BaseAgent>>,
    max_iterations: u32,
    condition: Option<LoopCondition>,
    update_message: Option<UpdateMessage>,
}

impl LoopAgent {
    pub fn new(
        name: impl Into<String>,
        child: Arc<dyn BaseAgent>,
        max_iterations: u32,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            children: vec![Arc::clone(&child)],
            child,
            max_iterations: max_iterations.max(1),
            condition: None,
            update_message: None,
        }
    }

    /// Sets the one-line description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the stop condition, evaluated before each iteration.
    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(u32, Option<&Content>, &InvocationContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Sets the hook computing each iteration's input message.
    pub fn update_message<F>(mut self, update_message: F) -> Self
    where
        F: Fn(u32, Option<&Content>, &Content) -> Content + Send + Sync + 'static,
    {
        self.update_message = Some(Arc::new(update_message));
        self
    }
}

#[async_trait]
impl BaseAgent for LoopAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn BaseAgent>] {
        &self.children
    }

    async fn run(&self, ctx: Arc<InvocationContext>) -> Result<EventStream> {
        let name = self.name.clone();
        let child = Arc::clone(&self.child);
        let max_iterations = self.max_iterations;
        let condition = self.condition.clone();
        let update_message = self.update_message.clone();

        let events = try_stream! {
            let started = Instant::now();

            let start_event = Event::new(
                &ctx.invocation_id,
                &name,
                &ctx.branch,
                EventKind::AgentStart,
            )
            .with_content(ctx.user_content.clone());
            ctx.append_event(&start_event).await?;
            yield start_event;

            let original = ctx.user_content.clone();
            let mut last_response: Option<Content> = None;

            for iteration in 1..=max_iterations {
                if ctx.end_invocation() {
                    break;
                }
                if let Some(condition) = condition.as_deref() {
                    if !condition(iteration, last_response.as_ref(), &ctx) {
                        break;
                    }
                }

                let message = match update_message.as_deref() {
                    Some(update) => update(iteration, last_response.as_ref(), &original),
                    None => original.clone(),
                };

                let child_ctx = ctx.for_sub_agent(child.name(), message);
                let child_branch = child_ctx.branch.clone();
                let mut child_events = child.run(child_ctx).await?;
                while let Some(event) = child_events.next().await {
                    let event = event?;
                    if let Some(response) = capture_final_response(&event, &child_branch) {
                        last_response = Some(response);
                    }
                    yield event;
                }
            }

            let mut end_event = Event::new(
                &ctx.invocation_id,
                &name,
                &ctx.branch,
                EventKind::AgentEnd,
            )
            .with_duration_ms(started.elapsed().as_millis() as u64);
            if let Some(response) = &last_response {
                end_event = end_event.with_content(response.clone());
            }
            ctx.append_event(&end_event).await?;
            yield end_event;
        };

        Ok(Box::pin(events))
    }
}
