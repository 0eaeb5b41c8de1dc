//! Agents: the named components that consume a message and produce events.
//!
//! [`BaseAgent`] is the trait every agent implements, LLM-backed or not.
//! An agent has a name (unique among siblings), an optional description,
//! optional sub-agents, and a `run` method producing a lazy, single-pass
//! [`EventStream`].
//!
//! [`LlmAgent`] is the reasoning agent: per iteration it assembles a model
//! request through its flow's processors, calls the model, dispatches any
//! requested tool calls in parallel, and feeds the merged responses back
//! until the model stops calling tools or the iteration cap is hit.
//!
//! Agent topology forms a tree. The parent relation is a weak lookup kept
//! in an [`AgentTree`] registry built by walking the root's sub-agent
//! lists; agents never hold owning back-pointers to their parents.

use crate::context::{DEFAULT_MAX_ITERATIONS, InvocationContext, ReadonlyContext};
use crate::dispatcher::{FunctionDispatcher, assign_ids_in_content};
use crate::error::{Error, Result};
use crate::event::{Event, EventActions, EventKind};
use crate::flow::Flow;
use crate::model::{Llm, LlmRequest, ModelMetrics, RetryingLlm, default_model};
use crate::plugin::Plugin;
use crate::retry::RetryConfig;
use crate::tool::Tool;
use crate::types::{AgentName, Content, FunctionCall, GenerationConfig, Part, SafetySetting};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Lazy, single-pass sequence of events produced by one invocation.
/// Dropping the stream cancels the run; in-flight tool calls may complete
/// but nothing further is appended to the session.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// A resolved instruction, plus whether state templating is suppressed.
#[derive(Debug, Clone)]
pub struct CanonicalInstruction {
    /// The instruction text.
    pub text: String,

    /// When true, `{{key}}` templating is not applied. Providers that
    /// inject dynamic context themselves set this.
    pub bypass_state_injection: bool,
}

impl CanonicalInstruction {
    /// A static instruction with templating enabled.
    pub fn templated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bypass_state_injection: false,
        }
    }

    /// An instruction whose provider already resolved all context.
    pub fn bypassing(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bypass_state_injection: true,
        }
    }
}

/// Dynamic instruction resolution hook.
pub type InstructionProvider =
    Arc<dyn Fn(&ReadonlyContext) -> CanonicalInstruction + Send + Sync>;

/// How much history an agent's model requests include.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IncludeContents {
    /// The full branch-filtered history view.
    #[default]
    Default,

    /// Only the current turn's message.
    None,
}

/// The fundamental trait for all agents.
#[async_trait]
pub trait BaseAgent: Send + Sync {
    /// Agent name, unique among siblings.
    fn name(&self) -> &str;

    /// One-line description of what the agent does.
    fn description(&self) -> &str {
        ""
    }

    /// Child agents this agent composes or can delegate to.
    fn sub_agents(&self) -> &[Arc<dyn BaseAgent>] {
        &[]
    }

    /// Whether this agent is model-backed. Peer transfer between siblings
    /// is only offered when their shared parent is.
    fn is_llm_agent(&self) -> bool {
        false
    }

    /// Whether this agent opted out of sibling transfer.
    fn disallow_peer_transfer(&self) -> bool {
        false
    }

    /// Resolves this agent's own instruction.
    fn canonical_instruction(&self, _ctx: &ReadonlyContext) -> Option<CanonicalInstruction> {
        None
    }

    /// Resolves the instruction this agent contributes to every request in
    /// its tree when it is the root.
    fn canonical_global_instruction(
        &self,
        _ctx: &ReadonlyContext,
    ) -> Option<CanonicalInstruction> {
        None
    }

    /// Runs one invocation, producing a lazy event stream.
    async fn run(&self, ctx: Arc<InvocationContext>) -> Result<EventStream>;
}

struct AgentNode {
    agent: Arc<dyn BaseAgent>,
    parent: Option<String>,
}

/// Name-keyed registry over an agent tree.
///
/// Built once per runner by walking the root's sub-agent lists. The
/// parent relation lives here rather than in the agents themselves, so
/// the tree stays acyclic by construction and agents stay immutable.
pub struct AgentTree {
    nodes: HashMap<String, AgentNode>,
    root: Option<String>,
}

impl AgentTree {
    /// An empty tree, for contexts built without a runner.
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
        }
    }

    /// Walks `root` breadth-first and registers every agent.
    ///
    /// # Errors
    ///
    /// Returns a validation error when two agents share a name.
    pub fn build(root: Arc<dyn BaseAgent>) -> Result<Self> {
        let mut nodes: HashMap<String, AgentNode> = HashMap::new();
        let root_name = root.name().to_string();

        let mut queue: VecDeque<(Arc<dyn BaseAgent>, Option<String>)> = VecDeque::new();
        queue.push_back((root, None));

        while let Some((agent, parent)) = queue.pop_front() {
            let name = agent.name().to_string();
            if nodes.contains_key(&name) {
                return Err(Error::validation(format!(
                    "duplicate agent name '{name}' in tree"
                )));
            }
            for child in agent.sub_agents() {
                queue.push_back((Arc::clone(child), Some(name.clone())));
            }
            nodes.insert(name, AgentNode { agent, parent });
        }

        Ok(Self {
            nodes,
            root: Some(root_name),
        })
    }

    /// Looks up an agent by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BaseAgent>> {
        self.nodes.get(name).map(|node| Arc::clone(&node.agent))
    }

    /// Name of an agent's parent.
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(|node| node.parent.as_deref())
    }

    /// An agent's parent.
    pub fn parent_agent(&self, name: &str) -> Option<Arc<dyn BaseAgent>> {
        self.parent_of(name).and_then(|parent| self.get(parent))
    }

    /// The tree's root agent, obtained by construction rather than by
    /// walking parent pointers.
    pub fn root_agent(&self) -> Option<Arc<dyn BaseAgent>> {
        self.root.as_deref().and_then(|name| self.get(name))
    }

    /// Whether an agent with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct LlmAgentInner {
    name: String,
    description: String,
    model: Arc<dyn Llm>,
    metrics: Arc<ModelMetrics>,
    instruction: Option<String>,
    global_instruction: Option<String>,
    instruction_provider: Option<InstructionProvider>,
    tools: Vec<Arc<dyn Tool>>,
    tools_map: HashMap<String, Arc<dyn Tool>>,
    sub_agents: Vec<Arc<dyn BaseAgent>>,
    plugins: Vec<Arc<dyn Plugin>>,
    flow: Option<Flow>,
    dispatcher: FunctionDispatcher,
    max_iterations: u32,
    include_contents: IncludeContents,
    output_key: Option<String>,
    generation_config: Option<GenerationConfig>,
    safety_settings: Vec<SafetySetting>,
    disallow_transfer_to_parent: bool,
    disallow_transfer_to_peers: bool,
}

/// The reasoning agent: an LLM, an instruction, tools, and optionally
/// sub-agents, driven by a flow's processor pipeline.
///
/// `LlmAgent` is a cheap-clone handle over immutable shared internals, so
/// it can move into event generators and spawned tasks freely.
///
/// # Examples
///
/// ```rust,no_run
/// use agent_kit::{LlmAgent, function_tool};
/// use serde_json::json;
/// # fn model() -> std::sync::Arc<dyn agent_kit::Llm> { unimplemented!() }
///
/// let greet = function_tool("greet", "Greet a person by name")
///     .param("name", "string")
///     .build(|args, _ctx| async move {
///         Ok(json!(format!("Hello, {}!", args["name"].as_str().unwrap_or("there"))))
///     });
///
/// let agent = LlmAgent::builder("greeter")
///     .description("Greets people")
///     .model(model())
///     .instruction("Greet the user warmly. Their name is {{user_name}}.")
///     .tool(greet)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct LlmAgent {
    inner: Arc<LlmAgentInner>,
}

impl LlmAgent {
    /// Starts building an agent with the given name.
    pub fn builder(name: impl Into<String>) -> LlmAgentBuilder {
        LlmAgentBuilder::new(name)
    }

    /// The model this agent calls (already wrapped with retry).
    pub fn model(&self) -> &Arc<dyn Llm> {
        &self.inner.model
    }

    /// Metrics accumulated across this agent's model calls.
    pub fn model_metrics(&self) -> Arc<ModelMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Registered tools, in registration order.
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.inner.tools
    }

    /// Tools keyed by name, for the dispatcher.
    pub fn tools_map(&self) -> &HashMap<String, Arc<dyn Tool>> {
        &self.inner.tools_map
    }

    /// Registered plugins, in registration order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.inner.plugins
    }

    /// The flow assembling this agent's requests.
    ///
    /// An explicitly configured flow wins. Otherwise the flow depends on
    /// the agent's position in the tree: agents with sub-agents or with a
    /// parent get [`Flow::auto`] (they can transfer), isolated leaf
    /// agents get [`Flow::single`].
    pub fn resolve_flow(&self, tree: &AgentTree) -> Flow {
        if let Some(flow) = &self.inner.flow {
            return flow.clone();
        }
        if !self.inner.sub_agents.is_empty() || tree.parent_of(self.name()).is_some() {
            Flow::auto()
        } else {
            Flow::single()
        }
    }

    /// Iteration cap for the reasoning loop.
    pub fn max_iterations(&self) -> u32 {
        self.inner.max_iterations
    }

    /// History visibility policy.
    pub fn include_contents(&self) -> IncludeContents {
        self.inner.include_contents
    }

    /// State key receiving the final response text, if configured.
    pub fn output_key(&self) -> Option<&str> {
        self.inner.output_key.as_deref()
    }

    /// Generation config applied to requests.
    pub fn generation_config(&self) -> Option<&GenerationConfig> {
        self.inner.generation_config.as_ref()
    }

    /// Safety settings applied to requests.
    pub fn safety_settings(&self) -> &[SafetySetting] {
        &self.inner.safety_settings
    }

    /// Whether transfer back to the parent is disabled.
    pub fn disallow_transfer_to_parent(&self) -> bool {
        self.inner.disallow_transfer_to_parent
    }

    fn assemble_turn(
        response: &crate::model::LlmResponse,
    ) -> (Option<Content>, Vec<FunctionCall>) {
        let mut content = response
            .content
            .clone()
            .unwrap_or_else(|| Content::assistant(Vec::new()));
        if content.function_calls().is_empty() && !response.tool_calls.is_empty() {
            content
                .parts
                .extend(response.tool_calls.iter().cloned().map(Part::FunctionCall));
        }
        assign_ids_in_content(&mut content);
        let calls: Vec<FunctionCall> = content
            .function_calls()
            .into_iter()
            .cloned()
            .collect();
        let content = if content.is_empty() { None } else { Some(content) };
        (content, calls)
    }
}

#[async_trait]
impl BaseAgent for LlmAgent {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn description(&self) -> &str {
        &self.inner.description
    }

    fn sub_agents(&self) -> &[Arc<dyn BaseAgent>] {
        &self.inner.sub_agents
    }

    fn is_llm_agent(&self) -> bool {
        true
    }

    fn disallow_peer_transfer(&self) -> bool {
        self.inner.disallow_transfer_to_peers
    }

    fn canonical_instruction(&self, ctx: &ReadonlyContext) -> Option<CanonicalInstruction> {
        if let Some(provider) = self.inner.instruction_provider.as_deref() {
            return Some(provider(ctx));
        }
        self.inner
            .instruction
            .as_ref()
            .map(CanonicalInstruction::templated)
    }

    fn canonical_global_instruction(
        &self,
        _ctx: &ReadonlyContext,
    ) -> Option<CanonicalInstruction> {
        self.inner
            .global_instruction
            .as_ref()
            .map(CanonicalInstruction::templated)
    }

    async fn run(&self, ctx: Arc<InvocationContext>) -> Result<EventStream> {
        let agent = self.clone();

        let events = try_stream! {
            let started = Instant::now();

            let start_event = Event::new(
                &ctx.invocation_id,
                agent.name(),
                &ctx.branch,
                EventKind::AgentStart,
            )
            .with_content(ctx.user_content.clone());
            ctx.append_event(&start_event).await?;
            yield start_event;

            for plugin in agent.plugins() {
                if let Err(err) = plugin.before_agent_run(&ctx).await {
                    log::warn!(
                        "plugin '{}' before_agent_run failed: {}",
                        plugin.name(),
                        err
                    );
                }
            }

            let max_iterations = agent.max_iterations().min(ctx.max_iterations).max(1);
            let mut final_response: Option<Content> = None;
            let mut long_running_ids: Vec<String> = Vec::new();
            let mut max_iterations_reached = false;
            let mut transferred = false;

            'iterations: for iteration in 1..=max_iterations {
                let iteration_start = Event::new(
                    &ctx.invocation_id,
                    agent.name(),
                    &ctx.branch,
                    EventKind::IterationStart,
                )
                .with_iteration(iteration);
                ctx.append_event(&iteration_start).await?;
                yield iteration_start;

                let session = ctx.session().await?;
                let flow = agent.resolve_flow(ctx.tree());
                let mut request = LlmRequest::new();
                for processor in flow.request_processors() {
                    let produced = processor
                        .process(&agent, &ctx, &session, &mut request)
                        .await?;
                    for event in produced {
                        ctx.append_event(&event).await?;
                        yield event;
                    }
                }

                if ctx.end_invocation() {
                    log::debug!("invocation ended by processor before model call");
                    break 'iterations;
                }

                let request_event = Event::new(
                    &ctx.invocation_id,
                    agent.name(),
                    &ctx.branch,
                    EventKind::ModelRequest,
                )
                .with_iteration(iteration);
                ctx.append_event(&request_event).await?;
                yield request_event;

                let mut response = match agent.model().generate_content(&request).await {
                    Ok(response) => response,
                    Err(err) => {
                        crate::plugin::notify_error(agent.plugins(), &ctx, &err).await;
                        let error_event = Event::new(
                            &ctx.invocation_id,
                            agent.name(),
                            &ctx.branch,
                            EventKind::Error,
                        )
                        .with_error(err.to_string());
                        ctx.append_event(&error_event).await?;
                        yield error_event;
                        Err(err)?
                    }
                };

                for processor in flow.response_processors() {
                    let produced = processor.process(&agent, &ctx, &mut response).await?;
                    for event in produced {
                        ctx.append_event(&event).await?;
                        yield event;
                    }
                }

                let (content, tool_calls) = LlmAgent::assemble_turn(&response);

                let mut response_event = Event::new(
                    &ctx.invocation_id,
                    agent.name(),
                    &ctx.branch,
                    EventKind::ModelResponse,
                )
                .with_iteration(iteration);
                if let Some(content) = &content {
                    response_event = response_event.with_content(content.clone());
                }
                if let Some(usage) = response.usage {
                    response_event = response_event.with_usage(usage);
                }
                ctx.append_event(&response_event).await?;
                yield response_event;

                if tool_calls.is_empty() {
                    final_response = content;
                    let iteration_end = Event::new(
                        &ctx.invocation_id,
                        agent.name(),
                        &ctx.branch,
                        EventKind::IterationEnd,
                    )
                    .with_iteration(iteration);
                    ctx.append_event(&iteration_end).await?;
                    yield iteration_end;
                    break 'iterations;
                }

                let outcome = agent
                    .inner
                    .dispatcher
                    .dispatch(
                        &tool_calls,
                        agent.tools_map(),
                        agent.plugins(),
                        &ctx,
                        &session.state,
                    )
                    .await;

                for event in outcome.tool_call_events {
                    ctx.append_event(&event).await?;
                    yield event;
                }
                long_running_ids.extend(outcome.long_running_ids);
                if let Some(event) = outcome.response_event {
                    ctx.append_event(&event).await?;
                    yield event;
                }

                let iteration_end = Event::new(
                    &ctx.invocation_id,
                    agent.name(),
                    &ctx.branch,
                    EventKind::IterationEnd,
                )
                .with_iteration(iteration);
                ctx.append_event(&iteration_end).await?;
                yield iteration_end;

                if let Some(target) = outcome.transfer_to {
                    // This invocation is over; the target starts a fresh
                    // one with the pending user message.
                    let end_event = Event::new(
                        &ctx.invocation_id,
                        agent.name(),
                        &ctx.branch,
                        EventKind::AgentEnd,
                    )
                    .with_duration_ms(started.elapsed().as_millis() as u64)
                    .with_long_running_tool_ids(long_running_ids.clone());
                    ctx.append_event(&end_event).await?;
                    yield end_event;

                    for plugin in agent.plugins() {
                        if let Err(err) = plugin.after_agent_run(&ctx, None).await {
                            log::warn!(
                                "plugin '{}' after_agent_run failed: {}",
                                plugin.name(),
                                err
                            );
                        }
                    }

                    let target_agent = ctx.tree().get(&target).ok_or_else(|| {
                        Error::flow(format!("transfer target '{target}' not found"))
                    })?;
                    let target_ctx = ctx.for_transfer(&target);
                    let mut target_events = target_agent.run(target_ctx).await?;
                    while let Some(event) = target_events.next().await {
                        yield event?;
                    }

                    transferred = true;
                    break 'iterations;
                }

                if iteration == max_iterations {
                    max_iterations_reached = true;
                    final_response = content.clone();
                    log::debug!(
                        "agent '{}' hit the iteration cap ({max_iterations})",
                        agent.name()
                    );
                }

                if ctx.end_invocation() {
                    final_response = content;
                    break 'iterations;
                }
            }

            if !transferred {
                let mut actions = EventActions::default();
                if max_iterations_reached {
                    actions.max_iterations_reached = true;
                }
                if let (Some(key), Some(response)) = (agent.output_key(), &final_response) {
                    actions
                        .state_delta
                        .insert(key.to_string(), json!(response.text()));
                }

                let mut end_event = Event::new(
                    &ctx.invocation_id,
                    agent.name(),
                    &ctx.branch,
                    EventKind::AgentEnd,
                )
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_actions(actions)
                .with_long_running_tool_ids(long_running_ids);
                if let Some(response) = &final_response {
                    end_event = end_event.with_content(response.clone());
                }
                ctx.append_event(&end_event).await?;
                yield end_event;

                for plugin in agent.plugins() {
                    if let Err(err) = plugin
                        .after_agent_run(&ctx, final_response.as_ref())
                        .await
                    {
                        log::warn!(
                            "plugin '{}' after_agent_run failed: {}",
                            plugin.name(),
                            err
                        );
                    }
                }
            }
        };

        Ok(Box::pin(events))
    }
}

impl std::fmt::Debug for LlmAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgent")
            .field("name", &self.inner.name)
            .field("description", &self.inner.description)
            .field("model", &self.inner.model.name())
            .field("tools", &format!("{} tools", self.inner.tools.len()))
            .field(
                "sub_agents",
                &format!("{} sub-agents", self.inner.sub_agents.len()),
            )
            .field(
                "flow",
                &self
                    .inner
                    .flow
                    .as_ref()
                    .map(|flow| flow.name())
                    .unwrap_or("dynamic"),
            )
            .field("max_iterations", &self.inner.max_iterations)
            .finish()
    }
}

/// Builder for [`LlmAgent`] with validation.
///
/// Required: a valid name, and a model (explicit or registered via
/// [`crate::model::register_default_model`]). Everything else has
/// defaults: flow auto-selects (`auto` when sub-agents exist, `single`
/// otherwise), the iteration cap defaults to 10, and tool names must be
/// unique.
pub struct LlmAgentBuilder {
    name: String,
    description: Option<String>,
    model: Option<Arc<dyn Llm>>,
    retry_config: RetryConfig,
    instruction: Option<String>,
    global_instruction: Option<String>,
    instruction_provider: Option<InstructionProvider>,
    tools: Vec<Arc<dyn Tool>>,
    sub_agents: Vec<Arc<dyn BaseAgent>>,
    plugins: Vec<Arc<dyn Plugin>>,
    flow: Option<Flow>,
    tool_concurrency: Option<usize>,
    max_iterations: Option<u32>,
    include_contents: IncludeContents,
    output_key: Option<String>,
    generation_config: Option<GenerationConfig>,
    safety_settings: Vec<SafetySetting>,
    disallow_transfer_to_parent: bool,
    disallow_transfer_to_peers: bool,
}

impl LlmAgentBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            model: None,
            retry_config: RetryConfig::default(),
            instruction: None,
            global_instruction: None,
            instruction_provider: None,
            tools: Vec::new(),
            sub_agents: Vec::new(),
            plugins: Vec::new(),
            flow: None,
            tool_concurrency: None,
            max_iterations: None,
            include_contents: IncludeContents::Default,
            output_key: None,
            generation_config: None,
            safety_settings: Vec::new(),
            disallow_transfer_to_parent: false,
            disallow_transfer_to_peers: false,
        }
    }

    /// Sets the one-line description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the model backing this agent.
    pub fn model(mut self, model: Arc<dyn Llm>) -> Self {
        self.model = Some(model);
        self
    }

    /// Overrides the retry policy applied to model calls.
    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Sets the static instruction. `{{key}}` placeholders are templated
    /// against session state at request time.
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Sets the instruction contributed to every request when this agent
    /// is the tree root.
    pub fn global_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.global_instruction = Some(instruction.into());
        self
    }

    /// Replaces static instruction resolution with a dynamic provider.
    /// Templating is suppressed when the provider bypasses state
    /// injection.
    pub fn instruction_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&ReadonlyContext) -> CanonicalInstruction + Send + Sync + 'static,
    {
        self.instruction_provider = Some(Arc::new(provider));
        self
    }

    /// Adds a tool.
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Adds an already-shared tool.
    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Adds a sub-agent.
    pub fn sub_agent(mut self, agent: Arc<dyn BaseAgent>) -> Self {
        self.sub_agents.push(agent);
        self
    }

    /// Adds a plugin. Plugins run in registration order.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Overrides the flow. Without this, agents with sub-agents get
    /// [`Flow::auto`] and leaf agents get [`Flow::single`].
    pub fn flow(mut self, flow: Flow) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Bounds concurrently executing tool calls per model response.
    pub fn tool_concurrency(mut self, concurrency: usize) -> Self {
        self.tool_concurrency = Some(concurrency);
        self
    }

    /// Caps reasoning-loop iterations (default 10). Hitting the cap is
    /// not an error; the run ends with the last model response.
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Sets the history visibility policy.
    pub fn include_contents(mut self, include_contents: IncludeContents) -> Self {
        self.include_contents = include_contents;
        self
    }

    /// Saves the final response text into session state under this key.
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Sets the generation config applied to requests.
    pub fn generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = Some(config);
        self
    }

    /// Adds a safety setting.
    pub fn safety_setting(mut self, setting: SafetySetting) -> Self {
        self.safety_settings.push(setting);
        self
    }

    /// Disables transfer back to the parent agent.
    pub fn disallow_transfer_to_parent(mut self, disallow: bool) -> Self {
        self.disallow_transfer_to_parent = disallow;
        self
    }

    /// Disables transfer to and from sibling agents.
    pub fn disallow_transfer_to_peers(mut self, disallow: bool) -> Self {
        self.disallow_transfer_to_peers = disallow;
        self
    }

    /// Validates the configuration and builds the agent.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the name is invalid, no model is
    /// available, the generation config is out of range, or two tools
    /// share a name.
    pub fn build(self) -> Result<LlmAgent> {
        let name = AgentName::new(self.name)?.into_inner();

        let model = match self.model {
            Some(model) => model,
            None => default_model().ok_or_else(|| {
                Error::validation(format!(
                    "agent '{name}' has no model and no default model is registered"
                ))
            })?,
        };

        if let Some(config) = &self.generation_config {
            config.validate()?;
        }

        let mut tools_map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in &self.tools {
            if tools_map
                .insert(tool.name().to_string(), Arc::clone(tool))
                .is_some()
            {
                return Err(Error::validation(format!(
                    "duplicate tool name '{}' on agent '{name}'",
                    tool.name()
                )));
            }
        }

        let retrying = RetryingLlm::new(model, self.retry_config);
        let metrics = retrying.metrics();

        Ok(LlmAgent {
            inner: Arc::new(LlmAgentInner {
                name,
                description: self.description.unwrap_or_default(),
                model: Arc::new(retrying),
                metrics,
                instruction: self.instruction,
                global_instruction: self.global_instruction,
                instruction_provider: self.instruction_provider,
                tools: self.tools,
                tools_map,
                sub_agents: self.sub_agents,
                plugins: self.plugins,
                flow: self.flow,
                dispatcher: self
                    .tool_concurrency
                    .map(FunctionDispatcher::new)
                    .unwrap_or_default(),
                max_iterations: self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                include_contents: self.include_contents,
                output_key: self.output_key,
                generation_config: self.generation_config,
                safety_settings: self.safety_settings,
                disallow_transfer_to_parent: self.disallow_transfer_to_parent,
                disallow_transfer_to_peers: self.disallow_transfer_to_peers,
            }),
        })
    }
}
