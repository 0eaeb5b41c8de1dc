//! # Agent Kit
//!
//! An agent orchestration engine for building LLM-powered agents in Rust.
//!
//! ## Overview
//!
//! This crate is the runtime that drives conversations between user
//! requests, language models, and tool implementations. It provides:
//!
//! - **Reasoning loop**: each user message becomes a sequence of
//!   (model call, parallel tool dispatch)* iterations under an iteration cap
//! - **Flow pipeline**: every model request is assembled by an ordered
//!   processor chain (config, instructions, identity, history, transfer)
//! - **Composite agents**: sequential, parallel, and loop combinators,
//!   plus model-driven transfer between related agents
//! - **Sessions & events**: an append-only event log with branch-scoped
//!   history views and atomic state deltas
//! - **Runner**: a session-scoped driver enforcing timeouts and caps,
//!   with streaming output, metrics, and event fan-out
//!
//! Transports (HTTP, WebSocket, CLI), concrete model providers, and
//! persistent stores stay outside: they plug in behind the [`Llm`],
//! [`SessionService`], and [`Tool`] traits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_kit::{Content, InMemoryRunner, LlmAgent, function_tool};
//! use serde_json::json;
//! use std::sync::Arc;
//! # fn model() -> Arc<dyn agent_kit::Llm> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> agent_kit::Result<()> {
//!     agent_kit::logging::init();
//!
//!     let greet = function_tool("greet", "Greet a person by name")
//!         .param("name", "string")
//!         .build(|args, _ctx| async move {
//!             let name = args["name"].as_str().unwrap_or("there");
//!             Ok(json!(format!("Hello, {}!", name)))
//!         });
//!
//!     let agent = LlmAgent::builder("greeter")
//!         .description("Greets people")
//!         .model(model())
//!         .instruction("Use the greet tool to greet the user.")
//!         .tool(greet)
//!         .build()?;
//!
//!     let runner = InMemoryRunner::new("demo", Arc::new(agent))?;
//!     runner.ensure_session("user-1", Some("s-1".into())).await?;
//!
//!     let result = runner
//!         .run("user-1", "s-1", Content::user("Please greet John"))
//!         .await?;
//!     println!("{}", result.final_response.map(|c| c.text()).unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: contents, parts, function calls/responses, model config
//! - **event / session**: the append-only log and its storage interface
//! - **context**: the per-invocation context threaded through everything
//! - **tool**: the tool contract and the closure-backed function tool
//! - **model**: the provider-agnostic model trait, retry, and metrics
//! - **flow**: the request/response processor pipeline and history views
//! - **dispatcher**: parallel function-call execution and merging
//! - **agent**: the base trait, the agent tree, and the reasoning agent
//! - **composite**: sequential, parallel, and loop combinators
//! - **runner**: the session-scoped driver
//! - **discovery**: agents-directory scanning with lazy instantiation

mod agent;
mod composite;
mod context;
mod dispatcher;
mod error;
mod session;
mod tool;
mod types;

/// Event records and branch-path scoping helpers.
pub mod event;

/// The request/response processor pipeline and history view construction.
pub mod flow;

/// Agent discovery from source directories.
pub mod discovery;

/// Session-state templating for instructions.
pub mod instruction;

/// Explicit logger initialization.
pub mod logging;

/// Provider-agnostic model abstraction.
pub mod model;

/// Plugin callbacks for observing and steering execution.
pub mod plugin;

/// Retry utilities with exponential backoff.
pub mod retry;

/// The session-scoped driver.
pub mod runner;

// --- Core agent API ---

pub use agent::{
    AgentTree, BaseAgent, CanonicalInstruction, EventStream, IncludeContents, InstructionProvider,
    LlmAgent, LlmAgentBuilder,
};
pub use composite::{LoopAgent, ParallelAgent, SequentialAgent};

// --- Context ---

pub use context::{DEFAULT_MAX_ITERATIONS, InvocationContext, ReadonlyContext};

// --- Dispatch ---

pub use dispatcher::{
    DispatchOutcome, FunctionDispatcher, RESERVED_CALL_ID_PREFIX, assign_call_ids, new_call_id,
};

// --- Error handling ---

pub use error::{Error, Result};

// --- Events & sessions ---

pub use event::{Event, EventActions, EventKind, USER_AUTHOR};
pub use session::{InMemorySessionService, Session, SessionService};

// --- Flows ---

pub use flow::{Flow, RequestProcessor, ResponseProcessor, TRANSFER_TO_AGENT_TOOL};

// --- Model abstraction ---

pub use model::{
    FinishReason, Llm, LlmRequest, LlmResponse, LlmStream, ModelCapabilities, ModelMetrics,
    ModelMetricsSnapshot, RetryingLlm, ToolDeclaration, default_model, register_default_model,
};

// --- Plugins ---

pub use plugin::{Plugin, ToolDecision};

// --- Runner ---

pub use runner::{
    EventCallback, InMemoryRunner, Runner, RunnerConfig, RunnerMetrics, RunnerResult,
};

// --- Tool system ---

pub use tool::{
    CREDENTIAL_REQUEST_TOOL, FunctionTool, FunctionToolBuilder, Tool, ToolContext, function_tool,
};

// --- Core types ---

pub use types::{
    AgentName, Content, FunctionCall, FunctionResponse, GenerationConfig, ImagePart, Part, Role,
    SafetySetting, TextPart, TokenUsage,
};

/// Convenience module containing the most commonly used types and
/// functions. Import with `use agent_kit::prelude::*;`.
pub mod prelude {
    pub use crate::{
        BaseAgent, Content, Error, Event, EventKind, FunctionCall, FunctionResponse,
        InMemoryRunner, InMemorySessionService, LlmAgent, LoopAgent, ParallelAgent, Part, Plugin,
        Result, Role, Runner, RunnerConfig, SequentialAgent, SessionService, Tool, ToolContext,
        ToolDecision, function_tool,
    };
}
