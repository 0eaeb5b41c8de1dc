//! Provider-agnostic model abstraction.
//!
//! The engine never talks to a provider SDK directly. Everything goes
//! through the [`Llm`] trait: a request built by the flow pipeline goes in,
//! a normalized [`LlmResponse`] (or a lazy stream of chunks) comes out.
//! Provider adapters implement the trait and map their wire formats to the
//! neutral types here.
//!
//! [`RetryingLlm`] is the enforcement point for the retry policy: transient
//! failures (network, timeout, 5xx, 429) are retried with exponential
//! backoff, permanent failures surface immediately, and every call updates
//! the shared [`ModelMetrics`].
//!
//! A process-wide default model can be registered once with
//! [`register_default_model`] and is used by agents built without an
//! explicit model. Agents can always override it.

use crate::error::{Error, Result};
use crate::retry::{RetryConfig, retry_transient};
use crate::types::{Content, FunctionCall, GenerationConfig, SafetySetting, TokenUsage};
use async_trait::async_trait;
use futures::stream::Stream;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A tool declaration in the model-native shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    /// Tool name the model will reference in function calls.
    pub name: String,

    /// Human description guiding when the model should call the tool.
    pub description: String,

    /// JSON Schema of the accepted arguments.
    pub parameters: serde_json::Value,
}

/// A fully assembled model request.
///
/// Constructed fresh per iteration and mutated only through the processor
/// chain: the basic processor sets model and config, the instruction
/// processors accumulate `system_instruction`, the contents processor
/// materializes the history view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Model identifier the request targets.
    pub model: String,

    /// Ordered conversation contents the model will see.
    pub contents: Vec<Content>,

    /// Accumulated system instruction. Sections are separated by blank
    /// lines in the order processors appended them.
    pub system_instruction: String,

    /// Sampling and length settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    /// Safety settings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<SafetySetting>,

    /// Declared tools available to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
}

impl LlmRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a section to the system instruction.
    pub fn append_instruction(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.system_instruction.is_empty() {
            self.system_instruction.push_str("\n\n");
        }
        self.system_instruction.push_str(text);
    }

    /// Declares a tool, skipping duplicates by name.
    pub fn declare_tool(&mut self, declaration: ToolDeclaration) {
        if !self.tools.iter().any(|t| t.name == declaration.name) {
            self.tools.push(declaration);
        }
    }
}

/// Why the model stopped generating.
///
/// Provider-specific codes reduce to these four; unknown codes map to
/// [`FinishReason::Stop`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of generation.
    #[default]
    Stop,

    /// Output token limit reached.
    Length,

    /// The model requested tool execution.
    ToolCalls,

    /// Generation blocked by a content filter.
    ContentFilter,
}

impl FinishReason {
    /// Maps a provider-specific finish code. The mapping is strict about
    /// which codes it recognizes; anything unknown is `Stop`.
    pub fn from_provider_code(code: &str) -> Self {
        match code.to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "completed" => FinishReason::Stop,
            "length" | "max_tokens" | "max_output_tokens" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "safety" | "blocked" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// A normalized model response (or streaming chunk).
///
/// For streaming, chunks carry `partial = true` until the final chunk sets
/// `turn_complete`. `tool_calls` mirrors the function-call parts of
/// `content` so the dispatcher does not re-scan parts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Response content, if the model produced any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    /// Tool calls requested by the model, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCall>,

    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: FinishReason,

    /// Token accounting for this call, when the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Whether this is an incremental streaming chunk.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,

    /// Whether the model's turn is complete.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub turn_complete: bool,
}

impl LlmResponse {
    /// Builds a complete text response.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(Content::assistant_text(text)),
            finish_reason: FinishReason::Stop,
            turn_complete: true,
            ..Default::default()
        }
    }

    /// Builds a response from assistant content, deriving `tool_calls` and
    /// the finish reason from its parts.
    pub fn from_content(content: Content) -> Self {
        let tool_calls: Vec<FunctionCall> =
            content.function_calls().into_iter().cloned().collect();
        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        Self {
            content: Some(content),
            tool_calls,
            finish_reason,
            turn_complete: true,
            ..Default::default()
        }
    }

    /// Builds a response requesting the given tool calls.
    pub fn tool_calls(calls: Vec<FunctionCall>) -> Self {
        let parts = calls
            .iter()
            .cloned()
            .map(crate::types::Part::FunctionCall)
            .collect();
        Self {
            content: Some(Content::assistant(parts)),
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            turn_complete: true,
            ..Default::default()
        }
    }

    /// Concatenated text of the response content.
    pub fn text_content(&self) -> String {
        self.content.as_ref().map(Content::text).unwrap_or_default()
    }
}

/// Lazy finite stream of response chunks.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmResponse>> + Send>>;

/// Declared abilities of a model implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub images: bool,
    pub audio: bool,
    pub video: bool,
    pub system_instructions: bool,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tools: true,
            images: false,
            audio: false,
            video: false,
            system_instructions: true,
            max_input_tokens: None,
            max_output_tokens: None,
        }
    }
}

/// Provider-agnostic model interface.
///
/// `generate_streaming` and `count_tokens` have workable defaults so
/// minimal adapters only implement `generate_content`.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Model identifier, e.g. `gemini-2.0-flash`.
    fn name(&self) -> &str;

    /// Declared capabilities.
    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
    }

    /// Generates one complete response.
    async fn generate_content(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Generates a lazy stream of chunks. The default implementation
    /// produces a single complete chunk from `generate_content`.
    async fn generate_streaming(&self, request: &LlmRequest) -> Result<LlmStream> {
        let response = self.generate_content(request).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(response) })))
    }

    /// Counts (or estimates) tokens for the given contents. The default is
    /// the character-based approximation of 1 token per 4 characters.
    async fn count_tokens(&self, contents: &[Content]) -> Result<usize> {
        let chars: usize = contents
            .iter()
            .map(|c| c.parts.iter().filter_map(|p| p.as_text()).map(str::len).sum::<usize>())
            .sum();
        Ok(chars.div_ceil(4))
    }
}

/// Point-in-time view of a model's metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelMetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub tokens_used: u64,
    pub average_latency_ms: u64,
}

/// Cumulative per-model metrics, shared across callers.
#[derive(Debug, Default)]
pub struct ModelMetrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    tokens_used: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl ModelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_success(&self, latency_ms: u64, usage: Option<&TokenUsage>) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if let Some(usage) = usage {
            self.tokens_used.fetch_add(usage.total_tokens, Ordering::Relaxed);
        }
    }

    fn record_error(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Returns a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> ModelMetricsSnapshot {
        let request_count = self.request_count.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        ModelMetricsSnapshot {
            request_count,
            error_count: self.error_count.load(Ordering::Relaxed),
            tokens_used: self.tokens_used.load(Ordering::Relaxed),
            average_latency_ms: if request_count == 0 {
                0
            } else {
                total_latency / request_count
            },
        }
    }
}

/// Wrapper enforcing retry-with-backoff and metrics on every call.
///
/// Wraps any [`Llm`]; agents wrap their configured model in this
/// automatically. Retries apply only to failures classified as transient
/// by [`Error::is_retryable`].
pub struct RetryingLlm {
    inner: Arc<dyn Llm>,
    retry: RetryConfig,
    metrics: Arc<ModelMetrics>,
}

impl RetryingLlm {
    pub fn new(inner: Arc<dyn Llm>, retry: RetryConfig) -> Self {
        Self {
            inner,
            retry,
            metrics: Arc::new(ModelMetrics::new()),
        }
    }

    /// The metrics shared by all calls through this wrapper.
    pub fn metrics(&self) -> Arc<ModelMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl Llm for RetryingLlm {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> ModelCapabilities {
        self.inner.capabilities()
    }

    async fn generate_content(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let started = Instant::now();
        let result = retry_transient(&self.retry, || self.inner.generate_content(request)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => self.metrics.record_success(latency_ms, response.usage.as_ref()),
            Err(err) => {
                log::warn!("model '{}' call failed: {}", self.inner.name(), err);
                self.metrics.record_error(latency_ms);
            }
        }
        result
    }

    async fn generate_streaming(&self, request: &LlmRequest) -> Result<LlmStream> {
        // Retry covers stream establishment; chunk failures surface as-is
        let started = Instant::now();
        let result = retry_transient(&self.retry, || self.inner.generate_streaming(request)).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.metrics.record_success(latency_ms, None),
            Err(_) => self.metrics.record_error(latency_ms),
        }
        result
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<usize> {
        self.inner.count_tokens(contents).await
    }
}

static DEFAULT_MODEL: OnceCell<Arc<dyn Llm>> = OnceCell::new();

/// Registers the process-wide default model. Returns an error when a
/// default was already registered.
pub fn register_default_model(model: Arc<dyn Llm>) -> Result<()> {
    DEFAULT_MODEL
        .set(model)
        .map_err(|_| Error::validation("a default model is already registered"))
}

/// Returns the process-wide default model, if one was registered.
pub fn default_model() -> Option<Arc<dyn Llm>> {
    DEFAULT_MODEL.get().cloned()
}
