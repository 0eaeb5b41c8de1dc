//! Core type definitions for the agent engine.
//!
//! This module contains the fundamental data structures used throughout the
//! engine. The type system is organized into three main categories:
//!
//! # Message System
//!
//! The engine uses a multi-modal message system shared by the session log,
//! the model abstraction, and the tool dispatcher:
//!
//! - [`Content`]: Container for conversation messages with role and parts
//! - [`Role`]: Enum defining who produced the content (System, User, Assistant, Tool)
//! - [`Part`]: Enum for different content types (text, images, function calls, function responses)
//! - [`FunctionCall`]: A request from the model to execute a tool
//! - [`FunctionResponse`]: The result of a tool execution fed back to the model
//!
//! # Model Configuration
//!
//! - [`GenerationConfig`]: Sampling and length settings applied to a model request
//! - [`SafetySetting`]: A safety category with its blocking threshold
//! - [`TokenUsage`]: Per-call token accounting reported by providers
//!
//! # Identity
//!
//! - [`AgentName`]: Validated agent name, safe for use in dotted branch paths
//!
//! # Example
//!
//! ```
//! use agent_kit::{Content, Part};
//!
//! let msg = Content::user("Please greet John");
//! assert_eq!(msg.text(), "Please greet John");
//!
//! let reply = Content::assistant(vec![Part::text("Hello, John!")]);
//! assert_eq!(reply.text(), "Hello, John!");
//! ```

use crate::Error;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// IDENTITY
// ============================================================================

/// Validated agent name.
///
/// Agent names appear in dotted branch paths (`coordinator.greeter`), so
/// they must be non-empty and must not contain `.` themselves.
///
/// # Example
///
/// ```
/// use agent_kit::AgentName;
///
/// let name = AgentName::new("greeter").unwrap();
/// assert_eq!(name.as_str(), "greeter");
///
/// assert!(AgentName::new("").is_err());
/// assert!(AgentName::new("a.b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentName(String);

impl AgentName {
    /// Creates a new `AgentName` after validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, whitespace-only, or contains `.`.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("agent name cannot be empty"));
        }
        if name.contains('.') {
            return Err(Error::validation(
                "agent name cannot contain '.' (reserved for branch paths)",
            ));
        }
        Ok(AgentName(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the `AgentName` and returns the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// MESSAGE SYSTEM
// ============================================================================

/// Identifies the producer of a [`Content`].
///
/// Serializes to lowercase strings (`"system"`, `"user"`, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instruction-level content assembled by the flow pipeline.
    System,

    /// Input from the human or calling application.
    User,

    /// Output produced by the model, possibly including function calls.
    Assistant,

    /// Function responses produced by tool execution.
    Tool,
}

/// A request from the model to execute a named tool.
///
/// `id` correlates the call with its later [`FunctionResponse`]. Models may
/// omit ids; the dispatcher assigns framework-generated ones (with a
/// reserved prefix) before execution, and the contents pipeline strips
/// those again so they never reach the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// Correlation id, unique for the life of the call/response pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Name of the tool to execute. Must match a tool registered on the
    /// agent, otherwise the dispatcher produces an error response.
    pub name: String,

    /// JSON arguments matching the tool's parameter schema.
    pub args: Value,
}

impl FunctionCall {
    /// Creates a function call without an id. The dispatcher will assign one.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Creates a function call with an explicit id.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            args,
        }
    }
}

/// The result of executing a [`FunctionCall`], addressed by the same id.
///
/// Failures travel through the same type with `error` populated; the model
/// sees a response either way and can react to the failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    /// Id of the originating function call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Name of the tool that produced this response.
    pub name: String,

    /// JSON result payload. Serialized to a string form for the model.
    pub content: Value,

    /// Set when the tool failed. The conversation continues regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunctionResponse {
    /// Creates a successful function response.
    pub fn new(id: impl Into<String>, name: impl Into<String>, content: Value) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            content,
            error: None,
        }
    }

    /// Creates a failed function response.
    pub fn error(id: impl Into<String>, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            content: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Whether the tool execution failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Simple text content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    /// The text content.
    pub text: String,
}

/// Inline image content, carried as base64 data with a MIME type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImagePart {
    /// MIME type of the image, e.g. `image/png`.
    pub mime_type: String,

    /// Base64-encoded image bytes.
    pub data: String,
}

/// Multi-modal parts that can appear in a [`Content`].
///
/// Uses serde's internally tagged format with a `"type"` field:
///
/// ```json
/// {"type": "text", "text": "Hello"}
/// {"type": "function_call", "id": "call_1", "name": "greet", "args": {...}}
/// {"type": "function_response", "id": "call_1", "name": "greet", "content": {...}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text(TextPart),

    /// Inline image for vision-capable models.
    Image(ImagePart),

    /// Tool invocation requested by the model.
    FunctionCall(FunctionCall),

    /// Tool result fed back to the model.
    FunctionResponse(FunctionResponse),
}

impl Part {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(TextPart { text: text.into() })
    }

    /// Creates an image part from already-encoded base64 data.
    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::Image(ImagePart {
            mime_type: mime_type.into(),
            data: data.into(),
        })
    }

    /// Creates an image part from raw bytes, encoding them as base64.
    pub fn image_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Part::Image(ImagePart {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }

    /// Creates a function call part without an id.
    pub fn function_call(name: impl Into<String>, args: Value) -> Self {
        Part::FunctionCall(FunctionCall::new(name, args))
    }

    /// Creates a function response part.
    pub fn function_response(
        id: impl Into<String>,
        name: impl Into<String>,
        content: Value,
    ) -> Self {
        Part::FunctionResponse(FunctionResponse::new(id, name, content))
    }

    /// Returns the text if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(t) => Some(&t.text),
            _ => None,
        }
    }

    /// Returns the function call if this is a function call part.
    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(c) => Some(c),
            _ => None,
        }
    }

    /// Returns the function response if this is a function response part.
    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse(r) => Some(r),
            _ => None,
        }
    }
}

/// A complete message in a conversation.
///
/// Content is the unit exchanged between the user, the model, and tools.
/// It carries a role and an ordered sequence of parts, and is immutable
/// once appended to a session's event log.
///
/// # Examples
///
/// ```
/// use agent_kit::{Content, Part, Role};
/// use serde_json::json;
///
/// // Simple user message
/// let msg = Content::user("What's the weather?");
///
/// // Assistant response requesting a tool
/// let reply = Content::assistant(vec![
///     Part::text("Let me check."),
///     Part::function_call("get_weather", json!({"location": "Paris"})),
/// ]);
/// assert_eq!(reply.function_calls().len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    /// The producer of this content.
    pub role: Role,

    /// The ordered parts that make up this content.
    pub parts: Vec<Part>,
}

impl Content {
    /// Creates content with the given role and parts.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Creates a user message from plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Creates a system message from plain text.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    /// Creates an assistant message from parts.
    pub fn assistant(parts: Vec<Part>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    /// Creates an assistant message from plain text.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![Part::text(text)])
    }

    /// Creates a tool message carrying function responses.
    pub fn tool(parts: Vec<Part>) -> Self {
        Self::new(Role::Tool, parts)
    }

    /// Concatenates all text parts into one string.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Returns all function calls in this content, in order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts
            .iter()
            .filter_map(Part::as_function_call)
            .collect()
    }

    /// Returns all function responses in this content, in order.
    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.parts
            .iter()
            .filter_map(Part::as_function_response)
            .collect()
    }

    /// Whether any part is a function call.
    pub fn has_function_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::FunctionCall(_)))
    }

    /// Whether this content carries no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

// ============================================================================
// MODEL CONFIGURATION
// ============================================================================

/// Sampling and length settings applied to a model request.
///
/// All fields are optional; `None` means the provider default. The
/// recognized fields are fixed so providers can map them without
/// inspecting opaque maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    /// Sampling temperature, typically 0.0 to 2.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling probability mass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Maximum tokens the model should generate in a single response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Sequences at which generation stops.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    /// Number of candidates to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,

    /// Presence penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Frequency penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl GenerationConfig {
    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns a validation error when temperature is outside 0.0..=2.0 or
    /// `max_output_tokens` is zero.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::validation("temperature must be between 0.0 and 2.0"));
            }
        }
        if let Some(0) = self.max_output_tokens {
            return Err(Error::validation("max_output_tokens must be greater than 0"));
        }
        Ok(())
    }
}

/// A safety category paired with its blocking threshold.
///
/// Categories and thresholds are provider-mapped strings, e.g.
/// `("harassment", "block_medium_and_above")`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetySetting {
    /// Harm category identifier.
    pub category: String,

    /// Blocking threshold identifier.
    pub threshold: String,
}

impl SafetySetting {
    pub fn new(category: impl Into<String>, threshold: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            threshold: threshold.into(),
        }
    }
}

/// Token accounting reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Tokens consumed by the request contents.
    pub input_tokens: u64,

    /// Tokens produced by the model.
    pub output_tokens: u64,

    /// Total of input and output tokens.
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Adds another usage record into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}
