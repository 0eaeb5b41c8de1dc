//! # Tool System
//!
//! Tools are named, schema-described callables exposed to the model. This
//! module provides the uniform tool contract plus a closure-backed
//! implementation with automatic schema normalization.
//!
//! ## Architecture Overview
//!
//! 1. **Tool Contract** - The [`Tool`] trait exposes metadata (name,
//!    description, parameter schema, long-running flag) and an async
//!    `execute` entry point receiving a [`ToolContext`].
//!
//! 2. **Schema Flexibility** - [`FunctionTool`] accepts simple type
//!    notation, extended property schemas, or full JSON Schema, and
//!    normalizes all of them to the standard JSON Schema structure models
//!    expect.
//!
//! 3. **Result-or-error execution** - Tool failures are values, not
//!    unwinding: `execute` returns `Result<Value>` and the dispatcher
//!    packages errors into function responses so the model can react.
//!
//! ## Tool Lifecycle
//!
//! ```text
//! 1. Definition:   Create tool with name, description, schema, and handler
//! 2. Registration: Add tool to an agent at construction time
//! 3. Invocation:   Model emits a function call with arguments
//! 4. Execution:    Dispatcher runs the tool with a per-call ToolContext
//! 5. Response:     Result is merged into a function response event
//! ```
//!
//! ## Examples
//!
//! ```rust
//! use agent_kit::function_tool;
//! use serde_json::json;
//!
//! let greet = function_tool("greet", "Greet a person by name")
//!     .param("name", "string")
//!     .build(|args, _ctx| async move {
//!         let name = args["name"].as_str().unwrap_or("there");
//!         Ok(json!(format!("Hello, {}!", name)))
//!     });
//! ```

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Reserved name of the credential-request tool.
///
/// Calls to this tool are not routed to application code. The dispatcher
/// answers them directly, surfacing the requested auth configuration back
/// to the caller in the function response.
pub const CREDENTIAL_REQUEST_TOOL: &str = "adk_request_credential";

/// Uniform contract every tool implements.
///
/// Tool instances are intended to be immutable after construction and are
/// shared behind `Arc`. Tools that need per-call state must key it by the
/// `function_call_id` carried in the [`ToolContext`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within one agent's tool set.
    fn name(&self) -> &str;

    /// Human description sent to the model.
    fn description(&self) -> &str;

    /// JSON-schema-shaped parameter description.
    fn parameters_schema(&self) -> Value;

    /// Whether responses are deferred past the issuing invocation.
    fn is_long_running(&self) -> bool {
        false
    }

    /// Executes the tool. Errors become function responses with `error`
    /// set; they never abort the conversation.
    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<Value>;
}

/// Per-call context handed to a tool.
///
/// Carries the invocation identity, the originating call id, a read
/// snapshot of session state, and a write channel for state changes. The
/// context is cheap to clone; clones share the same delta sink, so a
/// handler may move a clone into spawned work and writes still reach the
/// engine.
#[derive(Clone)]
pub struct ToolContext {
    /// Id of the invocation that issued the call.
    pub invocation_id: String,

    /// Name of the agent that owns the tool.
    pub agent_name: String,

    /// Branch path of the issuing agent.
    pub branch: String,

    /// Id of the originating function call.
    pub function_call_id: String,

    state: Arc<HashMap<String, Value>>,
    state_delta: Arc<Mutex<HashMap<String, Value>>>,
}

impl ToolContext {
    /// Creates a context for one tool call.
    pub fn new(
        invocation_id: impl Into<String>,
        agent_name: impl Into<String>,
        branch: impl Into<String>,
        function_call_id: impl Into<String>,
        state: HashMap<String, Value>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            agent_name: agent_name.into(),
            branch: branch.into(),
            function_call_id: function_call_id.into(),
            state: Arc::new(state),
            state_delta: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reads a session state value from the snapshot taken at dispatch time.
    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Records a session state change. Deltas are applied atomically with
    /// the tool response event.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.state_delta
            .lock()
            .expect("state delta lock poisoned")
            .insert(key.into(), value);
    }

    /// Drains the recorded state delta. Called by the dispatcher after
    /// execution.
    pub fn take_state_delta(&self) -> HashMap<String, Value> {
        std::mem::take(
            &mut *self
                .state_delta
                .lock()
                .expect("state delta lock poisoned"),
        )
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("invocation_id", &self.invocation_id)
            .field("agent_name", &self.agent_name)
            .field("function_call_id", &self.function_call_id)
            .finish()
    }
}

/// Type alias for tool handler functions.
///
/// Handlers take the JSON arguments and the per-call [`ToolContext`] and
/// return a pinned, boxed future. The `Arc` wrapper makes handlers cheap
/// to clone and safe to share across threads; boxing erases the concrete
/// future type so differently-typed handlers live in one collection.
pub type ToolHandler = Arc<
    dyn Fn(Value, ToolContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed [`Tool`] implementation.
///
/// `FunctionTool` is the workhorse for application tools: give it a name,
/// a description, a parameter schema in any supported notation, and an
/// async handler. Cloning is cheap (strings plus an `Arc` bump) and the
/// metadata never changes after construction.
///
/// ## Examples
///
/// ```rust
/// use agent_kit::FunctionTool;
/// use serde_json::json;
///
/// let multiply = FunctionTool::new(
///     "multiply",
///     "Multiply two numbers together",
///     json!({"a": "number", "b": "number"}),
///     |args, _ctx| Box::pin(async move {
///         let a = args["a"].as_f64().unwrap_or(1.0);
///         let b = args["b"].as_f64().unwrap_or(1.0);
///         Ok(json!({"result": a * b}))
///     }),
/// );
/// assert_eq!(multiply.name(), "multiply");
/// # use agent_kit::Tool;
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters_schema: Value,
    long_running: bool,
    handler: ToolHandler,
}

impl FunctionTool {
    /// Create a new tool with flexible schema definition.
    ///
    /// ## Schema Formats
    ///
    /// ### 1. Simple Type Notation
    /// ```json
    /// {"location": "string", "sides": "integer"}
    /// ```
    /// All parameters are required by default.
    ///
    /// ### 2. Extended Property Schema
    /// ```json
    /// {"query": {"type": "string", "description": "Search query"},
    ///  "limit": {"type": "integer", "optional": true}}
    /// ```
    ///
    /// ### 3. Full JSON Schema
    /// ```json
    /// {"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}
    /// ```
    /// Already valid JSON Schema is passed through unchanged.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: normalize_schema(parameters_schema),
            long_running: false,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    /// Marks the tool as long-running: its response is not awaited within
    /// the invocation that issued the call.
    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters_schema", &self.parameters_schema)
            .field("long_running", &self.long_running)
            // Handler is intentionally omitted - it's not debuggable
            .finish()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters_schema.clone()
    }

    fn is_long_running(&self) -> bool {
        self.long_running
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<Value> {
        (self.handler)(args, ctx).await
    }
}

/// Convert various schema notations to standard JSON Schema.
///
/// Inputs that already carry `"type": "object"` and `"properties"` pass
/// through unchanged. Otherwise each entry is treated either as a simple
/// type string or as an extended property schema; the non-standard
/// `"optional"`/`"required"` per-property flags are folded into the
/// `required` array and removed. Properties with a `"default"` value are
/// optional unless explicitly required.
fn normalize_schema(schema: Value) -> Value {
    if let Some(obj) = schema.as_object() {
        if obj.contains_key("type") && obj.contains_key("properties") {
            return schema;
        }

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for (param_name, param_type) in obj {
            if let Some(type_str) = param_type.as_str() {
                properties.insert(param_name.clone(), type_to_json_schema(type_str));
                required.push(param_name.clone());
            } else if param_type.is_object() {
                let mut prop = param_type.clone();
                let prop_obj = prop
                    .as_object_mut()
                    .expect("BUG: is_object() returned true but as_object_mut() returned None");

                let is_optional = prop_obj
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
                let has_default = prop_obj.contains_key("default");

                properties.insert(param_name.clone(), prop);

                if let Some(true) = is_required {
                    required.push(param_name.clone());
                } else if is_optional || is_required == Some(false) {
                    // Explicitly optional
                } else if !has_default {
                    required.push(param_name.clone());
                }
            }
        }

        return serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required
        });
    }

    // Non-object input: accept-anything schema
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// Convert a type string to a JSON Schema type object.
///
/// Accepts standard JSON Schema names, common abbreviations, and Rust-like
/// type names. Unknown strings default to `"string"` rather than failing.
fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };

    serde_json::json!({ "type": json_type })
}

/// Builder for creating function tools with a fluent API.
///
/// 1. Create the builder with [`function_tool()`]
/// 2. Add parameters with [`.param()`](FunctionToolBuilder::param) or set a
///    complete schema with [`.schema()`](FunctionToolBuilder::schema)
/// 3. Optionally mark the tool [`.long_running()`](FunctionToolBuilder::long_running)
/// 4. Finalize with [`.build()`](FunctionToolBuilder::build) and a handler
pub struct FunctionToolBuilder {
    name: String,
    description: String,
    schema: Value,
    long_running: bool,
}

impl FunctionToolBuilder {
    /// Start building a tool with a name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({}),
            long_running: false,
        }
    }

    /// Set the complete input schema, replacing anything set previously.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Add a single required parameter with a simple type string.
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        let obj = self
            .schema
            .as_object_mut()
            .expect("BUG: schema should be an object after initialization");
        obj.insert(name.to_string(), Value::String(type_str.to_string()));
        self
    }

    /// Mark the tool as long-running.
    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    /// Build the final tool with a handler function.
    pub fn build<F, Fut>(self, handler: F) -> FunctionTool
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        FunctionTool::new(self.name, self.description, self.schema, handler)
            .long_running(self.long_running)
    }
}

/// Create a tool using the builder pattern (convenience function).
///
/// ```rust
/// use agent_kit::function_tool;
/// use serde_json::json;
///
/// let roll = function_tool("roll_die", "Roll an n-sided die")
///     .param("sides", "integer")
///     .build(|args, _ctx| async move {
///         let sides = args["sides"].as_u64().unwrap_or(6);
///         Ok(json!({"rolled": sides.min(4)}))
///     });
/// ```
pub fn function_tool(
    name: impl Into<String>,
    description: impl Into<String>,
) -> FunctionToolBuilder {
    FunctionToolBuilder::new(name, description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;

    fn test_ctx() -> ToolContext {
        ToolContext::new("inv", "agent", "agent", "call-1", HashMap::new())
    }

    #[test]
    fn test_type_to_json_schema() {
        assert_eq!(type_to_json_schema("string"), json!({"type": "string"}));
        assert_eq!(type_to_json_schema("integer"), json!({"type": "integer"}));
        assert_eq!(type_to_json_schema("number"), json!({"type": "number"}));
        assert_eq!(type_to_json_schema("bool"), json!({"type": "boolean"}));
        assert_eq!(type_to_json_schema("unknown"), json!({"type": "string"}));
    }

    #[test]
    fn test_normalize_simple_schema() {
        let schema = json!({
            "location": "string",
            "units": "string"
        });

        let result = normalize_schema(schema);

        assert_eq!(result["type"], "object");
        assert_eq!(result["properties"]["location"]["type"], "string");
        assert_eq!(result["properties"]["units"]["type"], "string");
        assert_eq!(result["required"], json!(["location", "units"]));
    }

    #[test]
    fn test_normalize_full_schema_passthrough() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"}
            },
            "required": ["name"]
        });

        let result = normalize_schema(schema.clone());
        assert_eq!(result, schema);
    }

    #[test]
    fn test_normalize_extended_schema_optional() {
        let schema = json!({
            "query": {"type": "string", "description": "Search query"},
            "limit": {"type": "integer", "optional": true},
            "page": {"type": "integer", "default": 1}
        });

        let result = normalize_schema(schema);
        assert_eq!(result["required"], json!(["query"]));
        // Non-standard flags are stripped from the property schemas
        assert!(result["properties"]["limit"].get("optional").is_none());
    }

    #[tokio::test]
    async fn test_function_tool_execute() {
        let add = function_tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args, _ctx| async move {
                let a = args
                    .get("a")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| Error::validation("Parameter 'a' must be a number"))?;
                let b = args
                    .get("b")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| Error::validation("Parameter 'b' must be a number"))?;
                Ok(json!({"result": a + b}))
            });

        assert_eq!(add.name(), "add");
        assert!(!add.is_long_running());

        let result = add
            .execute(json!({"a": 5.0, "b": 3.0}), test_ctx())
            .await
            .unwrap();
        assert_eq!(result["result"], 8.0);
    }

    #[tokio::test]
    async fn test_long_running_flag() {
        let pending = function_tool("enqueue_job", "Queue a background job")
            .param("job", "string")
            .long_running(true)
            .build(|_, _| async move { Ok(json!({"queued": true})) });

        assert!(pending.is_long_running());
    }

    #[tokio::test]
    async fn test_tool_context_state_delta() {
        let ctx = ToolContext::new(
            "inv",
            "agent",
            "agent",
            "call-1",
            HashMap::from([("user_name".to_string(), json!("Ada"))]),
        );

        assert_eq!(ctx.state_value("user_name"), Some(&json!("Ada")));
        assert_eq!(ctx.state_value("missing"), None);

        let clone = ctx.clone();
        clone.set_state("visits", json!(3));

        // Writes through a clone reach the shared sink
        let delta = ctx.take_state_delta();
        assert_eq!(delta["visits"], json!(3));
        assert!(ctx.take_state_delta().is_empty());
    }

    #[test]
    fn test_param_after_non_object_schema() {
        // Calling .param() after setting schema to a non-object resets it
        let tool = function_tool("test", "Test tool")
            .schema(json!("string"))
            .param("key", "number")
            .build(|_, _| async { Ok(json!({})) });

        let schema = tool.parameters_schema();
        assert!(schema["properties"]["key"].is_object());
    }
}
