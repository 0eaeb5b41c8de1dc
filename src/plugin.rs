//! Plugin callbacks for observing and steering agent execution.
//!
//! Plugins hook the agent lifecycle at five points: before and after the
//! agent run, before and after each tool execution, and on errors. They
//! are registered per agent (no global registry) and run in registration
//! order.
//!
//! Tool hooks can return a [`ToolDecision`] to block a call, rewrite its
//! arguments, or rewrite its result; the first plugin returning a decision
//! wins. Errors thrown by `on_error` handlers are logged and never mask
//! the error that triggered them.
//!
//! # Examples
//!
//! ```rust
//! use agent_kit::{InvocationContext, Plugin, ToolDecision};
//! use async_trait::async_trait;
//! use serde_json::Value;
//!
//! struct AuditLog;
//!
//! #[async_trait]
//! impl Plugin for AuditLog {
//!     fn name(&self) -> &str {
//!         "audit_log"
//!     }
//!
//!     async fn before_tool(
//!         &self,
//!         tool_name: &str,
//!         args: &Value,
//!         _ctx: &InvocationContext,
//!     ) -> agent_kit::Result<Option<ToolDecision>> {
//!         if tool_name == "delete_everything" {
//!             return Ok(Some(ToolDecision::block("destructive tool disabled")));
//!         }
//!         log::info!("tool {tool_name} called with {args}");
//!         Ok(None)
//!     }
//! }
//! ```

use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::types::Content;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Decision returned by a tool hook to control execution.
#[derive(Debug, Clone, Default)]
pub struct ToolDecision {
    /// Whether the call should proceed (or, for `after_tool`, whether the
    /// result stands).
    pub proceed: bool,

    /// For `before_tool`: replacement arguments.
    pub modified_args: Option<Value>,

    /// For `after_tool`: replacement result.
    pub modified_result: Option<Value>,

    /// Optional explanation for logging.
    pub reason: Option<String>,
}

impl ToolDecision {
    /// Allow the call to proceed unchanged.
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            ..Default::default()
        }
    }

    /// Block the call. The model receives an error response carrying the
    /// reason.
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Proceed with rewritten arguments.
    pub fn modify_args(args: Value, reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            modified_args: Some(args),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Replace the tool result.
    pub fn modify_result(result: Value, reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            modified_result: Some(result),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Lifecycle callbacks invoked by the agent loop. All methods default to
/// no-ops; implement only what you need.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Called once before the reasoning loop starts.
    async fn before_agent_run(&self, _ctx: &InvocationContext) -> Result<()> {
        Ok(())
    }

    /// Called once after the reasoning loop finishes, with the final
    /// response if one was produced.
    async fn after_agent_run(
        &self,
        _ctx: &InvocationContext,
        _final_response: Option<&Content>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before each tool execution. Returning a decision controls
    /// the call; `None` means no opinion.
    async fn before_tool(
        &self,
        _tool_name: &str,
        _args: &Value,
        _ctx: &InvocationContext,
    ) -> Result<Option<ToolDecision>> {
        Ok(None)
    }

    /// Called after each tool execution with the raw result.
    async fn after_tool(
        &self,
        _tool_name: &str,
        _result: &Value,
        _ctx: &InvocationContext,
    ) -> Result<Option<ToolDecision>> {
        Ok(None)
    }

    /// Called when the run hits an error. Failures here are logged, never
    /// propagated.
    async fn on_error(&self, _ctx: &InvocationContext, _error: &Error) {}
}

/// Runs `before_tool` across plugins in order; the first decision wins.
pub(crate) async fn run_before_tool(
    plugins: &[Arc<dyn Plugin>],
    tool_name: &str,
    args: &Value,
    ctx: &InvocationContext,
) -> Result<Option<ToolDecision>> {
    for plugin in plugins {
        if let Some(decision) = plugin.before_tool(tool_name, args, ctx).await? {
            return Ok(Some(decision));
        }
    }
    Ok(None)
}

/// Runs `after_tool` across plugins in order; the first decision wins.
pub(crate) async fn run_after_tool(
    plugins: &[Arc<dyn Plugin>],
    tool_name: &str,
    result: &Value,
    ctx: &InvocationContext,
) -> Result<Option<ToolDecision>> {
    for plugin in plugins {
        if let Some(decision) = plugin.after_tool(tool_name, result, ctx).await? {
            return Ok(Some(decision));
        }
    }
    Ok(None)
}

/// Notifies every plugin of an error, swallowing handler failures.
pub(crate) async fn notify_error(
    plugins: &[Arc<dyn Plugin>],
    ctx: &InvocationContext,
    error: &Error,
) {
    for plugin in plugins {
        plugin.on_error(ctx, error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_builders() {
        let proceed = ToolDecision::proceed();
        assert!(proceed.proceed);
        assert!(proceed.reason.is_none());

        let block = ToolDecision::block("nope");
        assert!(!block.proceed);
        assert_eq!(block.reason.as_deref(), Some("nope"));

        let modify = ToolDecision::modify_args(json!({"x": 1}), "sanitized");
        assert!(modify.proceed);
        assert!(modify.modified_args.is_some());

        let rewrite = ToolDecision::modify_result(json!("redacted"), "policy");
        assert!(rewrite.proceed);
        assert_eq!(rewrite.modified_result, Some(json!("redacted")));
    }
}
