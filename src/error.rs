//! Error types for the agent engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, missing required field, or schema violation.
    /// Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The model provider returned an error. `status` carries the HTTP-like
    /// status code when the provider reported one; `None` means the failure
    /// happened below the protocol layer (connection reset, DNS, etc.).
    #[error("Model error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Model {
        status: Option<u16>,
        message: String,
    },

    /// Tool execution error. The dispatcher converts these into function
    /// responses with `error` set so the conversation can continue.
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Session not found, cannot be serialized, or otherwise unusable
    #[error("Session error: {0}")]
    Session(String),

    /// Processor chain aborted
    #[error("Flow error: {0}")]
    Flow(String),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a model error without a status code (network-level failure)
    pub fn model(msg: impl Into<String>) -> Self {
        Error::Model {
            status: None,
            message: msg.into(),
        }
    }

    /// Create a model error carrying the provider's status code
    pub fn model_status(status: u16, msg: impl Into<String>) -> Self {
        Error::Model {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new session error
    pub fn session(msg: impl Into<String>) -> Self {
        Error::Session(msg.into())
    }

    /// Create a new flow error
    pub fn flow(msg: impl Into<String>) -> Self {
        Error::Flow(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Whether a retry may succeed.
    ///
    /// Transient model failures are retryable: timeouts, network-level
    /// errors, 5xx responses, and 429 rate limits. Validation, tool,
    /// session, and flow errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Model { status: None, .. } => true,
            Error::Model {
                status: Some(code), ..
            } => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_validation() {
        let err = Error::validation("missing field");
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: missing field");
    }

    #[test]
    fn test_error_model_with_status() {
        let err = Error::model_status(503, "Service Unavailable");
        assert!(matches!(err, Error::Model { status: Some(503), .. }));
        assert_eq!(err.to_string(), "Model error (503): Service Unavailable");
    }

    #[test]
    fn test_error_model_without_status() {
        let err = Error::model("connection reset");
        assert_eq!(err.to_string(), "Model error: connection reset");
    }

    #[test]
    fn test_error_tool() {
        let err = Error::tool("Tool not found");
        assert!(matches!(err, Error::Tool(_)));
        assert_eq!(err.to_string(), "Tool execution error: Tool not found");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::timeout().is_retryable());
        assert!(Error::model("connection refused").is_retryable());
        assert!(Error::model_status(500, "internal").is_retryable());
        assert!(Error::model_status(429, "rate limited").is_retryable());
        assert!(Error::model_status(503, "unavailable").is_retryable());

        assert!(!Error::model_status(400, "bad request").is_retryable());
        assert!(!Error::model_status(404, "not found").is_retryable());
        assert!(!Error::validation("bad input").is_retryable());
        assert!(!Error::tool("boom").is_retryable());
        assert!(!Error::session("missing").is_retryable());
        assert!(!Error::flow("aborted").is_retryable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::timeout())
        }
    }
}
